//! Chart generation tool.
//!
//! Renders model-supplied series through a [`ChartRenderer`] and always pairs
//! the image with a plain-text tabular summary, so the data survives even
//! when the image cannot be displayed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::tool::{Idempotency, Tool, ToolContext, optional_str, require_str};

/// One named data series.
#[derive(Debug, Clone)]
pub struct Series {
    pub name: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct ChartSpec {
    pub kind: String,
    pub title: Option<String>,
    pub labels: Vec<String>,
    pub series: Vec<Series>,
}

/// Turns a chart spec into a fetchable image reference.
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(&self, spec: &ChartSpec) -> Result<String, ToolError>;
}

/// Renderer backed by the QuickChart service: the chart config is encoded
/// into a URL and the image is rendered on fetch, no API key needed.
pub struct QuickChartRenderer {
    base_url: String,
}

impl QuickChartRenderer {
    pub fn new() -> Self {
        Self {
            base_url: "https://quickchart.io/chart".to_string(),
        }
    }
}

impl Default for QuickChartRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChartRenderer for QuickChartRenderer {
    async fn render(&self, spec: &ChartSpec) -> Result<String, ToolError> {
        let config = json!({
            "type": spec.kind,
            "data": {
                "labels": spec.labels,
                "datasets": spec.series.iter().map(|s| json!({
                    "label": s.name,
                    "data": s.values
                })).collect::<Vec<_>>()
            },
            "options": {
                "title": {
                    "display": spec.title.is_some(),
                    "text": spec.title.as_deref().unwrap_or("")
                }
            }
        });
        let encoded: String = url_encode(&config.to_string());
        Ok(format!("{}?c={}", self.base_url, encoded))
    }
}

fn url_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 3);
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

const SUPPORTED_KINDS: &[&str] = &["bar", "line", "pie", "doughnut"];

pub struct ChartTool {
    renderer: Arc<dyn ChartRenderer>,
}

impl ChartTool {
    pub fn new(renderer: Arc<dyn ChartRenderer>) -> Self {
        Self { renderer }
    }

    fn parse_spec(&self, args: &Value) -> Result<ChartSpec, ToolError> {
        let kind = require_str(args, "kind", self.name())?.to_ascii_lowercase();
        if !SUPPORTED_KINDS.contains(&kind.as_str()) {
            return Err(ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: format!(
                    "unsupported chart kind '{kind}', expected one of {SUPPORTED_KINDS:?}"
                ),
            });
        }

        let labels: Vec<String> = args
            .get("labels")
            .and_then(Value::as_array)
            .map(|l| {
                l.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let series: Vec<Series> = args
            .get("series")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let name = entry.get("name")?.as_str()?.to_string();
                        let values = entry
                            .get("values")?
                            .as_array()?
                            .iter()
                            .filter_map(Value::as_f64)
                            .collect();
                        Some(Series { name, values })
                    })
                    .collect()
            })
            .unwrap_or_default();

        if labels.is_empty() || series.is_empty() {
            return Err(ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: "both 'labels' and 'series' must be non-empty".to_string(),
            });
        }
        for s in &series {
            if s.values.len() != labels.len() {
                return Err(ToolError::InvalidParameters {
                    name: self.name().to_string(),
                    reason: format!(
                        "series '{}' has {} values for {} labels",
                        s.name,
                        s.values.len(),
                        labels.len()
                    ),
                });
            }
        }

        Ok(ChartSpec {
            kind,
            title: optional_str(args, "title").map(str::to_string),
            labels,
            series,
        })
    }
}

#[async_trait]
impl Tool for ChartTool {
    fn name(&self) -> &str {
        "render_chart"
    }

    fn description(&self) -> &str {
        "Render a chart (bar, line, pie or doughnut) from labeled data \
         series. Returns an image link plus a text table of the same data."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "kind": {
                    "type": "string",
                    "enum": SUPPORTED_KINDS,
                    "description": "Chart type"
                },
                "title": { "type": "string" },
                "labels": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Category labels, one per data point"
                },
                "series": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "values": { "type": "array", "items": { "type": "number" } }
                        },
                        "required": ["name", "values"]
                    }
                }
            },
            "required": ["kind", "labels", "series"]
        })
    }

    fn idempotency(&self) -> Idempotency {
        Idempotency::ReadOnly
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let spec = self.parse_spec(&args)?;
        let image_url = self.renderer.render(&spec).await?;
        Ok(json!({
            "image_url": image_url,
            "summary": tabular_summary(&spec)
        }))
    }
}

/// Plain-text table of the charted data.
fn tabular_summary(spec: &ChartSpec) -> String {
    let mut lines = Vec::with_capacity(spec.labels.len() + 1);
    let header: Vec<&str> = std::iter::once("label")
        .chain(spec.series.iter().map(|s| s.name.as_str()))
        .collect();
    lines.push(header.join(" | "));
    for (i, label) in spec.labels.iter().enumerate() {
        let row: Vec<String> = std::iter::once(label.clone())
            .chain(spec.series.iter().map(|s| s.values[i].to_string()))
            .collect();
        lines.push(row.join(" | "));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRenderer;

    #[async_trait]
    impl ChartRenderer for FixedRenderer {
        async fn render(&self, _spec: &ChartSpec) -> Result<String, ToolError> {
            Ok("https://charts.example/abc.png".to_string())
        }
    }

    fn ctx() -> ToolContext {
        ToolContext { user_id: 1 }
    }

    #[tokio::test]
    async fn renders_image_and_summary() {
        let tool = ChartTool::new(Arc::new(FixedRenderer));
        let result = tool
            .execute(
                json!({
                    "kind": "bar",
                    "labels": ["Q1", "Q2"],
                    "series": [{ "name": "revenue", "values": [10.0, 20.0] }]
                }),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result["image_url"], "https://charts.example/abc.png");
        let summary = result["summary"].as_str().unwrap();
        assert!(summary.contains("label | revenue"));
        assert!(summary.contains("Q2 | 20"));
    }

    #[tokio::test]
    async fn mismatched_series_length_rejected() {
        let tool = ChartTool::new(Arc::new(FixedRenderer));
        let result = tool
            .execute(
                json!({
                    "kind": "line",
                    "labels": ["a", "b", "c"],
                    "series": [{ "name": "s", "values": [1.0] }]
                }),
                &ctx(),
            )
            .await;
        assert!(matches!(result, Err(ToolError::InvalidParameters { .. })));
    }

    #[tokio::test]
    async fn unknown_kind_rejected() {
        let tool = ChartTool::new(Arc::new(FixedRenderer));
        let result = tool
            .execute(
                json!({
                    "kind": "scatter3d",
                    "labels": ["a"],
                    "series": [{ "name": "s", "values": [1.0] }]
                }),
                &ctx(),
            )
            .await;
        assert!(matches!(result, Err(ToolError::InvalidParameters { .. })));
    }

    #[tokio::test]
    async fn quickchart_url_encodes_config() {
        let renderer = QuickChartRenderer::new();
        let url = renderer
            .render(&ChartSpec {
                kind: "bar".into(),
                title: None,
                labels: vec!["a b".into()],
                series: vec![Series {
                    name: "s".into(),
                    values: vec![1.0],
                }],
            })
            .await
            .unwrap();
        assert!(url.starts_with("https://quickchart.io/chart?c=%7B"));
        assert!(!url.contains(' '));
    }
}
