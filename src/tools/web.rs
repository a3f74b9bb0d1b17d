//! Web page fetch tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::ingest::{WebExtractor, truncate_to_boundary};
use crate::tools::tool::{Idempotency, Tool, ToolContext, require_str};

/// Fetch readable text from a public web page. Shares the same extractor as
/// inbound URL normalization, and the same content cap.
pub struct FetchUrlTool {
    extractor: Arc<dyn WebExtractor>,
    content_limit: usize,
}

impl FetchUrlTool {
    pub fn new(extractor: Arc<dyn WebExtractor>, content_limit: usize) -> Self {
        Self {
            extractor,
            content_limit,
        }
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch the readable text content of a public web page by URL."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The http(s) URL to fetch" }
            },
            "required": ["url"]
        })
    }

    fn idempotency(&self) -> Idempotency {
        Idempotency::ReadOnly
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let url = require_str(&args, "url", self.name())?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: "url must start with http:// or https://".to_string(),
            });
        }

        let mut content =
            self.extractor
                .extract(url)
                .await
                .map_err(|reason| ToolError::ExecutionFailed {
                    name: self.name().to_string(),
                    reason,
                })?;
        let truncated = content.len() > self.content_limit;
        if truncated {
            truncate_to_boundary(&mut content, self.content_limit);
        }
        Ok(json!({ "url": url, "content": content, "truncated": truncated }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedExtractor(Result<String, String>);

    #[async_trait]
    impl WebExtractor for FixedExtractor {
        async fn extract(&self, _url: &str) -> Result<String, String> {
            self.0.clone()
        }
    }

    fn ctx() -> ToolContext {
        ToolContext { user_id: 1 }
    }

    #[tokio::test]
    async fn fetches_and_truncates() {
        let tool = FetchUrlTool::new(Arc::new(FixedExtractor(Ok("x".repeat(100)))), 40);
        let result = tool
            .execute(json!({"url": "https://example.com"}), &ctx())
            .await
            .unwrap();
        assert_eq!(result["content"].as_str().unwrap().len(), 40);
        assert_eq!(result["truncated"], true);
    }

    #[tokio::test]
    async fn truncation_respects_character_boundaries() {
        // 39 ASCII bytes, then a two-byte char straddling the 40-byte cap.
        let page = format!("{}é plus trailing text", "x".repeat(39));
        let tool = FetchUrlTool::new(Arc::new(FixedExtractor(Ok(page))), 40);
        let result = tool
            .execute(json!({"url": "https://example.com"}), &ctx())
            .await
            .unwrap();
        assert_eq!(result["content"].as_str().unwrap(), "x".repeat(39));
        assert_eq!(result["truncated"], true);
    }

    #[tokio::test]
    async fn non_http_url_rejected() {
        let tool = FetchUrlTool::new(Arc::new(FixedExtractor(Ok(String::new()))), 40);
        let result = tool.execute(json!({"url": "file:///etc/passwd"}), &ctx()).await;
        assert!(matches!(result, Err(ToolError::InvalidParameters { .. })));
    }

    #[tokio::test]
    async fn extraction_failure_surfaces() {
        let tool = FetchUrlTool::new(Arc::new(FixedExtractor(Err("503".into()))), 40);
        let result = tool.execute(json!({"url": "https://example.com"}), &ctx()).await;
        assert!(matches!(result, Err(ToolError::ExecutionFailed { .. })));
    }
}
