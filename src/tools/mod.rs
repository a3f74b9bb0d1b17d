//! Tool adapters for agent capabilities.

pub mod calendar;
pub mod chart;
pub mod drive;
pub mod gateway;
pub mod mail;
pub mod registry;
pub mod sheets;
pub mod tool;
pub mod web;

pub use registry::ToolRegistry;
pub use tool::{Idempotency, Tool, ToolContext};

use std::sync::Arc;

use crate::accounts::LinkedAccounts;
use crate::error::ConfigError;
use crate::ingest::WebExtractor;
use chart::ChartRenderer;
use gateway::WorkspaceClient;

/// Build and validate the standard tool set.
pub async fn standard_registry(
    accounts: Arc<LinkedAccounts>,
    workspace: Arc<dyn WorkspaceClient>,
    renderer: Arc<dyn ChartRenderer>,
    extractor: Arc<dyn WebExtractor>,
    url_content_limit: usize,
) -> Result<ToolRegistry, ConfigError> {
    let registry = ToolRegistry::new();
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(mail::ListMailTool::new(
            Arc::clone(&accounts),
            Arc::clone(&workspace),
        )),
        Arc::new(mail::SendMailTool::new(
            Arc::clone(&accounts),
            Arc::clone(&workspace),
        )),
        Arc::new(calendar::ListEventsTool::new(
            Arc::clone(&accounts),
            Arc::clone(&workspace),
        )),
        Arc::new(calendar::CreateEventTool::new(
            Arc::clone(&accounts),
            Arc::clone(&workspace),
        )),
        Arc::new(calendar::ScheduleMeetingTool::new(
            Arc::clone(&accounts),
            Arc::clone(&workspace),
        )),
        Arc::new(drive::SearchFilesTool::new(
            Arc::clone(&accounts),
            Arc::clone(&workspace),
        )),
        Arc::new(sheets::ReadSheetTool::new(
            Arc::clone(&accounts),
            Arc::clone(&workspace),
        )),
        Arc::new(sheets::AppendSheetRowTool::new(
            Arc::clone(&accounts),
            Arc::clone(&workspace),
        )),
        Arc::new(chart::ChartTool::new(renderer)),
        Arc::new(web::FetchUrlTool::new(extractor, url_content_limit)),
    ];
    for tool in tools {
        registry.register(tool).await?;
    }
    Ok(registry)
}
