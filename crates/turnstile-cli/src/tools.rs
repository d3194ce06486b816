//! Tools the CLI registers with the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;

use turnstile_core::{Error, PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters, ToolRegistry};

const DEFAULT_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";

/// Reports the current date and time.
pub struct CurrentTimeTool;

#[derive(Deserialize)]
struct CurrentTimeArgs {
    #[serde(default)]
    timezone: Option<String>,
    /// strftime-style format string
    #[serde(default)]
    format: Option<String>,
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), "Get the current date and time").with_parameters(
            ToolParameters::new()
                .add_property(
                    "timezone",
                    PropertySchema::enum_string(
                        "Report in UTC or the machine's local time (default: local)",
                        vec!["utc".to_string(), "local".to_string()],
                    ),
                    false,
                )
                .add_property(
                    "format",
                    PropertySchema::string("strftime format, e.g. '%A %d %B %Y'"),
                    false,
                ),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let args: CurrentTimeArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::tool(self.name(), format!("Invalid arguments: {e}")))?;

        let format = args.format.as_deref().unwrap_or(DEFAULT_FORMAT);
        let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            return Ok(ToolOutput::error(format!("Invalid format string: {format}")));
        }

        let text = match args.timezone.as_deref().unwrap_or("local") {
            "utc" | "UTC" => chrono::Utc::now()
                .format_with_items(items.iter())
                .to_string(),
            "local" => chrono::Local::now()
                .format_with_items(items.iter())
                .to_string(),
            other => return Ok(ToolOutput::error(format!("Unknown timezone: {other}"))),
        };
        Ok(ToolOutput::success(text))
    }
}

/// Registry of every built-in tool.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CurrentTimeTool));
    registry
}
