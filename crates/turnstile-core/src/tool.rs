use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ToolParameters,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ToolParameters::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: ToolParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: HashMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(rename = "additionalProperties", default)]
    pub additional_properties: bool,
}

impl Default for ToolParameters {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: HashMap::new(),
            required: Vec::new(),
            additional_properties: false,
        }
    }
}

impl ToolParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property(
        mut self,
        name: impl Into<String>,
        schema: PropertySchema,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), schema);
        if required {
            self.required.push(name);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl PropertySchema {
    fn typed(schema_type: &str, description: impl Into<String>) -> Self {
        Self {
            schema_type: schema_type.to_string(),
            description: Some(description.into()),
            enum_values: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::typed("string", description)
    }

    pub fn enum_string(description: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            enum_values: Some(values),
            ..Self::typed("string", description)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, Error>;
}

/// The single seam through which the orchestrator runs tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute_tool(&self, name: &str, arguments: Value) -> Result<String, Error>;

    /// Definitions advertised to the model.
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute_tool(&self, name: &str, arguments: Value) -> Result<String, Error> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::tool(name, format!("unknown tool '{name}'")))?;

        let output = tool.execute(arguments).await?;
        if output.is_error {
            Err(Error::tool(name, output.content))
        } else {
            Ok(output.content)
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("upper", "Uppercase a string").with_parameters(
                ToolParameters::new().add_property("text", PropertySchema::string("Input"), true),
            )
        }

        async fn execute(&self, arguments: Value) -> Result<ToolOutput, Error> {
            match arguments.get("text").and_then(Value::as_str) {
                Some(text) => Ok(ToolOutput::success(text.to_uppercase())),
                None => Ok(ToolOutput::error("missing 'text'")),
            }
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Upper));
        registry
    }

    #[test]
    fn test_tool_definition() {
        let def = Upper.definition();
        assert_eq!(def.name, "upper");
        assert!(def.parameters.required.contains(&"text".to_string()));
    }

    #[test]
    fn test_property_schema() {
        let enum_schema =
            PropertySchema::enum_string("A choice", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(enum_schema.schema_type, "string");
        assert_eq!(enum_schema.enum_values.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_registry_executes() {
        let result = registry()
            .execute_tool("upper", serde_json::json!({"text": "abc"}))
            .await
            .unwrap();
        assert_eq!(result, "ABC");
    }

    #[tokio::test]
    async fn test_registry_error_output_names_tool() {
        let err = registry()
            .execute_tool("upper", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool { ref tool, .. } if tool == "upper"));
    }

    #[tokio::test]
    async fn test_registry_unknown_tool() {
        let err = registry()
            .execute_tool("nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert_eq!(registry().definitions().len(), 1);
    }
}
