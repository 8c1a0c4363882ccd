use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use runloop_types::{ToolCategory, ToolOutput, ToolSchema};

/// A capability the model can call. Implementations return their own
/// failures as `ToolOutput { success: false, .. }`; an `Err` means the tool
/// itself broke and counts against its category's circuit breaker.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    fn category(&self) -> ToolCategory {
        ToolCategory::general()
    }

    /// Side-effect-free tools may run concurrently with each other.
    fn parallel_safe(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutput>;

    async fn execute_with_cancel(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutput> {
        self.execute(args).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    Duplicate(String),
    InvalidSchema(ToolSchemaValidationError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Duplicate(name) => write!(f, "tool `{name}` is already registered"),
            RegistryError::InvalidSchema(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Tools keyed by name. Registration is an explicit insert; nothing is
/// discovered implicitly.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<BTreeMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let schema = tool.schema();
        validate_tool_schemas(std::slice::from_ref(&schema)).map_err(RegistryError::InvalidSchema)?;
        let mut tools = self.tools.write().await;
        if tools.contains_key(&schema.name) {
            return Err(RegistryError::Duplicate(schema.name));
        }
        tracing::debug!(tool = %schema.name, category = %tool.category(), "tool registered");
        tools.insert(schema.name, tool);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        self.tools.read().await.values().map(|t| t.schema()).collect()
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }
}

type ToolFn = dyn Fn(Value, CancellationToken) -> BoxFuture<'static, anyhow::Result<ToolOutput>>
    + Send
    + Sync;

/// Closure-backed tool for embedding callers and tests.
pub struct FnTool {
    schema: ToolSchema,
    category: ToolCategory,
    parallel_safe: bool,
    handler: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F>(name: &str, description: &str, input_schema: Value, handler: F) -> Self
    where
        F: Fn(Value, CancellationToken) -> BoxFuture<'static, anyhow::Result<ToolOutput>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            schema: ToolSchema {
                name: name.to_string(),
                description: description.to_string(),
                input_schema,
            },
            category: ToolCategory::general(),
            parallel_safe: false,
            handler: Box::new(handler),
        }
    }

    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_parallel_safe(mut self, parallel_safe: bool) -> Self {
        self.parallel_safe = parallel_safe;
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    fn category(&self) -> ToolCategory {
        self.category.clone()
    }

    fn parallel_safe(&self) -> bool {
        self.parallel_safe
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutput> {
        (self.handler)(args, CancellationToken::new()).await
    }

    async fn execute_with_cancel(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutput> {
        (self.handler)(args, cancel).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        if schema.name.trim().is_empty() {
            return Err(ToolSchemaValidationError {
                tool_name: schema.name.clone(),
                path: "$".to_string(),
                reason: "tool name is empty".to_string(),
            });
        }
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    let invalid = |reason: &str| ToolSchemaValidationError {
        tool_name: tool_name.to_string(),
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(invalid("array schema missing items"));
    }
    if let Some(required) = obj.get("required") {
        let Some(required) = required.as_array() else {
            return Err(invalid("required must be an array"));
        };
        if required.iter().any(|r| !r.is_string()) {
            return Err(invalid("required entries must be strings"));
        }
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    if let Some(additional) = obj.get("additionalProperties") {
        validate_schema_node(tool_name, &format!("{path}.additionalProperties"), additional)?;
    }
    for keyword in ["oneOf", "anyOf", "allOf"] {
        if let Some(children) = obj.get(keyword).and_then(|v| v.as_array()) {
            for (idx, child) in children.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{keyword}[{idx}]"), child)?;
            }
        }
    }

    Ok(())
}

/// Checks top-level `required` properties of an object schema against the
/// arguments the model produced. Returns the missing names.
pub fn missing_required_arguments(schema: &ToolSchema, args: &Value) -> Vec<String> {
    let Some(required) = schema
        .input_schema
        .get("required")
        .and_then(|v| v.as_array())
    else {
        return Vec::new();
    };
    required
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|name| args.get(name).map_or(true, Value::is_null))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;

    fn echo_tool(name: &str) -> Arc<dyn Tool> {
        Arc::new(
            FnTool::new(
                name,
                "echo the text argument",
                json!({"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}),
                |args, _cancel| {
                    async move {
                        let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
                        Ok(ToolOutput::ok(text))
                    }
                    .boxed()
                },
            )
            .with_category(ToolCategory::network_lookup())
            .with_parallel_safe(true),
        )
    }

    #[test]
    fn validator_rejects_array_without_items() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"todos":{"type":"array"}}
            }),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected schema validation failure");
        assert_eq!(err.tool_name, "bad");
        assert!(err.path.contains("properties.todos"));
    }

    #[test]
    fn validator_rejects_non_string_required() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: String::new(),
            input_schema: json!({"type":"object","required":[1]}),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected failure");
        assert_eq!(err.reason, "required entries must be strings");
    }

    #[tokio::test]
    async fn registry_rejects_duplicate_names() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("echo")).await.expect("first insert");
        let err = registry
            .register(echo_tool("echo"))
            .await
            .expect_err("duplicate insert");
        assert_eq!(err, RegistryError::Duplicate("echo".to_string()));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn registered_tool_keeps_declared_capabilities() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("echo")).await.expect("insert");
        let tool = registry.get("echo").await.expect("registered");
        assert!(tool.parallel_safe());
        assert_eq!(tool.category(), ToolCategory::network_lookup());
        let out = tool.execute(json!({"text":"hi"})).await.expect("execute");
        assert_eq!(out.output, "hi");
        assert!(registry.get("missing").await.is_none());
    }

    #[test]
    fn missing_required_arguments_reports_absent_and_null() {
        let schema = ToolSchema {
            name: "t".to_string(),
            description: String::new(),
            input_schema: json!({"type":"object","required":["a","b","c"]}),
        };
        let missing = missing_required_arguments(&schema, &json!({"a":1,"b":null}));
        assert_eq!(missing, vec!["b".to_string(), "c".to_string()]);
    }
}
