//! Tool registration and execution support for the chat loop.
//!
//! Tools are registered by name with a description and a JSON-schema
//! parameter declaration. [`Tool::new`] takes raw JSON arguments;
//! [`Tool::typed`] deserializes arguments into a typed struct first, so a
//! shape mismatch surfaces as an ordinary invocation failure rather than a
//! panic. Invocation failures are never fatal to a conversation; the caller
//! serializes them into a [`failure_payload`] the model can read and react to.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::traits::ToolDefinition;

/// Error type tool handlers may fail with.
pub type ToolError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one tool invocation.
pub type ToolOutput = std::result::Result<JsonValue, ToolError>;

type Handler = Arc<dyn Fn(JsonValue) -> BoxFuture<'static, ToolOutput> + Send + Sync>;

/// A named, schema-declared, asynchronously callable tool.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    parameters: JsonValue,
    handler: Handler,
}

impl Tool {
    /// Register a tool over raw JSON arguments.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: JsonValue,
        handler: F,
    ) -> Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ToolOutput> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args| handler(args).boxed()),
        }
    }

    /// Register a tool whose arguments are deserialized into `A` before the
    /// handler runs and whose result is serialized back to JSON.
    ///
    /// Deserialization failure counts as an invocation failure, mirroring
    /// signature-validated calls: the model sees the mismatch, the caller
    /// does not.
    pub fn typed<A, R, F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: JsonValue,
        handler: F,
    ) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<R, ToolError>> + Send + 'static,
    {
        Self::new(name, description, parameters, move |raw: JsonValue| {
            let parsed: std::result::Result<A, _> = serde_json::from_value(raw);
            let fut = parsed.map(&handler);
            async move {
                match fut {
                    Ok(fut) => {
                        let result = fut.await?;
                        Ok(serde_json::to_value(result)?)
                    }
                    Err(e) => Err(ToolError::from(e)),
                }
            }
        })
    }

    /// Tool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tool description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Wire declaration for this tool, with open-ended properties disallowed.
    pub fn definition(&self) -> ToolDefinition {
        let mut parameters = self.parameters.clone();
        if let Some(schema) = parameters.as_object_mut() {
            schema.insert("additionalProperties".to_string(), json!(false));
        }
        ToolDefinition::function(&self.name, &self.description, parameters)
    }

    /// Invoke the handler with parsed JSON arguments.
    pub async fn invoke(&self, arguments: JsonValue) -> ToolOutput {
        (self.handler)(arguments).await
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Tools registered by name for one chat backend.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Tool>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name, replacing any previous entry.
    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Wire declarations for every registered tool, in name order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(Tool::definition).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Structured payload substituted for a failed tool invocation.
///
/// Returned to the model as the tool's textual result: a result marker, the
/// failure category and message, and the call-site context (tool name and the
/// arguments it was invoked with).
pub fn failure_payload(kind: &str, message: &str, tool_name: &str, arguments: &JsonValue) -> String {
    let payload = json!({
        "RESULT": "Error, did not complete successfully",
        "ERROR_KIND": kind,
        "ERROR_MESSAGE": message,
        "CALL_CONTEXT": {
            "TOOL": tool_name,
            "ARGUMENTS": arguments,
        },
    });
    serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string())
}
