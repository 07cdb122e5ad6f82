use crate::protocol::models::{JsonSchema, Tool};
use crate::{Error, Result};
use schemars::JsonSchema as DeriveSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type ToolHandler = Box<dyn Fn(Value) -> BoxFuture<Result<Value>> + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: JsonSchema,
}

/// A fully assembled invocation requested by the remote model.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub call_id: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub output: Value,
}

/// A tool described by a type rather than a closure.
pub trait ToolSpec: Send + Sync + 'static {
    type Args: DeserializeOwned + DeriveSchema + Send + 'static;
    type Output: Serialize + Send + 'static;

    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn call(&self, args: Self::Args) -> impl Future<Output = Result<Self::Output>> + Send;
}

/// Named, described, schema-typed callables the remote model may invoke.
#[derive(Default)]
pub struct ToolRegistry {
    defs: Vec<ToolDefinition>,
    handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.defs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn tool<TArgs, TResp, F, Fut>(&mut self, name: &str, handler: F)
    where
        TArgs: DeserializeOwned + DeriveSchema + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        self.register_typed(name, None, handler);
    }

    pub fn tool_with_description<TArgs, TResp, F, Fut>(
        &mut self,
        name: &str,
        description: impl Into<String>,
        handler: F,
    ) where
        TArgs: DeserializeOwned + DeriveSchema + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        self.register_typed(name, Some(description.into()), handler);
    }

    /// Register a tool with a hand-written parameter schema and untyped arguments.
    pub fn tool_raw<F, Fut>(
        &mut self,
        name: &str,
        description: impl Into<String>,
        parameters: JsonSchema,
        handler: F,
    ) where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.insert(
            ToolDefinition {
                name: name.to_string(),
                description: Some(description.into()),
                parameters,
            },
            Box::new(move |value| Box::pin(handler(value))),
        );
    }

    pub fn register<T: ToolSpec>(&mut self, spec: T) {
        let spec = Arc::new(spec);
        self.register_typed(T::NAME, Some(T::DESCRIPTION.to_string()), move |args: T::Args| {
            let spec = Arc::clone(&spec);
            async move { spec.call(args).await }
        });
    }

    fn register_typed<TArgs, TResp, F, Fut>(&mut self, name: &str, description: Option<String>, handler: F)
    where
        TArgs: DeserializeOwned + DeriveSchema + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        let schema = schemars::schema_for!(TArgs);
        let parameters = serde_json::to_value(&schema).unwrap_or_else(|err| {
            tracing::warn!(tool = name, "Tool schema did not serialize: {err}");
            serde_json::json!({ "type": "object" })
        });
        let entry = ToolDefinition {
            name: name.to_string(),
            description,
            parameters,
        };

        let tool_name = name.to_string();
        let user_handler = Arc::new(handler);
        let handler = move |value: Value| -> BoxFuture<Result<Value>> {
            let user_handler = Arc::clone(&user_handler);
            let tool_name = tool_name.clone();
            Box::pin(async move {
                let args: TArgs = serde_json::from_value(value).map_err(|e| Error::ToolExecution {
                    tool: tool_name.clone(),
                    message: format!("invalid arguments: {e}"),
                })?;
                let resp = user_handler(args).await?;
                serde_json::to_value(resp).map_err(|e| Error::ToolExecution {
                    tool: tool_name,
                    message: format!("unserializable result: {e}"),
                })
            })
        };

        self.insert(entry, Box::new(handler));
    }

    fn insert(&mut self, def: ToolDefinition, handler: ToolHandler) {
        if let Some(existing) = self.defs.iter_mut().find(|d| d.name == def.name) {
            tracing::debug!(tool = %def.name, "Replacing previously registered tool");
            *existing = def.clone();
        } else {
            self.defs.push(def.clone());
        }
        self.handlers.insert(def.name, handler);
    }

    /// Protocol-level schemas for `session.update`.
    #[must_use]
    pub fn as_tools(&self) -> Vec<Tool> {
        self.defs
            .iter()
            .map(|def| Tool::Function {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            })
            .collect()
    }

    /// Dispatch a tool call to the registered handler.
    ///
    /// # Errors
    /// Returns [`Error::UnknownTool`] if nothing is registered under the name, and
    /// [`Error::ToolExecution`] if the handler fails.
    pub async fn dispatch(&self, call: ToolCall) -> Result<ToolResult> {
        let handler = self
            .handlers
            .get(&call.name)
            .ok_or_else(|| Error::UnknownTool(call.name.clone()))?;
        let output = handler(call.arguments).await.map_err(|err| match err {
            err @ Error::ToolExecution { .. } => err,
            other => Error::ToolExecution {
                tool: call.name.clone(),
                message: other.to_string(),
            },
        })?;
        Ok(ToolResult { call_id: call.call_id, output })
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("defs", &self.defs).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, DeriveSchema)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn typed_tool_receives_parsed_arguments() {
        let mut tools = ToolRegistry::new();
        tools.tool("add", |args: AddArgs| async move { Ok(args.a + args.b) });

        let result = tools
            .dispatch(ToolCall { name: "add".into(), call_id: "c1".into(), arguments: json!({"a": 2, "b": 3}) })
            .await
            .unwrap();
        assert_eq!(result, ToolResult { call_id: "c1".into(), output: json!(5) });
    }

    #[tokio::test]
    async fn bad_arguments_are_tool_errors() {
        let mut tools = ToolRegistry::new();
        tools.tool("add", |args: AddArgs| async move { Ok(args.a + args.b) });

        let err = tools
            .dispatch(ToolCall { name: "add".into(), call_id: "c1".into(), arguments: json!({"a": "x"}) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolExecution { tool, .. } if tool == "add"));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let tools = ToolRegistry::new();
        let err = tools
            .dispatch(ToolCall { name: "nope".into(), call_id: "c1".into(), arguments: json!({}) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTool(name) if name == "nope"));
    }

    #[test]
    fn re_registering_replaces_definition() {
        let mut tools = ToolRegistry::new();
        tools.tool_raw("echo", "first", json!({"type": "object"}), |v| async move { Ok(v) });
        tools.tool_raw("echo", "second", json!({"type": "object"}), |v| async move { Ok(v) });
        assert_eq!(tools.definitions().len(), 1);
        assert_eq!(tools.definitions()[0].description.as_deref(), Some("second"));
    }
}
