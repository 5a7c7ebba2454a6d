//! # Tools and the tool registry
//!
//! The model can pause a round and ask for a tool by name. This module defines what a
//! tool is, how its schema is advertised to the model, and how a name is resolved to
//! a handler at dispatch time.
//!
//! ## Concepts
//!
//! 1. **Tool** - name, description, JSON Schema for its input, and an async handler.
//! 2. **ToolRegistry** - the name → handler map the orchestration loop dispatches
//!    through. Adding a tool never touches the loop.
//! 3. **Knowledge-base tools** - [`query_db`] and [`fetch_metadata`] carry the
//!    production names, descriptions and schemas; the search backends behind them are
//!    supplied by the caller as handlers.
//!
//! ## Schema notation
//!
//! Schemas may be written in a short form and are normalized to JSON Schema:
//!
//! - **Simple notation**: `{"query": "string"}`
//! - **Typed schema**: `{"limit": {"type": "integer", "optional": true}}`
//! - **Full JSON Schema**: passed through unchanged
//!
//! ## Example
//!
//! ```rust,no_run
//! use kb_chat::{ToolRegistry, query_db, tool};
//! use serde_json::json;
//!
//! let registry = ToolRegistry::new()
//!     .with(query_db(|args| async move {
//!         let query = args["query"].as_str().unwrap_or_default().to_string();
//!         Ok(json!({"results": [], "query": query}))
//!     }))
//!     .with(tool("today", "Return today's date").build(|_| async move {
//!         Ok(json!({"date": "2026-10-16"}))
//!     }));
//!
//! assert!(registry.get("query_db").is_some());
//! ```

use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Type alias for tool handler functions.
///
/// ```text
/// Arc<                                      // shared by the registry and clones
///   dyn Fn(Value)                           // JSON arguments in
///     -> Pin<Box<
///       dyn Future<Output = Result<Value>>  // JSON payload out
///         + Send>>
///     + Send + Sync>
/// ```
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// A tool the model may call.
///
/// Cloning is cheap: the handler is behind an [`Arc`].
#[derive(Clone)]
pub struct Tool {
    /// Name the model uses to request the tool, e.g. `query_db`
    name: String,

    /// Sent to the model; drives when it chooses the tool
    description: String,

    /// JSON Schema (`type: object`) describing the arguments
    input_schema: Value,

    handler: ToolHandler,
}

impl Tool {
    /// Create a new tool.
    ///
    /// `input_schema` accepts simple notation, typed property schemas, or full JSON
    /// Schema (see the module docs).
    ///
    /// ```rust,no_run
    /// use kb_chat::Tool;
    /// use serde_json::json;
    ///
    /// let lookup = Tool::new(
    ///     "lookup_course",
    ///     "Look up a course by its code",
    ///     json!({"code": "string"}),
    ///     |args| async move {
    ///         Ok(json!({"code": args["code"], "title": "Intro to Rust"}))
    ///     },
    /// );
    /// ```
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: normalize_schema(input_schema),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Run the handler
    pub async fn execute(&self, arguments: Value) -> Result<Value> {
        (self.handler)(arguments).await
    }

    /// The tool in the provider's request format:
    /// `{"name", "description", "input_schema"}`
    pub fn to_schema(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish()
    }
}

/// Why a tool invocation produced no payload.
///
/// Both variants are reported back to the model in-band as an error tool result.
#[derive(Error, Debug)]
pub enum ToolError {
    /// No tool with that name is registered
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    /// The handler ran and failed
    #[error("Tool '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

impl ToolError {
    /// The payload sent back to the model for this failure
    pub fn to_payload(&self) -> Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

/// Name → handler map used for dispatch.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<Tool>>,

    /// Registration order, so schemas are sent in a stable order
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: Tool) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            log::warn!("Tool '{}' registered twice; keeping the latest", name);
        } else {
            self.order.push(name);
        }
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, tool: Tool) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name).map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Tool schemas for the request, in registration order
    pub fn schemas(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.to_schema())
            .collect()
    }

    /// Look up `name` and run it with `arguments`.
    pub async fn invoke(&self, name: &str, arguments: Value) -> std::result::Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        tool.execute(arguments).await.map_err(|e| ToolError::Failed {
            name: name.to_string(),
            message: e.to_string(),
        })
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

/// `query_db`: free-text query against the knowledge base's vector index.
pub fn query_db<F, Fut>(handler: F) -> Tool
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Tool::new(
        "query_db",
        "Query a vector database for any information in your knowledge base. \
         Try to use specific key words when possible.",
        serde_json::json!({
            "query": {
                "type": "string",
                "description": "The query you want to make to the vector database."
            }
        }),
        handler,
    )
}

/// `fetch_metadata`: key-filtered lookup in the knowledge bucket's metadata file.
pub fn fetch_metadata<F, Fut>(handler: F) -> Tool
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Tool::new(
        "fetch_metadata",
        "Retrieve metadata information from metadata.txt in the same knowledge bucket.",
        serde_json::json!({
            "filter_key": {
                "type": "string",
                "description": "Filter metadata by a specific key."
            }
        }),
        handler,
    )
}

/// Normalize short-form schemas to a JSON Schema object.
///
/// Required-ness of typed properties, in priority order: explicit `required: true`,
/// then `optional: true` / `required: false`, then presence of `default`, else required.
fn normalize_schema(schema: Value) -> Value {
    let Value::Object(obj) = schema else {
        return serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        });
    };

    if obj.contains_key("type") && obj.contains_key("properties") {
        return Value::Object(obj);
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for (param_name, param_type) in obj {
        match param_type {
            Value::String(type_str) => {
                properties.insert(param_name.clone(), type_to_json_schema(&type_str));
                required.push(param_name);
            }
            Value::Object(mut prop) => {
                let is_optional = prop
                    .remove("optional")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let is_required = prop.remove("required").and_then(|v| v.as_bool());
                let has_default = prop.contains_key("default");

                properties.insert(param_name.clone(), Value::Object(prop));

                match is_required {
                    Some(true) => required.push(param_name),
                    Some(false) => {}
                    None if is_optional || has_default => {}
                    None => required.push(param_name),
                }
            }
            other => {
                log::warn!(
                    "Ignoring schema entry '{}' with unsupported shape: {}",
                    param_name,
                    other
                );
            }
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

fn type_to_json_schema(type_str: &str) -> Value {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        // Unknown names fall back to string
        _ => "string",
    };

    serde_json::json!({ "type": json_type })
}

/// Builder for [`Tool`] with simple parameter notation.
pub struct ToolBuilder {
    name: String,
    description: String,
    schema: Value,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({}),
        }
    }

    /// Replace the schema entirely
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// Add a required parameter in simple notation
    pub fn param(mut self, name: &str, type_str: &str) -> Self {
        if !self.schema.is_object() {
            self.schema = serde_json::json!({});
        }
        if let Some(obj) = self.schema.as_object_mut() {
            obj.insert(name.to_string(), Value::String(type_str.to_string()));
        }
        self
    }

    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Tool::new(self.name, self.description, self.schema, handler)
    }
}

/// Start building a tool
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name, description)
}
