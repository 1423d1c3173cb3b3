//! Tool trait and input schema contract
//!
//! Tools are read-only calls against external collaborators. The core only
//! sees `call(input) -> data | ToolFailure`; HTTP-backed finance tools live in
//! the submodules.

use crate::error::ToolFailure;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

pub mod invoker;
pub mod market;
pub mod search;

pub use invoker::{Invocation, ToolInvoker};
pub use market::{MarketDataClient, MarketDataTool, MarketOperation};
pub use search::LinkupSearchTool;

/// A single external capability bound to a handler
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> &ToolSchema;

    /// Shape of a successful result, when the collaborator documents one.
    fn result_schema(&self) -> Option<&ToolSchema> {
        None
    }

    async fn call(&self, input: &Value) -> std::result::Result<Value, ToolFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Field {
    name: String,
    field_type: FieldType,
    required: bool,
}

/// Contract of a tool payload: a JSON object with typed fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolSchema {
    fields: Vec<Field>,
}

impl ToolSchema {
    pub fn object() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            field_type,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            field_type,
            required: false,
        });
        self
    }

    pub fn requires(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.required && f.name == name)
    }

    pub fn accepts_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// Check an input payload. Unknown fields are allowed.
    pub fn validate(&self, input: &Value) -> std::result::Result<(), String> {
        let object = input
            .as_object()
            .ok_or_else(|| "tool input must be a JSON object".to_string())?;

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.field_type.accepts(value) => {
                    return Err(format!(
                        "field '{}' must be of type {}",
                        field.name,
                        field.field_type.as_str()
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// JSON-schema rendering, for discovery endpoints.
    pub fn to_json(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            properties.insert(
                field.name.clone(),
                json!({ "type": field.field_type.as_str() }),
            );
        }

        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted tools for exercising the pipeline without a network.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    pub(crate) struct ScriptedTool {
        name: String,
        schema: ToolSchema,
        result_schema: Option<ToolSchema>,
        script: Mutex<VecDeque<std::result::Result<Value, ToolFailure>>>,
        fallback: std::result::Result<Value, ToolFailure>,
        delay: Duration,
        calls: AtomicU32,
        abandoned: Arc<AtomicBool>,
    }

    /// Flags the tool as abandoned if its future is dropped before finishing.
    struct AbandonGuard {
        flag: Arc<AtomicBool>,
        armed: bool,
    }

    impl Drop for AbandonGuard {
        fn drop(&mut self) {
            if self.armed {
                self.flag.store(true, Ordering::SeqCst);
            }
        }
    }

    impl ScriptedTool {
        pub(crate) fn ok(name: &str, data: Value) -> Self {
            Self::with_result(name, Ok(data))
        }

        pub(crate) fn failing(name: &str, failure: ToolFailure) -> Self {
            Self::with_result(name, Err(failure))
        }

        fn with_result(name: &str, fallback: std::result::Result<Value, ToolFailure>) -> Self {
            Self {
                name: name.to_string(),
                schema: ToolSchema::object(),
                result_schema: None,
                script: Mutex::new(VecDeque::new()),
                fallback,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
                abandoned: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Results returned in order before falling back to the default one.
        pub(crate) fn with_script(
            self,
            script: Vec<std::result::Result<Value, ToolFailure>>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..self
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn with_schema(mut self, schema: ToolSchema) -> Self {
            self.schema = schema;
            self
        }

        pub(crate) fn with_result_schema(mut self, schema: ToolSchema) -> Self {
            self.result_schema = Some(schema);
            self
        }

        pub(crate) fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn abandoned_flag(&self) -> Arc<AtomicBool> {
            self.abandoned.clone()
        }
    }

    #[async_trait]
    impl Tool for ScriptedTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "scripted test tool"
        }

        fn schema(&self) -> &ToolSchema {
            &self.schema
        }

        fn result_schema(&self) -> Option<&ToolSchema> {
            self.result_schema.as_ref()
        }

        async fn call(&self, _input: &Value) -> std::result::Result<Value, ToolFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut guard = AbandonGuard {
                flag: self.abandoned.clone(),
                armed: true,
            };

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            guard.armed = false;

            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }
}
