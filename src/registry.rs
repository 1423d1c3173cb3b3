//! Handler registry
//!
//! Built once at startup, then sealed into an `Arc` and shared read-only.
//! Registration order is kept because it breaks routing ties.

use crate::error::OrchestrationError;
use crate::handlers::HandlerLogic;
use crate::tools::{Tool, ToolSchema};
use crate::Result;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Leaf handlers answer with their own tools; composites delegate to members.
#[derive(Clone)]
pub enum HandlerKind {
    Leaf(Arc<dyn HandlerLogic>),
    Composite { members: Vec<String> },
}

#[derive(Clone)]
pub struct Handler {
    name: String,
    role: String,
    capabilities: Vec<String>,
    tools: Vec<Arc<dyn Tool>>,
    policy: Option<String>,
    is_default: bool,
    kind: HandlerKind,
}

impl Handler {
    pub fn leaf(
        name: impl Into<String>,
        role: impl Into<String>,
        logic: Arc<dyn HandlerLogic>,
    ) -> Self {
        Self::with_kind(name, role, HandlerKind::Leaf(logic))
    }

    pub fn composite<I, S>(name: impl Into<String>, role: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members = members.into_iter().map(Into::into).collect();
        Self::with_kind(name, role, HandlerKind::Composite { members })
    }

    fn with_kind(name: impl Into<String>, role: impl Into<String>, kind: HandlerKind) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            capabilities: Vec::new(),
            tools: Vec::new(),
            policy: None,
            is_default: false,
            kind,
        }
    }

    /// Capability tags, lower-cased, duplicates dropped, declaration order kept.
    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into().trim().to_lowercase();
            if !tag.is_empty() && !self.capabilities.contains(&tag) {
                self.capabilities.push(tag);
            }
        }
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Opaque instructions handed to the synthesis step. Never read by routing.
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, HandlerKind::Composite { .. })
    }

    /// Discovery summary (no logic, no secrets).
    pub fn describe(&self) -> Value {
        let members = match &self.kind {
            HandlerKind::Leaf(_) => Vec::new(),
            HandlerKind::Composite { members } => members.clone(),
        };

        json!({
            "name": self.name,
            "role": self.role,
            "capabilities": self.capabilities,
            "default": self.is_default,
            "kind": if self.is_composite() { "composite" } else { "leaf" },
            "members": members,
            "tools": self.tools.iter().map(|t| json!({
                "name": t.name(),
                "description": t.description(),
                "input_schema": t.schema().to_json(),
                "result_schema": t.result_schema().map(ToolSchema::to_json),
            })).collect::<Vec<_>>(),
        })
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("tools", &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("is_default", &self.is_default)
            .field("composite", &self.is_composite())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Handler) -> Result<()> {
        if self.get(handler.name()).is_some() {
            return Err(OrchestrationError::DuplicateHandler(
                handler.name().to_string(),
            ));
        }

        if handler.is_default() {
            if let Some(existing) = self.handlers.iter().find(|h| h.is_default()) {
                return Err(OrchestrationError::ConfigError(format!(
                    "{} is flagged as default but {} already is",
                    handler.name(),
                    existing.name()
                )));
            }
        }

        self.handlers.push(Arc::new(handler));
        Ok(())
    }

    /// Freeze the registry. Composite members must all be registered.
    pub fn seal(self) -> Result<Arc<Self>> {
        let names: HashSet<&str> = self.handlers.iter().map(|h| h.name()).collect();

        for handler in &self.handlers {
            if let HandlerKind::Composite { members } = handler.kind() {
                if members.is_empty() {
                    return Err(OrchestrationError::ConfigError(format!(
                        "composite handler {} has no members",
                        handler.name()
                    )));
                }
                if let Some(missing) = members.iter().find(|m| !names.contains(m.as_str())) {
                    return Err(OrchestrationError::UnknownHandler(missing.clone()));
                }
            }
        }

        Ok(Arc::new(self))
    }

    /// Registered handlers in registration order.
    pub fn all(&self) -> &[Arc<Handler>] {
        &self.handlers
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Handler>> {
        self.handlers.iter().find(|h| h.name() == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.name() == name)
    }

    pub fn default_handler(&self) -> Result<&Arc<Handler>> {
        self.handlers
            .iter()
            .find(|h| h.is_default())
            .ok_or(OrchestrationError::NoDefaultConfigured)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
