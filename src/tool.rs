use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::invoker::{RawToolResult, ToolBackend, ToolCall, ToolContext};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    fn parameters(&self) -> Option<Value> {
        None
    }

    fn requires_credentials(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &ToolContext<'_>, input: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub parameters: Option<Value>,
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn describe(&self) -> Vec<ToolDescription> {
        self.tools
            .values()
            .map(|tool| ToolDescription {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    pub async fn call(&self, ctx: &ToolContext<'_>, name: &str, input: Value) -> Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        if tool.requires_credentials() && ctx.access_token.is_none() {
            return Err(AgentError::AuthenticationRequired(ctx.session_id.to_string()));
        }
        tool.call(ctx, input).await
    }
}

/// Credential-less tools inside a credential-requiring backend stay reachable
/// without a token; unknown tools default to requiring one.
#[async_trait]
impl ToolBackend for ToolRegistry {
    async fn call(&self, ctx: &ToolContext<'_>, call: &ToolCall) -> Result<RawToolResult> {
        ToolRegistry::call(self, ctx, &call.name, call.arguments.clone())
            .await
            .map(RawToolResult::Json)
    }

    fn requires_credentials(&self, tool: &str) -> bool {
        self.tools
            .get(tool)
            .map(|t| t.requires_credentials())
            .unwrap_or(true)
    }

    fn describe(&self) -> Vec<ToolDescription> {
        ToolRegistry::describe(self)
    }
}
