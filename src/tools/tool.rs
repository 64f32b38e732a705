//! Tool trait, execution context and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::registry::ToolRegistry;
use super::types::{ToolOutput, ToolParameters};
use crate::error::Result;
use crate::permission::{PermissionEngine, PermissionRequest, Ruleset, ToolRef};
use crate::session::SessionStore;

/// Permission a tool needs before (or while) it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionCheck {
    pub permission: String,
    pub patterns: Vec<String>,
    pub always: Vec<String>,
    pub metadata: Value,
}

impl PermissionCheck {
    pub fn new(permission: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            permission: permission.into(),
            always: patterns.clone(),
            patterns,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_always(mut self, always: Vec<String>) -> Self {
        self.always = always;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Everything a tool body can reach while executing one call.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub call_id: String,
    pub cancel: CancellationToken,
    pub permissions: Arc<PermissionEngine>,
    pub ruleset: Arc<Ruleset>,
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<ToolRegistry>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session_id)
            .field("message_id", &self.message_id)
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

impl ToolContext {
    /// Ask policy (and possibly the user) for `check` on behalf of this call.
    pub async fn ask(&self, check: PermissionCheck) -> Result<()> {
        let request = PermissionRequest::builder()
            .session_id(self.session_id.clone())
            .permission(check.permission)
            .patterns(check.patterns)
            .always(check.always)
            .metadata(check.metadata)
            .tool(ToolRef {
                message_id: self.message_id.clone(),
                call_id: self.call_id.clone(),
            })
            .build();
        self.permissions
            .ask(request, &self.ruleset, &self.cancel)
            .await
    }

    /// Same context for a nested call.
    pub fn for_call(&self, call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            ..self.clone()
        }
    }
}

/// Core tool trait. Implement to add a tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema parameters.
    fn parameters(&self) -> &ToolParameters;

    /// Check performed before `execute`. `None` skips the check; tools that
    /// only know their targets while running call [`ToolContext::ask`] themselves.
    fn permission(&self, _args: &ToolArguments) -> Option<PermissionCheck> {
        Some(PermissionCheck::new(self.name(), vec!["*".to_string()]))
    }

    /// Human-readable message for a schema violation.
    fn format_validation_error(&self, message: &str) -> String {
        format!("{message}\nPlease rewrite the input so it satisfies the expected schema.")
    }

    async fn execute(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<ToolOutput>;
}

type ToolHandler =
    dyn Fn(ToolArguments, ToolContext) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send>> + Send + Sync;

type PermissionFn = dyn Fn(&ToolArguments) -> Option<PermissionCheck> + Send + Sync;

/// Closure-based tool for quick tool creation.
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: ToolParameters,
    handler: Arc<ToolHandler>,
    permission: Option<Arc<PermissionFn>>,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
            permission: None,
        }
    }

    /// Override the pre-execution permission check.
    pub fn with_permission<P>(mut self, permission: P) -> Self
    where
        P: Fn(&ToolArguments) -> Option<PermissionCheck> + Send + Sync + 'static,
    {
        self.permission = Some(Arc::new(permission));
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn permission(&self, args: &ToolArguments) -> Option<PermissionCheck> {
        match &self.permission {
            Some(permission) => permission(args),
            None => Some(PermissionCheck::new(self.name(), vec!["*".to_string()])),
        }
    }

    async fn execute(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<ToolOutput> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}
