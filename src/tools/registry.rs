//! Name to handler binding and guarded dispatch.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::time::Instant;

use crate::core::spawn::SpawnCoordinator;
use crate::core::tool_parser::ToolCall;

use super::file::{ListDirTool, ReadFileTool, WriteFileTool};
use super::shell::RunCommandTool;
use super::spec::{ToolContext, ToolDescriptor, ToolHandler, ToolResult};
use super::swarm::SpawnResearchTool;

/// Registered tools plus the context they run in.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    context: ToolContext,
}

impl ToolRegistry {
    #[must_use]
    pub fn new(context: ToolContext) -> Self {
        Self {
            tools: HashMap::new(),
            context,
        }
    }

    /// Register a handler under its descriptor name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.descriptor().name.to_string();
        if self.tools.insert(name.clone(), handler).is_some() {
            tracing::warn!(tool = %name, "replaced an already registered tool");
        }
    }

    #[must_use]
    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.get(name).map(|handler| handler.descriptor())
    }

    /// Known tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptors of all tools, sorted by name.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> =
            self.tools.values().map(|handler| handler.descriptor()).collect();
        descriptors.sort_by_key(|descriptor| descriptor.name);
        descriptors
    }

    /// Run `call` and fold every failure mode into an `error` result.
    pub async fn dispatch(&self, call: &ToolCall, deadline: Option<Instant>) -> ToolResult {
        let Some(handler) = self.tools.get(&call.name) else {
            return ToolResult::error(
                &call.name,
                call.args.clone(),
                format!(
                    "Unknown tool `{}`. Available tools: {}",
                    call.name,
                    self.names().join(", ")
                ),
            );
        };

        let descriptor = handler.descriptor();
        let mut args = call.args.clone();
        descriptor.canonicalize(&mut args);
        if let Some(missing) = descriptor
            .args
            .iter()
            .find(|spec| spec.required && !args.contains_key(spec.name))
        {
            return ToolResult::error(
                &call.name,
                call.args.clone(),
                format!("Missing required argument: {}", missing.name),
            );
        }

        let execution = AssertUnwindSafe(handler.execute(&args, &self.context)).catch_unwind();
        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, execution).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return ToolResult::error(
                        &call.name,
                        call.args.clone(),
                        "Tool execution exceeded its deadline",
                    );
                }
            },
            None => execution.await,
        };

        match outcome {
            Ok(Ok(output)) => ToolResult::success(&call.name, call.args.clone(), output),
            Ok(Err(err)) => ToolResult::error(&call.name, call.args.clone(), err.to_string()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(tool = %call.name, %message, "tool panicked");
                ToolResult::error(
                    &call.name,
                    call.args.clone(),
                    format!("Tool panicked: {message}"),
                )
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

// === Builder ===

/// Assembles a registry from the built-in tool groups.
pub struct ToolRegistryBuilder {
    registry: ToolRegistry,
}

impl ToolRegistryBuilder {
    #[must_use]
    pub fn new(context: ToolContext) -> Self {
        Self {
            registry: ToolRegistry::new(context),
        }
    }

    /// `read_file`, `write_file` and `list_directory`.
    #[must_use]
    pub fn with_file_tools(mut self) -> Self {
        self.registry.register(Arc::new(ReadFileTool));
        self.registry.register(Arc::new(WriteFileTool));
        self.registry.register(Arc::new(ListDirTool));
        self
    }

    #[must_use]
    pub fn with_shell_tools(mut self) -> Self {
        self.registry.register(Arc::new(RunCommandTool));
        self
    }

    #[must_use]
    pub fn with_research_tool(mut self, coordinator: Arc<SpawnCoordinator>, max_queries: usize) -> Self {
        self.registry
            .register(Arc::new(SpawnResearchTool::new(coordinator, max_queries)));
        self
    }

    #[must_use]
    pub fn with_tool(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.registry.register(handler);
        self
    }

    #[must_use]
    pub fn build(self) -> ToolRegistry {
        self.registry
    }
}
