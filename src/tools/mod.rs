//! Tool system modules and re-exports.

// === Modules ===

pub mod file;
pub mod registry;
pub mod shell;
pub mod spec;
pub mod swarm;

// === Re-exports ===

pub use spec::{ToolContext, ToolHandler, ToolResult, ToolStatus};

pub use registry::{ToolRegistry, ToolRegistryBuilder};

pub use file::{ListDirTool, ReadFileTool, WriteFileTool};
pub use shell::RunCommandTool;
pub use swarm::SpawnResearchTool;
