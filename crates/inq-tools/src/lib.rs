//! Built-in tools for inq.

pub mod search;

pub use search::{SearchConfig, WebSearchTool};

use inq_core::{Tool, ToolRegistry};

/// Build the registry holding the agent's declared capability set.
pub fn create_registry(config: SearchConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(WebSearchTool::new(config)) as Box<dyn Tool>);
    registry
}
