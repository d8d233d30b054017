//! inq-core: conversation model, provider/tool seams, and the research loop.

pub mod error;
pub mod message;
pub mod provider;
pub mod research;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::Error;
pub use message::{Message, Role, ToolCall, Usage};
pub use provider::{CompletionRequest, CompletionResponse, FinishReason, Provider};
pub use research::{
    is_failure_report, transcript_is_well_formed, LoopConfig, ResearchLoop, ResearchSession,
    RunRequest, StepEvent, StepStream, FAILURE_REPORT_PREFIX, MISSING_API_KEY_REPORT,
};
pub use tool::{PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters, ToolRegistry};

pub type Result<T> = std::result::Result<T, Error>;
