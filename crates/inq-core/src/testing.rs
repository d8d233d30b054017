//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Error;
use crate::message::{Message, ToolCall, Usage};
use crate::provider::{CompletionRequest, CompletionResponse, FinishReason, Provider};
use crate::tool::{PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters};

/// A mock provider that returns pre-configured responses.
pub struct MockProvider {
    responses: Mutex<Vec<Result<CompletionResponse, Error>>>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
    pub name: String,
    pub default_model: Option<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            captured_requests: Mutex::new(Vec::new()),
            name: "mock".to_string(),
            default_model: None,
        }
    }

    /// Queue a plain assistant response for the next complete() call.
    /// Responses are returned in FIFO order (first queued = first returned).
    pub fn queue_response(&self, content: &str) {
        self.queue_raw_response(CompletionResponse {
            message: Message::assistant(content),
            usage: Usage::new(0, 0),
            model: "mock-model".to_string(),
            finish_reason: FinishReason::Stop,
        });
    }

    /// Queue an assistant response carrying a single tool call.
    pub fn queue_tool_call(&self, name: &str, arguments: serde_json::Value) {
        let id = format!("mock_tc_{}", self.responses.lock().unwrap().len());
        self.queue_raw_response(CompletionResponse {
            message: Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new(id, name, arguments)],
            ),
            usage: Usage::new(0, 0),
            model: "mock-model".to_string(),
            finish_reason: FinishReason::ToolCalls,
        });
    }

    /// Queue an error for the next complete() call.
    pub fn queue_error(&self, error: Error) {
        self.responses.lock().unwrap().insert(0, Err(error));
    }

    /// Queue a raw CompletionResponse.
    pub fn queue_raw_response(&self, response: CompletionResponse) {
        self.responses.lock().unwrap().insert(0, Ok(response));
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    /// Get the last captured request.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        self.captured_requests.lock().unwrap().push(request);
        match self.responses.lock().unwrap().pop() {
            Some(response) => response,
            None => Err(Error::Unknown("No mock response queued".to_string())),
        }
    }
}

/// A mock `web_search` tool with queued outputs and captured queries.
pub struct MockSearchTool {
    outputs: Mutex<Vec<Result<ToolOutput, Error>>>,
    captured_queries: Arc<Mutex<Vec<String>>>,
}

impl MockSearchTool {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(Vec::new()),
            captured_queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue the next execute() outcome (FIFO).
    pub fn queue_output(&self, output: Result<ToolOutput, Error>) {
        self.outputs.lock().unwrap().insert(0, output);
    }

    /// Shared handle to the queries seen so far; survives the tool moving
    /// into a registry.
    pub fn captured_queries(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.captured_queries)
    }
}

impl Default for MockSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for MockSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for information."
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new().add_property(
                "query",
                PropertySchema::string("The search query"),
                true,
            ),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let query = arguments
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.captured_queries.lock().unwrap().push(query);

        match self.outputs.lock().unwrap().pop() {
            Some(output) => output,
            None => Ok(ToolOutput::success("(no queued results)")),
        }
    }
}
