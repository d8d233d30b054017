//! The research loop: a two-node cycle between a generation step and a
//! tool step over an append-only transcript.
//!
//! The loop owns all failure conversion. Generation faults become the
//! terminal report, tool faults become error-string tool results, and a
//! missing credential short-circuits to a fixed report before any network
//! call. Callers always receive a well-formed message, never an error.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::message::{Message, Role, ToolCall};
use crate::provider::{CompletionRequest, Provider};
use crate::tool::ToolRegistry;

/// Terminal report produced when no generation credential could be resolved.
pub const MISSING_API_KEY_REPORT: &str = "GOOGLE_API_KEY is not configured. \
    Add it to ~/.config/inq/config.toml or set the GOOGLE_API_KEY environment \
    variable, then submit the topic again.";

/// Prefix of a terminal report produced by a generation fault.
pub const FAILURE_REPORT_PREFIX: &str = "Research failed:";

/// Whether a terminal message reports a failed run rather than a report.
pub fn is_failure_report(message: &Message) -> bool {
    message.content == MISSING_API_KEY_REPORT
        || message.content.starts_with(FAILURE_REPORT_PREFIX)
}

/// A single research request, created when the user submits a topic.
///
/// Consumed once per loop invocation; a failed run is not retried
/// automatically, the user resubmits.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub topic: String,
}

impl RunRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }

    /// The user message that seeds the transcript.
    pub fn seed_message(&self) -> Message {
        Message::user(format!(
            "Research: '{}'. Report with bullet points.",
            self.topic
        ))
    }
}

/// Session-scoped context for one research run: the topic, the submit
/// flag, and the accumulated transcript. Created fresh per request; the
/// caller may keep it around afterwards to re-display the report.
#[derive(Debug, Clone)]
pub struct ResearchSession {
    pub topic: String,
    /// Set when the user triggered the run (as opposed to merely typing
    /// a topic). The loop only ever sees submitted sessions.
    pub run_requested: bool,
    pub messages: Vec<Message>,
    pub report: Option<Message>,
}

impl ResearchSession {
    pub fn new(request: RunRequest) -> Self {
        let mut messages = Vec::new();
        messages.push(request.seed_message());
        Self {
            topic: request.topic,
            run_requested: true,
            messages,
            report: None,
        }
    }
}

/// Tuning for the research loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Models in priority order. On a retryable generation error the loop
    /// advances to the next entry and retries the same step. Empty means
    /// the provider's default model.
    pub models: Vec<String>,
    /// Upper bound on generation steps; the loop has no natural cap when
    /// the model keeps requesting searches.
    pub max_steps: usize,
    /// Fixed delay before every generation call, for staying under a
    /// request-rate ceiling.
    pub pace: Option<Duration>,
    /// Optional system prompt prepended to the transcript.
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            max_steps: 20,
            pace: None,
            system_prompt: None,
            temperature: Some(0.0),
        }
    }
}

impl LoopConfig {
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// One event per node execution, for live progress display.
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// A generation step finished; the message may carry tool calls.
    Agent { step: u32, message: Message },
    /// A tool step finished; `result` is the appended tool-result message.
    Tool {
        step: u32,
        name: String,
        is_error: bool,
        result: Message,
    },
    /// The loop reached its terminal state.
    Done { report: Message },
}

pub type StepStream = Pin<Box<dyn Stream<Item = StepEvent> + Send>>;

/// Drives one research request to its terminal message.
#[derive(Clone)]
pub struct ResearchLoop {
    provider: Option<Arc<dyn Provider>>,
    tools: Arc<ToolRegistry>,
    config: LoopConfig,
}

impl ResearchLoop {
    pub fn new(provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>, config: LoopConfig) -> Self {
        Self {
            provider: Some(provider),
            tools,
            config,
        }
    }

    /// A loop with no credential behind it. Runs short-circuit to the
    /// fixed configuration report without touching the network.
    pub fn unconfigured(tools: Arc<ToolRegistry>, config: LoopConfig) -> Self {
        Self {
            provider: None,
            tools,
            config,
        }
    }

    /// Blocking whole-loop invocation; returns the terminal message.
    pub async fn run(&self, session: &mut ResearchSession) -> Message {
        self.drive(session, None).await
    }

    /// Step-event sequence for one invocation. Events arrive one per node
    /// execution and the final `Done` event carries the terminal message
    /// captured during the same pass, so consumers never re-run the loop
    /// to fetch the report.
    pub fn stream(&self, mut session: ResearchSession) -> StepStream {
        let (tx, rx) = mpsc::channel(16);
        let this = self.clone();
        tokio::spawn(async move {
            let report = this.drive(&mut session, Some(&tx)).await;
            let _ = tx.send(StepEvent::Done { report }).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn drive(
        &self,
        session: &mut ResearchSession,
        events: Option<&mpsc::Sender<StepEvent>>,
    ) -> Message {
        debug_assert!(session.run_requested);

        let Some(provider) = self.provider.clone() else {
            debug!(topic = %session.topic, "No generation credential, short-circuiting");
            return finish(session, Message::assistant(MISSING_API_KEY_REPORT));
        };

        if let Some(system) = &self.config.system_prompt {
            if !matches!(session.messages.first(), Some(m) if m.role == Role::System) {
                session.messages.insert(0, Message::system(system.clone()));
            }
        }

        let mut model_ix = 0usize;

        for step in 1..=self.config.max_steps {
            debug!(
                step,
                transcript_len = session.messages.len(),
                "Generation step starting"
            );

            let message = match self
                .generation_step(provider.as_ref(), &session.messages, &mut model_ix)
                .await
            {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, step, "Generation failed, reporting to user");
                    return finish(
                        session,
                        Message::assistant(format!("{} {}", FAILURE_REPORT_PREFIX, e)),
                    );
                }
            };

            session.messages.push(message.clone());
            emit(
                events,
                StepEvent::Agent {
                    step: step as u32,
                    message: message.clone(),
                },
            )
            .await;

            if message.is_terminal() {
                debug!(steps = step, "Research complete");
                debug_assert!(transcript_is_well_formed(&session.messages));
                session.report = Some(message.clone());
                return message;
            }

            for call in &message.tool_calls {
                let content = self.tool_step(call).await;
                let is_error = content.starts_with("Error");
                let result = Message::tool_result(&call.id, content);
                session.messages.push(result.clone());
                emit(
                    events,
                    StepEvent::Tool {
                        step: step as u32,
                        name: call.name.clone(),
                        is_error,
                        result,
                    },
                )
                .await;
            }
        }

        warn!(max_steps = self.config.max_steps, "Step limit reached");
        finish(
            session,
            Message::assistant(format!(
                "Stopped after {} research steps without reaching a final \
                 report. Try a narrower topic.",
                self.config.max_steps
            )),
        )
    }

    /// One generation round trip, walking the model priority list on
    /// retryable failures.
    async fn generation_step(
        &self,
        provider: &dyn Provider,
        messages: &[Message],
        model_ix: &mut usize,
    ) -> Result<Message, crate::error::Error> {
        loop {
            if let Some(pace) = self.config.pace {
                tokio::time::sleep(pace).await;
            }

            let mut request =
                CompletionRequest::new(messages.to_vec()).with_tools(self.tools.definitions());
            if let Some(temperature) = self.config.temperature {
                request = request.with_temperature(temperature);
            }
            if let Some(model) = self.config.models.get(*model_ix) {
                request = request.with_model(model.clone());
            }

            match provider.complete(request).await {
                Ok(response) => return Ok(response.message),
                Err(e) if e.is_retryable() && *model_ix + 1 < self.config.models.len() => {
                    warn!(
                        error = %e,
                        failed_model = %self.config.models[*model_ix],
                        next_model = %self.config.models[*model_ix + 1],
                        "Falling over to next model"
                    );
                    *model_ix += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Execute one tool call. Failures come back as text so the model can
    /// see them and react; they never abort the loop.
    async fn tool_step(&self, call: &ToolCall) -> String {
        let Some(tool) = self.tools.get(&call.name) else {
            return format!("Error: Unknown tool '{}'", call.name);
        };

        debug!(tool = %call.name, arguments = %call.arguments, "Executing tool");

        match tool.execute(call.arguments.clone()).await {
            Ok(output) if output.is_error => format!("Error: {}", output.content),
            Ok(output) => output.content,
            Err(e) => format!("Error executing tool: {}", e),
        }
    }
}

fn finish(session: &mut ResearchSession, report: Message) -> Message {
    session.messages.push(report.clone());
    session.report = Some(report.clone());
    report
}

async fn emit(events: Option<&mpsc::Sender<StepEvent>>, event: StepEvent) {
    if let Some(tx) = events {
        // A dropped consumer just means nobody is watching progress.
        let _ = tx.send(event).await;
    }
}

/// Check the transcript ordering invariant: every tool-result message
/// immediately follows (possibly within a run of sibling results) an
/// assistant message carrying the matching tool call.
pub fn transcript_is_well_formed(messages: &[Message]) -> bool {
    for (ix, msg) in messages.iter().enumerate() {
        if msg.role != Role::Tool {
            continue;
        }
        let Some(call_id) = &msg.tool_call_id else {
            return false;
        };
        let mut prev = ix;
        let matched = loop {
            if prev == 0 {
                break false;
            }
            prev -= 1;
            match messages[prev].role {
                Role::Tool => continue,
                Role::Assistant => {
                    break messages[prev].tool_calls.iter().any(|c| &c.id == call_id)
                }
                _ => break false,
            }
        };
        if !matched {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::{MockProvider, MockSearchTool};
    use futures::StreamExt;

    fn registry_with(tool: MockSearchTool) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(tool));
        Arc::new(registry)
    }

    #[test]
    fn test_seed_message_wording() {
        let request = RunRequest::new("AI in Healthcare");
        let seed = request.seed_message();
        assert_eq!(seed.role, Role::User);
        assert_eq!(
            seed.content,
            "Research: 'AI in Healthcare'. Report with bullet points."
        );
    }

    #[test]
    fn test_transcript_invariant() {
        let call = ToolCall::new("tc_0", "web_search", serde_json::json!({"query": "q"}));

        let good = vec![
            Message::user("hi"),
            Message::assistant_with_tool_calls("", vec![call.clone()]),
            Message::tool_result("tc_0", "results"),
            Message::assistant("report"),
        ];
        assert!(transcript_is_well_formed(&good));

        let orphan_first = vec![Message::tool_result("tc_0", "results")];
        assert!(!transcript_is_well_formed(&orphan_first));

        let mismatched = vec![
            Message::assistant_with_tool_calls("", vec![call]),
            Message::tool_result("tc_other", "results"),
        ];
        assert!(!transcript_is_well_formed(&mismatched));

        let after_user = vec![
            Message::user("hi"),
            Message::tool_result("tc_0", "results"),
        ];
        assert!(!transcript_is_well_formed(&after_user));
    }

    #[tokio::test]
    async fn test_terminates_after_single_generation_step() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_response("Here is the report.");

        let research = ResearchLoop::new(
            provider.clone(),
            registry_with(MockSearchTool::new()),
            LoopConfig::default(),
        );

        let mut session = ResearchSession::new(RunRequest::new("rust async"));
        let report = research.run(&mut session).await;

        assert_eq!(report.content, "Here is the report.");
        assert_eq!(provider.request_count(), 1);
        assert_eq!(session.report.as_ref().unwrap().content, report.content);
        assert!(transcript_is_well_formed(&session.messages));
    }

    #[tokio::test]
    async fn test_search_cycle_appends_tool_result() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_tool_call("web_search", serde_json::json!({"query": "rust 2024"}));
        provider.queue_response("Final report.");

        let tool = MockSearchTool::new();
        tool.queue_output(Ok(crate::tool::ToolOutput::success(
            "1. Rust 2024\n   The edition guide.",
        )));
        let queries = tool.captured_queries();
        let research = ResearchLoop::new(provider.clone(), registry_with(tool), LoopConfig::default());

        let mut session = ResearchSession::new(RunRequest::new("rust 2024"));
        let report = research.run(&mut session).await;

        assert_eq!(report.content, "Final report.");
        assert_eq!(provider.request_count(), 2);

        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(session.messages[2].content, "1. Rust 2024\n   The edition guide.");
        assert_eq!(queries.lock().unwrap().as_slice(), ["rust 2024"]);
        assert!(transcript_is_well_formed(&session.messages));
    }

    #[tokio::test]
    async fn test_missing_credential_short_circuits() {
        let tool = MockSearchTool::new();
        let queries = tool.captured_queries();
        let research = ResearchLoop::unconfigured(registry_with(tool), LoopConfig::default());

        let mut session = ResearchSession::new(RunRequest::new("anything"));
        let report = research.run(&mut session).await;

        assert_eq!(report.content, MISSING_API_KEY_REPORT);
        assert!(queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tool_fault_becomes_result_text() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_tool_call("web_search", serde_json::json!({"query": "flaky"}));
        provider.queue_response("Gave up gracefully.");

        let tool = MockSearchTool::new();
        tool.queue_output(Err(Error::network("connection reset by peer")));
        let research = ResearchLoop::new(provider.clone(), registry_with(tool), LoopConfig::default());

        let mut session = ResearchSession::new(RunRequest::new("flaky"));
        let report = research.run(&mut session).await;

        // The fault is data: a non-empty error string in the transcript,
        // and the loop went on to another generation step.
        let tool_msg = session
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.starts_with("Error"));
        assert!(!tool_msg.content.is_empty());
        assert_eq!(provider.request_count(), 2);
        assert_eq!(report.content, "Gave up gracefully.");
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_result_text() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_tool_call("read_mind", serde_json::json!({}));
        provider.queue_response("Done.");

        let research = ResearchLoop::new(
            provider.clone(),
            registry_with(MockSearchTool::new()),
            LoopConfig::default(),
        );

        let mut session = ResearchSession::new(RunRequest::new("x"));
        research.run(&mut session).await;

        let tool_msg = session
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("Unknown tool 'read_mind'"));
    }

    #[tokio::test]
    async fn test_generation_fault_becomes_terminal_report() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_error(Error::auth("API key not valid"));

        let research = ResearchLoop::new(
            provider.clone(),
            registry_with(MockSearchTool::new()),
            LoopConfig::default(),
        );

        let mut session = ResearchSession::new(RunRequest::new("x"));
        let report = research.run(&mut session).await;

        assert!(report.content.starts_with("Research failed:"));
        assert!(report.content.contains("API key not valid"));
    }

    #[tokio::test]
    async fn test_step_limit_stops_the_loop() {
        let provider = Arc::new(MockProvider::new());
        for _ in 0..3 {
            provider.queue_tool_call("web_search", serde_json::json!({"query": "more"}));
        }

        let config = LoopConfig::default().with_max_steps(3);
        let research =
            ResearchLoop::new(provider.clone(), registry_with(MockSearchTool::new()), config);

        let mut session = ResearchSession::new(RunRequest::new("bottomless"));
        let report = research.run(&mut session).await;

        assert_eq!(provider.request_count(), 3);
        assert!(report.content.contains("Stopped after 3"));
    }

    #[tokio::test]
    async fn test_model_failover_advances_on_retryable_error() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_error(Error::rate_limit("quota exceeded"));
        provider.queue_response("Report from the fallback model.");

        let config = LoopConfig::default()
            .with_models(vec!["gemini-1.5-flash".into(), "gemini-1.5-pro".into()]);
        let research =
            ResearchLoop::new(provider.clone(), registry_with(MockSearchTool::new()), config);

        let mut session = ResearchSession::new(RunRequest::new("x"));
        let report = research.run(&mut session).await;

        assert_eq!(report.content, "Report from the fallback model.");
        let requests = provider.captured_requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].model.as_deref(), Some("gemini-1.5-flash"));
        assert_eq!(requests[1].model.as_deref(), Some("gemini-1.5-pro"));
    }

    #[tokio::test]
    async fn test_failover_exhaustion_reports_failure() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_error(Error::rate_limit("quota"));
        provider.queue_error(Error::rate_limit("quota again"));

        let config = LoopConfig::default().with_models(vec!["a".into(), "b".into()]);
        let research =
            ResearchLoop::new(provider.clone(), registry_with(MockSearchTool::new()), config);

        let mut session = ResearchSession::new(RunRequest::new("x"));
        let report = research.run(&mut session).await;

        assert!(report.content.starts_with("Research failed:"));
        assert_eq!(provider.request_count(), 2);
    }

    #[tokio::test]
    async fn test_stream_emits_one_event_per_node_and_captures_report() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_tool_call("web_search", serde_json::json!({"query": "q"}));
        provider.queue_response("Streamed report.");

        let tool = MockSearchTool::new();
        tool.queue_output(Ok(crate::tool::ToolOutput::success("hits")));
        let research = ResearchLoop::new(provider.clone(), registry_with(tool), LoopConfig::default());

        let events: Vec<StepEvent> = research
            .stream(ResearchSession::new(RunRequest::new("q")))
            .collect()
            .await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], StepEvent::Agent { step: 1, .. }));
        assert!(matches!(&events[1], StepEvent::Tool { step: 1, is_error: false, .. }));
        assert!(matches!(&events[2], StepEvent::Agent { step: 2, .. }));
        match &events[3] {
            StepEvent::Done { report } => assert_eq!(report.content, "Streamed report."),
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_then_run_issue_identical_call_sequences() {
        let provider = Arc::new(MockProvider::new());
        // Two identical passes' worth of responses.
        for _ in 0..2 {
            provider.queue_tool_call("web_search", serde_json::json!({"query": "q"}));
            provider.queue_response("Report.");
        }

        let tool = MockSearchTool::new();
        tool.queue_output(Ok(crate::tool::ToolOutput::success("hits")));
        tool.queue_output(Ok(crate::tool::ToolOutput::success("hits")));
        let queries = tool.captured_queries();
        let research = ResearchLoop::new(provider.clone(), registry_with(tool), LoopConfig::default());

        let request = RunRequest::new("dup");
        let _events: Vec<StepEvent> = research
            .stream(ResearchSession::new(request.clone()))
            .collect()
            .await;
        research.run(&mut ResearchSession::new(request)).await;

        // Every outbound call happened twice, in the same order. Call ids
        // are generated per queue entry, so compare the shape that matters:
        // roles, content, and requested tools with their arguments.
        fn shape(messages: &[Message]) -> Vec<(Role, String, Vec<String>)> {
            messages
                .iter()
                .map(|m| {
                    let calls = m
                        .tool_calls
                        .iter()
                        .map(|c| format!("{}:{}", c.name, c.arguments))
                        .collect();
                    (m.role, m.content.clone(), calls)
                })
                .collect()
        }

        let requests = provider.captured_requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        for ix in 0..2 {
            assert_eq!(
                shape(&requests[ix].messages),
                shape(&requests[ix + 2].messages)
            );
        }
        assert_eq!(queries.lock().unwrap().as_slice(), ["q", "q"]);
    }

    #[tokio::test]
    async fn test_system_prompt_prepended_once() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_response("Report.");

        let config = LoopConfig::default().with_system_prompt("You are a research agent.");
        let research =
            ResearchLoop::new(provider.clone(), registry_with(MockSearchTool::new()), config);

        let mut session = ResearchSession::new(RunRequest::new("x"));
        research.run(&mut session).await;

        assert_eq!(session.messages[0].role, Role::System);
        assert_eq!(session.messages[1].role, Role::User);
        let request = provider.last_request().unwrap();
        assert_eq!(request.messages[0].role, Role::System);
    }
}
