//! Session driver: assembles the research loop from configuration, runs
//! one request per submit, and maps step events to progress lines.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::info;

use inq_core::{LoopConfig, Message, ResearchLoop, ResearchSession, RunRequest, StepEvent};
use inq_providers::GeminiProvider;
use inq_tools::SearchConfig;

use crate::config::Config;

/// Default research system prompt; replaceable via `[agent] system_prompt`.
const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous web research agent. \
    Use web_search to gather current information on the requested topic, then \
    synthesize what you found into a clear report with bullet points. Cite the \
    sources you drew from. If a search fails, say what you could not verify \
    rather than inventing results.";

/// CLI-level overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct LoopOverrides {
    pub model: Option<String>,
    pub pace_ms: Option<u64>,
    pub max_steps: Option<usize>,
}

/// Build the research loop for one session. A missing API key yields an
/// unconfigured loop whose runs short-circuit to the fixed explanation.
pub fn build_loop(config: &Config, api_key: Option<String>, overrides: &LoopOverrides) -> ResearchLoop {
    let mut search_config = SearchConfig::default();
    if let Some(base_url) = &config.search.base_url {
        search_config.base_url = base_url.clone();
    }
    if let Some(max_results) = config.search.max_results {
        search_config.max_results = max_results;
    }
    let tools = Arc::new(inq_tools::create_registry(search_config));

    let mut loop_config = LoopConfig::default()
        .with_models(config.model_priority(overrides.model.clone()))
        .with_system_prompt(
            config
                .agent
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        );
    if let Some(max_steps) = overrides.max_steps.or(config.agent.max_steps) {
        loop_config = loop_config.with_max_steps(max_steps);
    }
    if let Some(pace_ms) = overrides.pace_ms.or(config.agent.pace_ms) {
        loop_config = loop_config.with_pace(Duration::from_millis(pace_ms));
    }

    match api_key {
        Some(key) => {
            let mut provider = GeminiProvider::new(key);
            if let Some(base_url) = &config.gemini.base_url {
                provider = provider.with_base_url(base_url);
            }
            ResearchLoop::new(Arc::new(provider), tools, loop_config)
        }
        None => ResearchLoop::unconfigured(tools, loop_config),
    }
}

/// One user session: a research loop plus the last finished report,
/// cached for re-display.
pub struct Session {
    research_loop: ResearchLoop,
    last_report: Option<Message>,
}

impl Session {
    pub fn new(research_loop: ResearchLoop) -> Self {
        Self {
            research_loop,
            last_report: None,
        }
    }

    pub fn last_report(&self) -> Option<&Message> {
        self.last_report.as_ref()
    }

    /// Run one submitted topic to its terminal report, feeding progress
    /// lines to the callback as step events arrive.
    pub async fn research(&mut self, topic: &str, progress: &mut dyn FnMut(&str)) -> Message {
        info!(topic, "Research run starting");

        let session = ResearchSession::new(RunRequest::new(topic));
        let mut events = self.research_loop.stream(session);

        let mut report = None;
        while let Some(event) = events.next().await {
            if let Some(line) = status_line(&event) {
                progress(&line);
            }
            if let StepEvent::Done { report: terminal } = event {
                report = Some(terminal);
            }
        }

        // The stream always ends with Done; this covers a producer that
        // died without sending it.
        let report =
            report.unwrap_or_else(|| Message::assistant("Research produced no report."));
        self.last_report = Some(report.clone());
        report
    }
}

/// Progress line for an event, mirroring what the loop is about to do: a
/// tool-calling generation step means a search is coming, a plain one
/// means the model is writing the report.
pub fn status_line(event: &StepEvent) -> Option<String> {
    match event {
        StepEvent::Agent { message, .. } => match message.tool_calls.first() {
            Some(call) => Some(format!("Searching: {}", call.query().unwrap_or("..."))),
            None => Some("Writing report...".to_string()),
        },
        StepEvent::Tool { is_error: true, name, .. } => {
            Some(format!("{} failed, continuing...", name))
        }
        StepEvent::Tool { .. } | StepEvent::Done { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inq_core::testing::{MockProvider, MockSearchTool};
    use inq_core::{is_failure_report, Error, ToolOutput, ToolRegistry, MISSING_API_KEY_REPORT};

    fn mock_loop(provider: Arc<MockProvider>, tool: MockSearchTool) -> ResearchLoop {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(tool));
        ResearchLoop::new(provider, Arc::new(registry), LoopConfig::default())
    }

    #[tokio::test]
    async fn test_research_reports_progress_and_caches_report() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_tool_call("web_search", serde_json::json!({"query": "rust 2024"}));
        provider.queue_response("# Report\n\n- finding");

        let tool = MockSearchTool::new();
        tool.queue_output(Ok(ToolOutput::success("1. a result")));

        let mut session = Session::new(mock_loop(provider, tool));
        let mut lines = Vec::new();
        let report = session
            .research("rust 2024", &mut |line| lines.push(line.to_string()))
            .await;

        assert_eq!(lines, vec!["Searching: rust 2024", "Writing report..."]);
        assert_eq!(report.content, "# Report\n\n- finding");
        assert_eq!(session.last_report().unwrap().content, report.content);
        assert!(!is_failure_report(&report));
    }

    #[tokio::test]
    async fn test_failed_search_noted_in_progress() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_tool_call("web_search", serde_json::json!({"query": "q"}));
        provider.queue_response("Report.");

        let tool = MockSearchTool::new();
        tool.queue_output(Err(Error::network("dns failure")));

        let mut session = Session::new(mock_loop(provider, tool));
        let mut lines = Vec::new();
        session
            .research("q", &mut |line| lines.push(line.to_string()))
            .await;

        assert_eq!(
            lines,
            vec![
                "Searching: q",
                "web_search failed, continuing...",
                "Writing report..."
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_key_runs_offline() {
        // An empty config with no key must still produce a report.
        let research_loop = build_loop(&Config::default(), None, &LoopOverrides::default());
        let mut session = Session::new(research_loop);

        let mut lines = Vec::new();
        let report = session
            .research("anything", &mut |line| lines.push(line.to_string()))
            .await;

        assert_eq!(report.content, MISSING_API_KEY_REPORT);
        assert!(is_failure_report(&report));
        assert!(lines.is_empty());
    }

    #[test]
    fn test_status_line_mapping() {
        let searching = StepEvent::Agent {
            step: 1,
            message: Message::assistant_with_tool_calls(
                "",
                vec![inq_core::ToolCall::new(
                    "tc_0",
                    "web_search",
                    serde_json::json!({"query": "llamas"}),
                )],
            ),
        };
        assert_eq!(status_line(&searching).unwrap(), "Searching: llamas");

        let writing = StepEvent::Agent {
            step: 2,
            message: Message::assistant("done"),
        };
        assert_eq!(status_line(&writing).unwrap(), "Writing report...");

        let quiet = StepEvent::Tool {
            step: 1,
            name: "web_search".to_string(),
            is_error: false,
            result: Message::tool_result("tc_0", "hits"),
        };
        assert!(status_line(&quiet).is_none());

        let done = StepEvent::Done {
            report: Message::assistant("report"),
        };
        assert!(status_line(&done).is_none());
    }
}
