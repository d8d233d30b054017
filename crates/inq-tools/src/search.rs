//! Web search tool backed by the DuckDuckGo HTML endpoint.

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::debug;

use inq_core::{Error, PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters};

const DEFAULT_BASE_URL: &str = "https://html.duckduckgo.com/html/";

/// Configuration for the web search tool.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Base URL of the HTML search endpoint.
    pub base_url: String,
    /// Maximum number of results to include in the output.
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            max_results: 8,
        }
    }
}

/// One scraped search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub description: String,
}

pub struct WebSearchTool {
    client: Client,
    config: SearchConfig,
}

impl WebSearchTool {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            client: Client::builder()
                .user_agent("inq/0.1.0")
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            config,
        }
    }
}

#[derive(Deserialize)]
struct WebSearchArgs {
    query: String,
}

#[async_trait]
impl Tool for WebSearchTool {
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
        let args: WebSearchArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::tool("web_search", format!("Invalid arguments: {}", e)))?;

        debug!(query = %args.query, "Web search");

        let response = self
            .client
            .get(&self.config.base_url)
            .query(&[("q", args.query.as_str())])
            .send()
            .await
            .map_err(|e| Error::tool("web_search", format!("Search request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::tool(
                "web_search",
                format!("Search API error {}", response.status()),
            ));
        }

        let html = response
            .text()
            .await
            .map_err(|e| Error::tool("web_search", format!("Failed to read response: {}", e)))?;

        let hits = parse_results(&html, self.config.max_results);
        debug!(query = %args.query, hits = hits.len(), "Web search finished");

        Ok(ToolOutput::success(format_results(&args.query, &hits)))
    }
}

/// Scrape result nodes out of the DuckDuckGo HTML page.
pub fn parse_results(html: &str, max_results: usize) -> Vec<SearchHit> {
    let document = Html::parse_document(html);

    // Selectors are static and known-valid.
    let result_sel = Selector::parse("div.result").unwrap();
    let title_sel = Selector::parse("a.result__a").unwrap();
    let snippet_sel = Selector::parse(".result__snippet").unwrap();

    let mut hits = Vec::new();
    for result in document.select(&result_sel) {
        let Some(title_el) = result.select(&title_sel).next() else {
            continue;
        };
        let title = collapse_whitespace(&title_el.text().collect::<String>());
        if title.is_empty() {
            continue;
        }

        let description = result
            .select(&snippet_sel)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .unwrap_or_default();

        hits.push(SearchHit { title, description });
        if hits.len() >= max_results {
            break;
        }
    }

    hits
}

/// Render the hits as the numbered title/description list the agent reads.
pub fn format_results(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No results found for '{}'.", query);
    }

    let mut output = String::new();
    for (ix, hit) in hits.iter().enumerate() {
        output.push_str(&format!("{}. {}\n", ix + 1, hit.title));
        if !hit.description.is_empty() {
            output.push_str(&format!("   {}\n", hit.description));
        }
    }
    output.trim_end().to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
