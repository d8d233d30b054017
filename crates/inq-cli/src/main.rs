use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use inq_core::{is_failure_report, Message};

mod config;
mod render;
mod session;

use config::Config;
use render::render_markdown;
use session::{build_loop, LoopOverrides, Session};

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: all tracing including request/response payloads
    Trace,
    /// Verbose: LLM requests/responses, tool execution details
    Debug,
    /// Standard: high-level flow, run starts
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "inq")]
#[command(version, about = "Autonomous research agent for the terminal", long_about = None)]
struct Cli {
    /// Research topic; omit to get an interactive prompt
    topic: Option<String>,

    /// Model to use (overrides config; fallbacks from config still apply)
    #[arg(short, long)]
    model: Option<String>,

    /// Fixed delay before each generation call, in milliseconds
    #[arg(long)]
    pace_ms: Option<u64>,

    /// Upper bound on generation steps per run
    #[arg(long)]
    max_steps: Option<usize>,

    /// Path to the config file (default: ~/.config/inq/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn")]
    log_level: LogLevel,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long)]
    debug: bool,

    /// Disable ANSI styling in the rendered report
    #[arg(long)]
    plain: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LogLevel::Debug
    } else {
        cli.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level.as_filter()))
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let api_key = config.resolve_api_key(std::env::var("GOOGLE_API_KEY").ok());
    let overrides = LoopOverrides {
        model: cli.model.clone(),
        pace_ms: cli.pace_ms,
        max_steps: cli.max_steps,
    };
    let mut session = Session::new(build_loop(&config, api_key, &overrides));

    let styled = !cli.plain && atty::is(atty::Stream::Stdout);

    match cli.topic {
        Some(topic) => {
            let report = run_topic(&mut session, &topic, styled).await;
            if is_failure_report(&report) {
                std::process::exit(1);
            }
            Ok(())
        }
        None => interactive(&mut session, styled).await,
    }
}

/// Run one submitted topic: progress lines to stderr while the loop
/// streams, then the rendered report (or a failure panel) at the end.
async fn run_topic(session: &mut Session, topic: &str, styled: bool) -> Message {
    eprintln!("Agent working on '{}'...", topic);
    let report = session
        .research(topic, &mut |line| eprintln!("  {}", line))
        .await;

    if is_failure_report(&report) {
        eprintln!("\nResearch did not complete:\n  {}", report.content);
    } else {
        println!("\n{}", render_markdown(&report.content, styled));
    }

    report
}

/// Interactive mode: one text input per topic, submit with enter.
/// `/last` re-displays the cached report, `exit` leaves.
async fn interactive(session: &mut Session, styled: bool) -> Result<()> {
    let mut editor =
        rustyline::DefaultEditor::new().context("Failed to initialize line editor")?;

    println!("inq: enter a research topic (exit to quit)");

    loop {
        match editor.readline("topic> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" || line == "quit" {
                    break;
                }
                let _ = editor.add_history_entry(line);

                if line == "/last" {
                    match session.last_report() {
                        Some(report) => {
                            println!("\n{}", render_markdown(&report.content, styled))
                        }
                        None => println!("No report yet."),
                    }
                    continue;
                }

                run_topic(session, line, styled).await;
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e).context("Failed to read input"),
        }
    }

    Ok(())
}
