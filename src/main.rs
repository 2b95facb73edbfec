//! deepresearch CLI
//!
//! Wires the concrete providers from environment variables, runs one
//! research query, streams progress to the terminal, and prints the final
//! report.
//!
//! ```bash
//! export OPENAI_MODEL=gpt-4o-mini OPENAI_API_KEY=... TAVILY_API_KEY=...
//! deepresearch "What are the latest developments in Rust async?"
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use deepresearch::provider::fetcher::HttpFetcher;
use deepresearch::provider::openai::OpenAiCompatEndpoint;
use deepresearch::provider::tavily::TavilySearch;
use deepresearch::provider::ModelRegistry;
use deepresearch::{ResearchRunner, RunEvent, RunOptions, RunnerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "deepresearch",
    version,
    about = "Multi-stage deep research: plan, search, read, analyze, and write a cited report"
)]
struct Args {
    /// The question to research
    #[arg(value_name = "QUERY")]
    query: String,

    /// Stable thread id for checkpointing
    #[arg(long)]
    thread_id: Option<String>,

    /// Overall run deadline in milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Cap the research iterations for this run
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Cap the parallel research tasks for this run
    #[arg(long)]
    max_parallelism: Option<usize>,

    /// Print the raw SSE event frames instead of friendly progress
    #[arg(long, default_value = "false")]
    raw_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let config = RunnerConfig::from_env().context("loading configuration")?;
    let endpoint =
        Arc::new(OpenAiCompatEndpoint::from_env().context("configuring model endpoint")?);
    let models = ModelRegistry::new().bind_all(endpoint);
    let search = Arc::new(TavilySearch::from_env().context("configuring search provider")?);
    let fetcher = Arc::new(HttpFetcher::new());

    let runner = ResearchRunner::new(config, models, search, fetcher);

    let options = RunOptions {
        thread_id: args.thread_id,
        max_iterations_override: args.max_iterations,
        max_parallelism_override: args.max_parallelism,
        overall_deadline_ms: args.deadline_ms,
        enable_plugin_tools: None,
    };

    info!(query = %args.query, "starting research run");
    let mut handle = runner
        .start(args.query, options)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    while let Some(event) = handle.events.recv().await {
        if args.raw_events {
            print!("{}", event.to_sse_frame());
            continue;
        }
        match event {
            RunEvent::StageStart { stage } => eprintln!("▶ {stage}"),
            RunEvent::StageEnd { stage, duration_ms } => {
                eprintln!("✓ {stage} ({duration_ms} ms)")
            }
            RunEvent::Thought { text } => eprintln!("  {text}"),
            RunEvent::FindingAdded { url } => eprintln!("  + finding from {url}"),
            RunEvent::PartialReportToken { .. } => {}
            RunEvent::Error { kind, detail } => eprintln!("! {kind}: {detail}"),
            RunEvent::Done { state } => {
                if let Some(critique) = &state.critique {
                    eprintln!(
                        "critique: completeness {:.1}, accuracy {:.1}, relevance {:.1}, clarity {:.1} (total {:.1}/20)",
                        critique.completeness,
                        critique.accuracy,
                        critique.relevance,
                        critique.clarity,
                        critique.total
                    );
                }
                if state.needs_clarification {
                    if let Some(question) = &state.clarification_question {
                        println!("Clarification needed: {question}");
                    }
                } else {
                    println!("{}", state.report);
                }
            }
            RunEvent::End => break,
        }
    }

    Ok(())
}
