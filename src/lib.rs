//! Deep research orchestration engine
//!
//! Answers open-ended questions by driving a pipeline of cooperating
//! stages over pluggable external collaborators:
//!
//! ```text
//! Clarify ─▶ Plan ─▶ Supervise ─▶ Research ─▶ Compress ─▶ Write ─▶ Critique
//!    │                              ▲   │
//!    └─▶ (clarification requested)  └───┘ bounded loop / fan-out
//! ```
//!
//! The engine owns orchestration only. Web search, page fetching, model
//! endpoints, and checkpoint storage are traits in [`provider`]; concrete
//! reqwest-backed implementations ship alongside but are optional wiring.
//!
//! # Usage
//!
//! ```ignore
//! use deepresearch::{ResearchRunner, RunOptions, RunnerConfig};
//! use deepresearch::provider::{ModelRegistry, openai::OpenAiCompatEndpoint, tavily::TavilySearch, fetcher::HttpFetcher};
//! use std::sync::Arc;
//!
//! let models = ModelRegistry::new().bind_all(Arc::new(OpenAiCompatEndpoint::from_env()?));
//! let runner = ResearchRunner::new(
//!     RunnerConfig::from_env()?,
//!     models,
//!     Arc::new(TavilySearch::from_env()?),
//!     Arc::new(HttpFetcher::new()),
//! );
//!
//! let mut handle = runner.start("What won the 2023 Turing Award?", RunOptions::default())?;
//! while let Some(event) = handle.events.recv().await {
//!     println!("{}", event.to_sse_frame());
//! }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod extract;
pub mod graph;
pub mod prompts;
pub mod provider;
pub mod research;
pub mod runner;
pub mod stages;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::RunnerConfig;
pub use error::{ProviderError, ResearchError};
pub use event::{CancellationToken, EventSink, RunEvent};
pub use graph::StageName;
pub use runner::{ResearchRunner, RunHandle, RunOptions};
pub use state::{
    Citation, CompressedFindings, CritiqueScores, Finding, PageContent, PageStatus,
    ResearchPlan, ResearchState, SearchRecord, StateDelta, Strategy, StrategyMode,
};
