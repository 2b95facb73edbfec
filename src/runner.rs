//! Run coordinator
//!
//! Owns the state for one run, drives the stage graph, enforces the
//! overall deadline, honors cancellation, saves checkpoints at stage
//! boundaries, and emits the event stream. The coordinator is the only
//! component that terminates the pipeline; stages return best-effort
//! deltas and the coordinator decides what a failure means for the run.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::error::ResearchError;
use crate::event::{CancellationToken, EventSink, RunEvent};
use crate::graph::{next_target, StageName, Target, TransitionLabel, ENTRY};
use crate::provider::{CheckpointSink, ModelRegistry, PageFetcher, SearchProvider};
use crate::research::ResearchStage;
use crate::stages::clarify::ClarifyStage;
use crate::stages::compress::CompressStage;
use crate::stages::critique::CritiqueStage;
use crate::stages::planner::PlannerStage;
use crate::stages::supervisor::SupervisorStage;
use crate::stages::writer::WriterStage;
use crate::stages::{RunContext, Stage};
use crate::state::{ResearchState, Strategy};

/// Per-run options. Unknown options are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunOptions {
    pub thread_id: Option<String>,
    pub max_iterations_override: Option<usize>,
    pub max_parallelism_override: Option<usize>,
    pub overall_deadline_ms: Option<u64>,
    pub enable_plugin_tools: Option<bool>,
}

impl RunOptions {
    /// Parse options from a JSON object, rejecting unknown keys.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ResearchError> {
        serde_json::from_value(value)
            .map_err(|e| ResearchError::Input(format!("invalid options: {e}")))
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_deadline_ms(mut self, ms: u64) -> Self {
        self.overall_deadline_ms = Some(ms);
        self
    }
}

/// A started run: the event stream, its cancellation token, and the task
/// handle resolving to the final state.
pub struct RunHandle {
    pub events: UnboundedReceiver<RunEvent>,
    cancel: CancellationToken,
    pub join: JoinHandle<ResearchState>,
}

impl RunHandle {
    /// Request cooperative cancellation of the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// The research engine entry point.
pub struct ResearchRunner {
    config: RunnerConfig,
    models: ModelRegistry,
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
    checkpoint: Option<Arc<dyn CheckpointSink>>,
}

impl ResearchRunner {
    pub fn new(
        config: RunnerConfig,
        models: ModelRegistry,
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        Self {
            config,
            models,
            search,
            fetcher,
            checkpoint: None,
        }
    }

    /// Attach a checkpoint sink; the coordinator saves after every stage.
    pub fn with_checkpoint(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoint = Some(sink);
        self
    }

    /// Start a run. Input validation failures surface immediately; after
    /// that, all outcomes arrive on the event stream.
    pub fn start(
        &self,
        query: impl Into<String>,
        options: RunOptions,
    ) -> Result<RunHandle, ResearchError> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(ResearchError::Input("query must not be empty".into()));
        }
        if let Some(deadline) = options.overall_deadline_ms {
            if deadline == 0 {
                return Err(ResearchError::Input(
                    "overall_deadline_ms must be positive".into(),
                ));
            }
        }

        let mut config = self.config.clone();
        if let Some(ms) = options.overall_deadline_ms {
            config.overall_deadline = Duration::from_millis(ms);
        }
        if let Some(enabled) = options.enable_plugin_tools {
            config.enable_plugin_tools = enabled;
        }

        let thread_id = options
            .thread_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let state = ResearchState::new(query, thread_id);

        let (events, rx) = EventSink::channel();
        let cancel = CancellationToken::new();

        let ctx = RunContext {
            config,
            models: self.models.clone(),
            search: Arc::clone(&self.search),
            fetcher: Arc::clone(&self.fetcher),
            events,
            cancel: cancel.clone(),
        };

        let checkpoint = self.checkpoint.clone();
        let max_iterations_override = options.max_iterations_override;
        let max_parallelism_override = options.max_parallelism_override;

        let join = tokio::spawn(run_pipeline(
            state,
            ctx,
            checkpoint,
            max_iterations_override,
            max_parallelism_override,
        ));

        Ok(RunHandle {
            events: rx,
            cancel,
            join,
        })
    }
}

fn stage_for(name: StageName) -> Box<dyn Stage> {
    match name {
        StageName::Clarify => Box::new(ClarifyStage),
        StageName::Plan => Box::new(PlannerStage),
        StageName::Supervise => Box::new(SupervisorStage),
        StageName::Research => Box::new(ResearchStage),
        StageName::Compress => Box::new(CompressStage),
        StageName::Write => Box::new(WriterStage),
        StageName::Critique => Box::new(CritiqueStage),
    }
}

/// Clamp a supervisor strategy to run-level overrides and hard caps.
fn apply_strategy_overrides(
    strategy: Strategy,
    max_iterations_override: Option<usize>,
    max_parallelism_override: Option<usize>,
    config: &RunnerConfig,
) -> Strategy {
    let mut adjusted = strategy;
    if let Some(iters) = max_iterations_override {
        adjusted.max_iterations = iters.max(1);
    }
    if let Some(par) = max_parallelism_override {
        adjusted.max_parallelism = par.max(1);
    }
    adjusted.max_iterations = adjusted.max_iterations.min(config.max_iterations_cap);
    adjusted.max_parallelism = adjusted.max_parallelism.min(config.max_parallelism_cap);
    adjusted
}

async fn save_checkpoint(
    checkpoint: &Option<Arc<dyn CheckpointSink>>,
    state: &ResearchState,
) {
    if let Some(sink) = checkpoint {
        if let Err(err) = sink.save(&state.thread_id, state).await {
            // Checkpointing is best-effort; the run continues.
            warn!(thread_id = %state.thread_id, error = %err, "checkpoint save failed");
        }
    }
}

fn finish(mut state: ResearchState, ctx: &RunContext, error: Option<&ResearchError>) -> ResearchState {
    if let Some(err) = error {
        ctx.events.emit(RunEvent::Error {
            kind: err.kind().to_string(),
            detail: err.to_string(),
        });
    }
    state.seal();
    ctx.events.emit(RunEvent::Done {
        state: Box::new(state.clone()),
    });
    ctx.events.emit(RunEvent::End);
    state
}

async fn run_pipeline(
    mut state: ResearchState,
    ctx: RunContext,
    checkpoint: Option<Arc<dyn CheckpointSink>>,
    max_iterations_override: Option<usize>,
    max_parallelism_override: Option<usize>,
) -> ResearchState {
    let deadline_at = Instant::now() + ctx.config.overall_deadline;
    let mut current = ENTRY;

    info!(thread_id = %state.thread_id, query = %state.query, "run started");

    loop {
        if ctx.cancel.is_cancelled() {
            return finish(state, &ctx, Some(&ResearchError::Cancelled));
        }

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let err = ResearchError::DeadlineExceeded(ctx.config.overall_deadline);
            return finish(state, &ctx, Some(&err));
        }

        let stage = stage_for(current);
        ctx.events.emit(RunEvent::StageStart { stage: current });
        let started = Instant::now();

        let result = timeout(remaining, stage.run(&state, &ctx)).await;

        match result {
            Err(_) => {
                let err = ResearchError::DeadlineExceeded(ctx.config.overall_deadline);
                return finish(state, &ctx, Some(&err));
            }
            Ok(Err(ResearchError::Cancelled)) => {
                return finish(state, &ctx, Some(&ResearchError::Cancelled));
            }
            Ok(Err(err)) => {
                // Stage-fatal failure: report it and return what we have.
                return finish(state, &ctx, Some(&err));
            }
            Ok(Ok(delta)) => {
                state.apply(delta);
                ctx.events.emit(RunEvent::StageEnd {
                    stage: current,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        }

        if current == StageName::Supervise {
            if let Some(strategy) = state.strategy {
                state.strategy = Some(apply_strategy_overrides(
                    strategy,
                    max_iterations_override,
                    max_parallelism_override,
                    &ctx.config,
                ));
            }
        }

        save_checkpoint(&checkpoint, &state).await;

        let label = if current == StageName::Clarify && state.needs_clarification {
            TransitionLabel::NeedsClarification
        } else {
            TransitionLabel::Next
        };

        match next_target(current, label) {
            Some(Target::Stage(next)) => current = next,
            Some(Target::End) | None => {
                if label == TransitionLabel::NeedsClarification {
                    let question = state
                        .clarification_question
                        .clone()
                        .unwrap_or_default();
                    let err = ResearchError::ClarificationRequested(question);
                    return finish(state, &ctx, Some(&err));
                }
                info!(thread_id = %state.thread_id, "run complete");
                return finish(state, &ctx, None);
            }
        }
    }
}
