//! Pipeline stages
//!
//! Each stage is a pure function from a read-only view of the state to a
//! [`StateDelta`]; the run coordinator owns the state and merges the
//! deltas. Stages catch their own provider failures and degrade to
//! defaults wherever a sensible default exists.

pub mod clarify;
pub mod compress;
pub mod critique;
pub mod planner;
pub mod supervisor;
pub mod writer;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RunnerConfig;
use crate::error::ResearchError;
use crate::event::{CancellationToken, EventSink};
use crate::graph::StageName;
use crate::provider::{ModelRegistry, PageFetcher, SearchProvider};
use crate::state::{ResearchState, StateDelta};

/// Shared collaborators handed to every stage.
#[derive(Clone)]
pub struct RunContext {
    pub config: RunnerConfig,
    pub models: ModelRegistry,
    pub search: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub events: EventSink,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Bail out early if the run was cancelled.
    pub fn check_cancelled(&self) -> Result<(), ResearchError> {
        if self.cancel.is_cancelled() {
            Err(ResearchError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Race a suspension point against cancellation. The in-flight
    /// operation is abandoned when the token fires.
    pub async fn race<T>(
        &self,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, ResearchError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ResearchError::Cancelled),
            out = fut => Ok(out),
        }
    }
}

/// One named step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    async fn run(
        &self,
        state: &ResearchState,
        ctx: &RunContext,
    ) -> Result<StateDelta, ResearchError>;
}
