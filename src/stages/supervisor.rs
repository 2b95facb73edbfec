//! Supervisor stage
//!
//! Chooses between sequential-depth and parallel-breadth execution. Pure
//! policy over the plan and query analysis, no model call. Parallel
//! breadth maximizes coverage on wide factual queries; the sequential loop
//! maximizes refinement where later searches depend on earlier analysis.

use async_trait::async_trait;
use tracing::debug;

use crate::error::ResearchError;
use crate::graph::StageName;
use crate::state::{ResearchPlan, ResearchState, StateDelta, Strategy, StrategyMode};

use super::{RunContext, Stage};

/// Stage 3: strategy selection.
pub struct SupervisorStage;

/// Whether the question compares two or more explicit subjects.
pub(crate) fn is_comparative(query: &str) -> bool {
    let lower = query.to_lowercase();
    lower.contains(" vs ")
        || lower.contains(" vs. ")
        || lower.contains("versus")
        || lower.contains("compare")
        || lower.contains("difference between")
}

/// The strategy policy, exposed for direct testing.
pub(crate) fn choose_strategy(
    plan: &ResearchPlan,
    query: &str,
    parallelism_cap: usize,
    iterations_cap: usize,
) -> Strategy {
    let n_queries = plan.queries.len();

    let strategy = if plan.depth == 3 || is_comparative(query) {
        // Depth via the loop: later searches build on earlier analysis.
        Strategy::sequential(3)
    } else if plan.depth == 1 || n_queries == 1 {
        Strategy::sequential(1)
    } else if plan.depth == 2 && n_queries <= 3 {
        Strategy::parallel(n_queries)
    } else {
        // Wide depth-2 plans: fan out over as many queries as allowed.
        Strategy::parallel(n_queries)
    };

    Strategy {
        mode: strategy.mode,
        max_parallelism: strategy.max_parallelism.min(parallelism_cap).max(1),
        max_iterations: strategy.max_iterations.min(iterations_cap).max(1),
    }
}

#[async_trait]
impl Stage for SupervisorStage {
    fn name(&self) -> StageName {
        StageName::Supervise
    }

    async fn run(
        &self,
        state: &ResearchState,
        ctx: &RunContext,
    ) -> Result<StateDelta, ResearchError> {
        ctx.check_cancelled()?;

        let plan = state
            .plan
            .as_ref()
            .ok_or_else(|| ResearchError::Input("supervisor requires a plan".into()))?;

        let strategy = choose_strategy(
            plan,
            &state.query,
            ctx.config.max_parallelism_cap,
            ctx.config.max_iterations_cap,
        );

        debug!(
            mode = ?strategy.mode,
            max_parallelism = strategy.max_parallelism,
            max_iterations = strategy.max_iterations,
            "strategy chosen"
        );

        let mut delta = StateDelta::empty();
        delta.strategy = Some(strategy);
        Ok(delta)
    }
}
