//! Planner stage
//!
//! Turns the cleared query into 2–5 search queries, 2–6 focus areas, and a
//! depth level. The planner rejects its own output and retries once when a
//! query rule is violated; after that the output is kept with a soft
//! warning so downstream stages still function.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ResearchError;
use crate::extract::parse_json_loose;
use crate::graph::StageName;
use crate::prompts::Prompts;
use crate::provider::{ModelRequest, ModelRole};
use crate::state::{ResearchPlan, ResearchState, StateDelta};

use super::{RunContext, Stage};

#[derive(Debug, Deserialize)]
struct PlanOutput {
    #[serde(default)]
    queries: Vec<String>,
    #[serde(default)]
    focus_areas: Vec<String>,
    #[serde(default)]
    depth: u8,
}

/// Stage 2: query planning.
pub struct PlannerStage;

/// Lowercased alphanumeric tokens of a query.
fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// The normalized 4-gram prefix used for the lexical-diversity rule. For
/// queries shorter than four tokens, the whole token list is the prefix.
fn prefix_4gram(query: &str) -> Vec<String> {
    let mut t = tokens(query);
    t.truncate(4);
    t
}

/// Check the planner's own rules. Returns the list of violations, empty
/// when the plan is acceptable.
pub(crate) fn rule_violations(plan: &ResearchPlan, original_query: &str) -> Vec<String> {
    let mut violations = Vec::new();

    if plan.queries.len() < 2 || plan.queries.len() > 5 {
        violations.push(format!(
            "expected 2-5 queries, got {}",
            plan.queries.len()
        ));
    }

    for i in 0..plan.queries.len() {
        for j in (i + 1)..plan.queries.len() {
            if prefix_4gram(&plan.queries[i]) == prefix_4gram(&plan.queries[j]) {
                violations.push(format!(
                    "queries {} and {} share a 4-gram prefix",
                    i + 1,
                    j + 1
                ));
            }
        }
    }

    // Anchor rule: every query must mention a concept from the question.
    let anchors: Vec<String> = tokens(original_query)
        .into_iter()
        .filter(|t| t.len() >= 3)
        .collect();
    if !anchors.is_empty() {
        for (i, query) in plan.queries.iter().enumerate() {
            let query_tokens = tokens(query);
            if !query_tokens.iter().any(|t| anchors.contains(t)) {
                violations.push(format!("query {} mentions nothing from the question", i + 1));
            }
        }
    }

    violations
}

fn sanitize(mut plan: ResearchPlan) -> ResearchPlan {
    plan.depth = plan.depth.clamp(1, 3);
    plan.queries.truncate(5);
    plan.focus_areas.truncate(6);
    if plan.focus_areas.len() < 2 {
        plan.focus_areas.push("overview".to_string());
        if plan.focus_areas.len() < 2 {
            plan.focus_areas.push("current state".to_string());
        }
    }
    plan
}

fn fallback_plan(query: &str) -> ResearchPlan {
    ResearchPlan {
        queries: vec![query.to_string(), format!("{query} explained")],
        focus_areas: vec!["background".to_string(), "current state".to_string()],
        depth: 2,
    }
}

impl PlannerStage {
    async fn one_attempt(
        &self,
        state: &ResearchState,
        ctx: &RunContext,
        delta: &mut StateDelta,
    ) -> Result<Option<ResearchPlan>, ResearchError> {
        let (system, prompt) = Prompts::plan(&state.query, &state.query_analysis);
        let request = ModelRequest::new(ModelRole::Planner, system, prompt);

        let output = ctx
            .race(ctx.models.call(&request, ctx.config.model_timeout))
            .await??;
        *delta = std::mem::take(delta).with_tokens(output.usage.tokens_in, output.usage.tokens_out);

        Ok(parse_json_loose::<PlanOutput>(&output.text)
            .filter(|p| !p.queries.is_empty())
            .map(|p| {
                sanitize(ResearchPlan {
                    queries: p.queries,
                    focus_areas: p.focus_areas,
                    depth: p.depth,
                })
            }))
    }
}

#[async_trait]
impl Stage for PlannerStage {
    fn name(&self) -> StageName {
        StageName::Plan
    }

    async fn run(
        &self,
        state: &ResearchState,
        ctx: &RunContext,
    ) -> Result<StateDelta, ResearchError> {
        ctx.check_cancelled()?;

        let mut delta = StateDelta::empty();

        let first = match self.one_attempt(state, ctx, &mut delta).await {
            Ok(plan) => plan,
            Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
            Err(err) => {
                warn!(error = %err, "planner model call failed, using fallback plan");
                delta.plan = Some(fallback_plan(&state.query));
                return Ok(delta.with_warning(format!("planner degraded: {err}")));
            }
        };

        let plan = match first {
            Some(plan) if rule_violations(&plan, &state.query).is_empty() => plan,
            first => {
                // One self-rejection retry; a second violation is kept with
                // a soft warning.
                debug!("planner output rejected, retrying once");
                let second = self.one_attempt(state, ctx, &mut delta).await.ok().flatten();
                match second.or(first) {
                    Some(plan) => {
                        let violations = rule_violations(&plan, &state.query);
                        if !violations.is_empty() {
                            warn!(?violations, "keeping plan despite rule violations");
                            delta
                                .warnings
                                .push(format!("plan rules violated: {}", violations.join("; ")));
                        }
                        plan
                    }
                    None => {
                        delta
                            .warnings
                            .push("planner output unparseable, using fallback plan".to_string());
                        fallback_plan(&state.query)
                    }
                }
            }
        };

        debug!(
            queries = plan.queries.len(),
            focus_areas = plan.focus_areas.len(),
            depth = plan.depth,
            "plan ready"
        );
        delta.plan = Some(plan);
        Ok(delta)
    }
}
