//! Clarify stage
//!
//! Decides whether the query is specific enough to research. Parsing is
//! never allowed to block the pipeline: after the model's one retry, the
//! stage falls back to "clear" with `query_analysis = "unparseable"`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ResearchError;
use crate::extract::parse_json_loose;
use crate::graph::StageName;
use crate::prompts::Prompts;
use crate::provider::{ModelRequest, ModelRole};
use crate::state::{ResearchState, StateDelta};

use super::{RunContext, Stage};

#[derive(Debug, Deserialize)]
struct ClarifyVerdict {
    needs_clarification: bool,
    #[serde(default)]
    clarification_question: Option<String>,
    #[serde(default)]
    query_analysis: String,
    #[serde(default)]
    detected_topics: Vec<String>,
}

/// Stage 1: clarity decision.
pub struct ClarifyStage;

#[async_trait]
impl Stage for ClarifyStage {
    fn name(&self) -> StageName {
        StageName::Clarify
    }

    async fn run(
        &self,
        state: &ResearchState,
        ctx: &RunContext,
    ) -> Result<StateDelta, ResearchError> {
        ctx.check_cancelled()?;

        let (system, prompt) = Prompts::clarify(&state.query);
        let request = ModelRequest::new(ModelRole::Planner, system, prompt);

        let mut delta = StateDelta::empty();

        let output = match ctx
            .race(ctx.models.call(&request, ctx.config.model_timeout))
            .await?
        {
            Ok(output) => output,
            Err(err) => {
                // Model unavailable: assume the query is clear and move on.
                warn!(error = %err, "clarify model call failed, assuming query is clear");
                delta.needs_clarification = Some(false);
                delta.query_analysis = Some("unparseable".into());
                return Ok(delta.with_warning(format!("clarify degraded: {err}")));
            }
        };

        delta = delta.with_tokens(output.usage.tokens_in, output.usage.tokens_out);

        // One re-ask when the response does not parse into the schema.
        let mut verdict = parse_json_loose::<ClarifyVerdict>(&output.text);
        if verdict.is_none() {
            debug!("clarify output unparseable, asking once more");
            if let Ok(Ok(retry)) = ctx
                .race(ctx.models.call(&request, ctx.config.model_timeout))
                .await
            {
                delta = delta.with_tokens(retry.usage.tokens_in, retry.usage.tokens_out);
                verdict = parse_json_loose::<ClarifyVerdict>(&retry.text);
            }
        }

        match verdict {
            Some(verdict) => {
                debug!(
                    needs_clarification = verdict.needs_clarification,
                    topics = verdict.detected_topics.len(),
                    "clarify verdict parsed"
                );
                let needs = verdict.needs_clarification;
                delta.needs_clarification = Some(needs);
                if needs {
                    let question = verdict
                        .clarification_question
                        .filter(|q| !q.trim().is_empty())
                        .unwrap_or_else(|| {
                            "Could you narrow the question down? What aspect, timeframe, or \
                             context are you interested in?"
                                .to_string()
                        });
                    delta.clarification_question = Some(question);
                }
                delta.query_analysis = Some(verdict.query_analysis);
                delta.detected_topics = verdict.detected_topics;
            }
            None => {
                warn!("clarify output unparseable, assuming query is clear");
                delta.needs_clarification = Some(false);
                delta.query_analysis = Some("unparseable".into());
            }
        }

        Ok(delta)
    }
}
