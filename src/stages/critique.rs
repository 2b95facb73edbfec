//! Critique stage
//!
//! Scores the report on completeness, accuracy, relevance, and clarity,
//! each in [0, 5]. Advisory only: it never gates the run, and a failed or
//! unparseable critique degrades to zero scores with a warning.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ResearchError;
use crate::extract::parse_json_loose;
use crate::graph::StageName;
use crate::prompts::Prompts;
use crate::provider::{ModelRequest, ModelRole};
use crate::state::{CritiqueScores, ResearchState, StateDelta};

use super::{RunContext, Stage};

#[derive(Debug, Deserialize)]
struct RawScores {
    #[serde(default)]
    completeness: f32,
    #[serde(default)]
    accuracy: f32,
    #[serde(default)]
    relevance: f32,
    #[serde(default)]
    clarity: f32,
}

/// Stage 7: report critique.
pub struct CritiqueStage;

#[async_trait]
impl Stage for CritiqueStage {
    fn name(&self) -> StageName {
        StageName::Critique
    }

    async fn run(
        &self,
        state: &ResearchState,
        ctx: &RunContext,
    ) -> Result<StateDelta, ResearchError> {
        ctx.check_cancelled()?;

        let compressed_text = state
            .compressed
            .as_ref()
            .map(|c| c.text.as_str())
            .unwrap_or("");
        let (system, prompt) = Prompts::critique(&state.query, &state.report, compressed_text);
        let request = ModelRequest::new(ModelRole::Critic, system, prompt);

        let mut delta = StateDelta::empty();

        let output = match ctx
            .race(ctx.models.call(&request, ctx.config.model_timeout))
            .await?
        {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "critique model call failed, scores degraded");
                delta.critique = Some(CritiqueScores::new(0.0, 0.0, 0.0, 0.0));
                return Ok(delta.with_warning(format!("critique degraded: {err}")));
            }
        };

        delta = delta.with_tokens(output.usage.tokens_in, output.usage.tokens_out);

        let scores = match parse_json_loose::<RawScores>(&output.text) {
            Some(raw) => {
                CritiqueScores::new(raw.completeness, raw.accuracy, raw.relevance, raw.clarity)
            }
            None => {
                warn!("critique output unparseable, scores degraded");
                delta
                    .warnings
                    .push("critique output unparseable".to_string());
                CritiqueScores::new(0.0, 0.0, 0.0, 0.0)
            }
        };

        debug!(total = scores.total, "critique complete");
        delta.critique = Some(scores);
        Ok(delta)
    }
}
