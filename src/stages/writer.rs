//! Writer stage
//!
//! Produces the cited report from the compressed findings. Output tokens
//! are forwarded to the event stream as they arrive; citation validation
//! runs after end-of-stream. On a validation failure the writer is invoked
//! once more with a correction directive; a second failure emits a
//! `citation` error event but the best-effort report is still kept.

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::ResearchError;
use crate::event::RunEvent;
use crate::graph::StageName;
use crate::prompts::Prompts;
use crate::provider::{ModelRequest, ModelRole, TokenUsage};
use crate::state::{Citation, CompressedFindings, ResearchState, StateDelta};

use super::{RunContext, Stage};

/// Stage 6: report writing.
pub struct WriterStage;

/// Render the numbered source list handed to the model and appended to
/// reports that lack one.
fn render_sources(citations: &[Citation]) -> String {
    citations
        .iter()
        .map(|c| match &c.title {
            Some(title) => format!("[{}] {}: {}", c.id, title, c.url),
            None => format!("[{}] {}", c.id, c.url),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Citation ids referenced by `[n]` markers in the report.
fn cited_ids(report: &str) -> Vec<usize> {
    // Unwrap is fine: the pattern is a literal.
    let marker = Regex::new(r"\[(\d+)\]").unwrap();
    marker
        .captures_iter(report)
        .filter_map(|c| c[1].parse::<usize>().ok())
        .collect()
}

/// Validate the report against its citation table. Returns the list of
/// problems, empty when the report passes.
pub(crate) fn validate_report(report: &str, citations: &[Citation]) -> Vec<String> {
    let mut problems = Vec::new();

    // Only body markers count; the sources list cites nothing by itself.
    let body = match report.find("## Sources") {
        Some(pos) => &report[..pos],
        None => report,
    };
    let known: Vec<usize> = citations.iter().map(|c| c.id).collect();
    let referenced = cited_ids(body);

    for id in &referenced {
        if !known.contains(id) {
            problems.push(format!("dangling citation marker [{id}]"));
        }
    }
    for id in &known {
        if !referenced.contains(id) {
            problems.push(format!("citation [{id}] is never referenced"));
        }
    }

    // Heuristic uncited-claim scan. Only meaningful when there are
    // citations to point at.
    if !citations.is_empty() {
        let claim_like = Regex::new(
            r"(?x)
            \d                                  # a number or date
            | \b(largest|smallest|fastest|slowest|best|worst|most|least|first|leading)\b
            ",
        )
        .unwrap();
        let has_marker = Regex::new(r"\[\d+\]").unwrap();

        for sentence in sentences(report) {
            // Proper nouns are detected on the original casing; the
            // number/superlative patterns on the folded sentence.
            let flagged = claim_like.is_match(&sentence.to_lowercase())
                || has_proper_noun(sentence);
            if flagged
                && !has_marker.is_match(sentence)
                && !sentence.trim_start().starts_with('#')
            {
                problems.push(format!(
                    "possibly uncited claim: {}",
                    sentence.chars().take(60).collect::<String>()
                ));
            }
        }
    }

    problems
}

/// A capitalized token after the first word reads as a proper noun.
fn has_proper_noun(sentence: &str) -> bool {
    sentence
        .split_whitespace()
        .skip(1)
        .any(|t| t.chars().next().is_some_and(|c| c.is_uppercase()))
}

/// Body sentences of the report, excluding headings and the sources list.
fn sentences(report: &str) -> Vec<&str> {
    let body = match report.find("## Sources") {
        Some(pos) => &report[..pos],
        None => report,
    };
    body.split(['.', '!', '?', '\n'])
        .map(|s| s.trim())
        .filter(|s| s.len() >= 30 && !s.starts_with('#'))
        .collect()
}

/// Ensure the report ends with a sources section rendered in ascending id
/// order.
fn with_sources_section(report: &str, citations: &[Citation]) -> String {
    if citations.is_empty() || report.contains("## Sources") {
        return report.to_string();
    }
    format!(
        "{}\n\n## Sources\n{}",
        report.trim_end(),
        render_sources(citations)
    )
}

impl WriterStage {
    /// First attempt: stream tokens to the event channel while
    /// accumulating the full report.
    async fn stream_attempt(
        &self,
        request: &ModelRequest,
        ctx: &RunContext,
    ) -> Result<(String, TokenUsage), ResearchError> {
        let mut stream = ctx
            .models
            .stream(request, ctx.config.model_timeout)
            .await
            .map_err(|e| ResearchError::model(ModelRole::Writer, e.to_string()))?;

        let mut report = String::new();
        let mut usage = TokenUsage::default();

        loop {
            let chunk = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(ResearchError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    if !chunk.delta.is_empty() {
                        ctx.events.report_token(&chunk.delta);
                        report.push_str(&chunk.delta);
                    }
                    if let Some(u) = chunk.usage {
                        usage = u;
                    }
                }
                Some(Err(err)) => {
                    return Err(ResearchError::model(ModelRole::Writer, err.to_string()))
                }
                None => break,
            }
        }

        Ok((report, usage))
    }
}

#[async_trait]
impl Stage for WriterStage {
    fn name(&self) -> StageName {
        StageName::Write
    }

    async fn run(
        &self,
        state: &ResearchState,
        ctx: &RunContext,
    ) -> Result<StateDelta, ResearchError> {
        ctx.check_cancelled()?;

        let compressed = state.compressed.clone().unwrap_or(CompressedFindings::default());
        let focus_areas = state
            .plan
            .as_ref()
            .map(|p| p.focus_areas.clone())
            .unwrap_or_default();
        let sources = render_sources(&compressed.citations);

        let (system, prompt) =
            Prompts::write(&state.query, &focus_areas, &compressed.text, &sources);
        let request = ModelRequest::new(ModelRole::Writer, system.clone(), prompt.clone());

        let mut delta = StateDelta::empty();

        // Attempt one: streamed. A stream failure is the writer's first
        // failed attempt; the correction pass below doubles as the retry.
        let (draft, problems) = match self.stream_attempt(&request, ctx).await {
            Ok((report, usage)) => {
                delta = delta.with_tokens(usage.tokens_in, usage.tokens_out);
                let report = with_sources_section(&report, &compressed.citations);
                let problems = validate_report(&report, &compressed.citations);
                (report, problems)
            }
            Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
            Err(err) => {
                warn!(error = %err, "writer stream failed");
                (String::new(), vec![format!("first attempt failed: {err}")])
            }
        };

        if problems.is_empty() {
            debug!(chars = draft.len(), "report validated on first attempt");
            delta.report = Some(draft);
            return Ok(delta);
        }

        // Attempt two: non-streamed, with the correction directive.
        debug!(problems = problems.len(), "writer retrying with corrections");
        let correction = format!(
            "{prompt}\n\n{}",
            Prompts::write_correction(&problems.join("\n"))
        );
        let retry_request = ModelRequest::new(ModelRole::Writer, system, correction);

        match ctx
            .race(ctx.models.call(&retry_request, ctx.config.model_timeout))
            .await?
        {
            Ok(output) => {
                delta = delta.with_tokens(output.usage.tokens_in, output.usage.tokens_out);
                let report = with_sources_section(&output.text, &compressed.citations);
                let remaining = validate_report(&report, &compressed.citations);
                if !remaining.is_empty() {
                    // Best-effort report is still returned.
                    let detail = remaining.join("; ");
                    warn!(%detail, "report failed validation twice");
                    ctx.events.emit(RunEvent::Error {
                        kind: "citation".into(),
                        detail: detail.clone(),
                    });
                    delta.warnings.push(format!("citation validation failed: {detail}"));
                }
                delta.report = Some(report);
                Ok(delta)
            }
            Err(err) if draft.is_empty() => {
                // Both attempts produced nothing: a genuine run failure.
                Err(ResearchError::model(ModelRole::Writer, err.to_string()))
            }
            Err(err) => {
                let detail = format!("correction attempt failed: {err}");
                warn!(%detail, "keeping first draft despite validation problems");
                ctx.events.emit(RunEvent::Error {
                    kind: "citation".into(),
                    detail: problems.join("; "),
                });
                delta.warnings.push(detail);
                delta.report = Some(draft);
                Ok(delta)
            }
        }
    }
}
