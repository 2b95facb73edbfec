//! Analyze step
//!
//! Extracts findings from fetched pages grounded in the original question,
//! emits exactly one thought per iteration in the think-tool format, and
//! decides whether more search is needed. Thoughts are consumed by
//! observability tooling and never re-fed to the model.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::extract::parse_json_loose;
use crate::prompts::Prompts;
use crate::provider::{ModelRequest, ModelRole, TokenUsage};
use crate::state::{Finding, PageContent};

use super::super::stages::RunContext;

/// Cap on how much page text goes into one analyzer prompt.
const PROMPT_BODY_BUDGET: usize = 4_000;

/// Analyzer loop decision.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzeAction {
    Continue { next_query: Option<String> },
    Finish,
}

/// Output of one analysis pass.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub findings: Vec<Finding>,
    pub thought: String,
    pub action: AnalyzeAction,
    pub usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(default)]
    claim: String,
    #[serde(default)]
    source_url: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    supporting_snippet: String,
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    findings: Vec<RawFinding>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    next_query: Option<String>,
}

/// Run one analysis over the pages read for `search_query`.
///
/// `result_count` is the number of search hits the query returned, and
/// `grounded` decides whether a claimed source URL is backed by evidence;
/// findings with ungrounded sources are dropped.
pub async fn analyze_pages(
    role: ModelRole,
    query: &str,
    focus_areas: &[String],
    search_query: &str,
    result_count: usize,
    pages: &[PageContent],
    grounded: impl Fn(&str) -> bool,
    ctx: &RunContext,
) -> AnalysisOutcome {
    let readable: Vec<&PageContent> = pages.iter().filter(|p| p.is_ok()).collect();

    if readable.is_empty() {
        return AnalysisOutcome {
            findings: Vec::new(),
            thought: format_thought(search_query, result_count, 0, &[], "need readable sources"),
            action: AnalyzeAction::Finish,
            usage: TokenUsage::default(),
        };
    }

    let pages_text = render_pages(&readable);
    let (system, prompt) = Prompts::analyze(query, focus_areas, search_query, &pages_text);
    let request = ModelRequest::new(role, system, prompt);

    let empty_outcome = |assessment: &str| AnalysisOutcome {
        findings: Vec::new(),
        thought: format_thought(search_query, result_count, readable.len(), &[], assessment),
        action: AnalyzeAction::Finish,
        usage: TokenUsage::default(),
    };

    // A cancelled or failed analysis drops this batch of pages, nothing
    // more; the caller's loop decision sees no new findings and stops.
    let output = match ctx
        .race(ctx.models.call(&request, ctx.config.model_timeout))
        .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            warn!(error = %err, "analysis model call failed");
            return empty_outcome("need retry, analysis failed");
        }
        Err(_) => return empty_outcome("need retry, cancelled"),
    };

    let parsed = parse_json_loose::<RawAnalysis>(&output.text).unwrap_or_else(|| {
        warn!("analysis output unparseable");
        RawAnalysis {
            findings: Vec::new(),
            summary: String::new(),
            action: "finish".into(),
            next_query: None,
        }
    });

    let findings: Vec<Finding> = parsed
        .findings
        .into_iter()
        .filter(|f| !f.claim.trim().is_empty())
        .filter(|f| {
            let ok = grounded(&f.source_url);
            if !ok {
                debug!(url = %f.source_url, "finding dropped: ungrounded source");
            }
            ok
        })
        .map(|f| Finding::new(f.claim, f.source_url, f.confidence, f.supporting_snippet))
        .collect();

    let action = match parsed.action.as_str() {
        "continue" => AnalyzeAction::Continue {
            next_query: parsed
                .next_query
                .filter(|q| !q.trim().is_empty()),
        },
        _ => AnalyzeAction::Finish,
    };

    let assessment = match &action {
        AnalyzeAction::Finish => "sufficient".to_string(),
        AnalyzeAction::Continue { next_query } => match next_query {
            Some(q) => format!("need {q}"),
            None => format!("need more on {}", summarize(&parsed.summary)),
        },
    };

    let snippets: Vec<&str> = findings
        .iter()
        .map(|f| f.supporting_snippet.as_str())
        .collect();

    AnalysisOutcome {
        thought: format_thought(
            search_query,
            result_count,
            readable.len(),
            &snippets,
            &assessment,
        ),
        findings,
        action,
        usage: output.usage,
    }
}

fn render_pages(pages: &[&PageContent]) -> String {
    let per_page = PROMPT_BODY_BUDGET / pages.len().max(1);
    pages
        .iter()
        .map(|p| {
            let body: String = p.body.chars().take(per_page).collect();
            format!("URL: {}\n{}\n", p.url, body)
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn summarize(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "the open focus areas".to_string();
    }
    trimmed.chars().take(80).collect()
}

/// Think-tool contract: one line per iteration in a fixed shape.
pub fn format_thought(
    query: &str,
    result_count: usize,
    url_count: usize,
    snippets: &[&str],
    assessment: &str,
) -> String {
    let key_snippets = if snippets.is_empty() {
        "none".to_string()
    } else {
        snippets
            .iter()
            .take(3)
            .map(|s| s.chars().take(60).collect::<String>())
            .collect::<Vec<_>>()
            .join("; ")
    };
    format!(
        "Query: {query} | Found {result_count} results, {url_count} URLs. Key snippets: {key_snippets} | Assessment: {assessment}"
    )
}

/// Sufficiency rule: stop when every focus area is covered by at least one
/// finding, or when the last two iterations together grew the findings by
/// less than 20%.
pub fn sufficiency_met(
    focus_areas: &[String],
    findings: &[Finding],
    counts_per_iteration: &[usize],
) -> bool {
    if !focus_areas.is_empty() && focus_areas.iter().all(|area| area_covered(area, findings)) {
        return true;
    }

    if counts_per_iteration.len() >= 2 {
        let recent: usize = counts_per_iteration[counts_per_iteration.len() - 2..]
            .iter()
            .sum();
        let before: usize = findings.len().saturating_sub(recent);
        if before > 0 && (recent as f32) < 0.2 * before as f32 {
            return true;
        }
    }

    false
}

fn area_covered(area: &str, findings: &[Finding]) -> bool {
    let anchors: Vec<String> = area
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_string())
        .collect();
    if anchors.is_empty() {
        return true;
    }
    findings.iter().any(|f| {
        let claim = f.claim.to_lowercase();
        anchors.iter().any(|a| claim.contains(a.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::event::{CancellationToken, EventSink};
    use crate::provider::ModelRegistry;
    use crate::test_support::{NullFetcher, NullSearch, ScriptedModel};
    use std::sync::Arc;

    fn ctx_with_model(model: ScriptedModel) -> RunContext {
        RunContext {
            config: RunnerConfig::default(),
            models: ModelRegistry::new().bind_all(Arc::new(model)),
            search: Arc::new(NullSearch),
            fetcher: Arc::new(NullFetcher),
            events: EventSink::channel().0,
            cancel: CancellationToken::new(),
        }
    }

    fn page(url: &str, body: &str) -> PageContent {
        PageContent::ok(url, body)
    }

    #[tokio::test]
    async fn findings_extracted_and_grounded() {
        let model = ScriptedModel::returning(
            r#"{"findings": [
                  {"claim": "the sky is blue", "source_url": "https://a.com", "confidence": 0.9, "supporting_snippet": "blue sky"},
                  {"claim": "made up", "source_url": "https://evil.com", "confidence": 0.9, "supporting_snippet": "x"}
                ],
                "summary": "colors", "action": "finish", "next_query": null}"#,
        );
        let ctx = ctx_with_model(model);
        let pages = vec![page("https://a.com", "the sky is blue today")];

        let outcome = analyze_pages(
            ModelRole::Analyzer,
            "why is the sky blue",
            &[],
            "sky color",
            3,
            &pages,
            |url| url == "https://a.com",
            &ctx,
        )
        .await;

        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].source_url, "https://a.com");
        assert_eq!(outcome.action, AnalyzeAction::Finish);
    }

    #[tokio::test]
    async fn continue_carries_next_query() {
        let model = ScriptedModel::returning(
            r#"{"findings": [], "summary": "partial", "action": "continue", "next_query": "sky color physics"}"#,
        );
        let ctx = ctx_with_model(model);
        let pages = vec![page("https://a.com", "body")];

        let outcome = analyze_pages(
            ModelRole::Analyzer,
            "q",
            &[],
            "sq",
            1,
            &pages,
            |_| true,
            &ctx,
        )
        .await;

        assert_eq!(
            outcome.action,
            AnalyzeAction::Continue {
                next_query: Some("sky color physics".into())
            }
        );
        assert!(outcome.thought.contains("Assessment: need sky color physics"));
    }

    #[tokio::test]
    async fn no_readable_pages_finishes_without_model_call() {
        let model = ScriptedModel::returning("should never be called");
        let ctx = ctx_with_model(model);
        let pages = vec![PageContent::failed(
            "https://b.com",
            crate::state::PageStatus::Blocked,
        )];

        let outcome = analyze_pages(
            ModelRole::Analyzer,
            "q",
            &[],
            "sq",
            2,
            &pages,
            |_| true,
            &ctx,
        )
        .await;

        assert!(outcome.findings.is_empty());
        assert_eq!(outcome.action, AnalyzeAction::Finish);
        assert!(outcome.thought.starts_with("Query: sq |"));
    }

    #[tokio::test]
    async fn model_failure_drops_batch_not_run() {
        let model = ScriptedModel::always_failing();
        let ctx = ctx_with_model(model);
        let pages = vec![page("https://a.com", "body")];

        let outcome = analyze_pages(
            ModelRole::Analyzer,
            "q",
            &[],
            "sq",
            1,
            &pages,
            |_| true,
            &ctx,
        )
        .await;

        assert!(outcome.findings.is_empty());
        assert_eq!(outcome.action, AnalyzeAction::Finish);
    }

    #[test]
    fn thought_format_matches_contract() {
        let thought = format_thought("rust async", 5, 3, &["tokio is popular"], "sufficient");
        assert_eq!(
            thought,
            "Query: rust async | Found 5 results, 3 URLs. Key snippets: tokio is popular | Assessment: sufficient"
        );
    }

    #[test]
    fn sufficiency_by_coverage() {
        let findings = vec![
            Finding::new("tokio dominates async runtimes", "u", 0.9, "s"),
            Finding::new("smol is lightweight", "u", 0.8, "s"),
        ];
        let areas = vec!["tokio runtime".to_string(), "smol".to_string()];
        assert!(sufficiency_met(&areas, &findings, &[2]));

        let uncovered = vec!["performance benchmarks".to_string()];
        assert!(!sufficiency_met(&uncovered, &findings, &[2]));
    }

    #[test]
    fn sufficiency_by_diminishing_returns() {
        // 10 findings before, 1 across the last two iterations: < 20% growth.
        let findings: Vec<Finding> = (0..11)
            .map(|i| Finding::new(format!("claim {i}"), "u", 0.5, "s"))
            .collect();
        assert!(sufficiency_met(
            &["unmatched area".to_string()],
            &findings,
            &[10, 1, 0]
        ));

        // Strong growth keeps going.
        assert!(!sufficiency_met(
            &["unmatched area".to_string()],
            &findings,
            &[3, 4, 4]
        ));
    }
}
