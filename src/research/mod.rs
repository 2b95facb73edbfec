//! Research subgraph
//!
//! The innermost engine: produces findings and page contents from the
//! plan. Two execution modes, chosen by the supervisor:
//!
//! - **Sequential**: Search → Read → Analyze in a loop bounded by the
//!   iteration budget, where each analysis may propose the next query.
//! - **Parallel**: one Search → Read → Analyze triple per plan query,
//!   fanned out up to `max_parallelism` tasks sharing a URL-dedup view,
//!   merged in plan order at the join.
//!
//! Guarantees: at most `max_iterations × |queries|` searches, no URL
//! fetched twice within a run, and a single fetch failure never fails the
//! run.

pub mod analyzer;
pub mod reader;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ResearchError;
use crate::graph::StageName;
use crate::provider::{search_with_retry, ModelRole, SearchHit};
use crate::state::{
    Finding, PageContent, ResearchState, SearchRecord, StateDelta, StrategyMode,
};

use self::analyzer::{analyze_pages, AnalyzeAction};
use self::reader::read_pages;

use super::stages::{RunContext, Stage};

/// Stage 4: the research subgraph.
pub struct ResearchStage;

#[async_trait]
impl Stage for ResearchStage {
    fn name(&self) -> StageName {
        StageName::Research
    }

    async fn run(
        &self,
        state: &ResearchState,
        ctx: &RunContext,
    ) -> Result<StateDelta, ResearchError> {
        let strategy = state
            .strategy
            .ok_or_else(|| ResearchError::Input("research requires a strategy".into()))?;
        let plan = state
            .plan
            .clone()
            .ok_or_else(|| ResearchError::Input("research requires a plan".into()))?;

        match strategy.mode {
            StrategyMode::Sequential => {
                run_sequential(state, &plan.queries, &plan.focus_areas, strategy.max_iterations, ctx)
                    .await
            }
            StrategyMode::Parallel => {
                run_parallel(state, &plan.queries, &plan.focus_areas, strategy.max_parallelism, ctx)
                    .await
            }
        }
    }
}

/// Execute one search, demoting failures to an empty result. Only
/// cancellation surfaces as an error.
async fn search_step(
    query: &str,
    ctx: &RunContext,
) -> Result<(Vec<SearchHit>, Option<String>), ResearchError> {
    let result = ctx
        .race(search_with_retry(
            ctx.search.as_ref(),
            query,
            ctx.config.max_search_results,
            ctx.config.search_timeout,
        ))
        .await?;

    Ok(match result {
        Ok(hits) => (hits, None),
        Err(err) => {
            warn!(query, error = %err, "search demoted to empty result");
            (Vec::new(), Some(format!("search failed for '{query}': {err}")))
        }
    })
}

/// Sequential mode: loop until the analyzer says sufficient or the
/// iteration cap is hit.
async fn run_sequential(
    state: &ResearchState,
    plan_queries: &[String],
    focus_areas: &[String],
    max_iterations: usize,
    ctx: &RunContext,
) -> Result<StateDelta, ResearchError> {
    let mut delta = StateDelta::empty();
    let mut executed: HashSet<String> = state
        .search_history
        .iter()
        .map(|r| r.query.clone())
        .collect();
    let mut seen_urls: HashSet<String> = state.read_urls().into_iter().collect();
    let mut proposed_query: Option<String> = None;
    let mut counts_per_iteration: Vec<usize> = Vec::new();
    let mut all_findings: Vec<Finding> = state.findings.clone();

    for iteration in 0..max_iterations {
        if ctx.cancel.is_cancelled() {
            // Partial findings are preserved; the coordinator reports the
            // cancellation.
            break;
        }

        // One unexecuted query: the analyzer's proposal first, then the
        // next planned query.
        let query = proposed_query
            .take()
            .filter(|q| !executed.contains(q))
            .or_else(|| {
                plan_queries
                    .iter()
                    .find(|q| !executed.contains(*q))
                    .cloned()
            });
        let Some(query) = query else {
            debug!("no queries left to execute");
            break;
        };

        info!(iteration, %query, "sequential research iteration");

        let Ok((hits, warning)) = search_step(&query, ctx).await else {
            // Cancelled mid-search; keep what we have.
            break;
        };
        executed.insert(query.clone());
        if let Some(w) = warning {
            delta.warnings.push(w);
        }
        delta.search_history.push(SearchRecord::new(
            &query,
            hits.iter().map(|h| h.url.clone()).collect(),
        ));

        // Read: only URLs not already fetched this run.
        let new_urls: Vec<String> = hits
            .iter()
            .map(|h| h.url.clone())
            .filter(|u| !seen_urls.contains(u))
            .collect();
        for url in &new_urls {
            seen_urls.insert(url.clone());
        }

        let pages = read_pages(new_urls, ctx).await;

        let outcome = {
            let search_urls: HashSet<String> = delta
                .search_history
                .iter()
                .chain(state.search_history.iter())
                .flat_map(|r| r.result_urls.iter().cloned())
                .collect();
            let ok_urls: HashSet<String> = pages
                .iter()
                .filter(|p| p.is_ok())
                .map(|p| p.url.clone())
                .collect();

            analyze_pages(
                ModelRole::Analyzer,
                &state.query,
                focus_areas,
                &query,
                hits.len(),
                &pages,
                |url| ok_urls.contains(url) || search_urls.contains(url),
                ctx,
            )
            .await
        };

        delta.read_contents.extend(pages);
        delta = delta.with_tokens(outcome.usage.tokens_in, outcome.usage.tokens_out);

        for finding in &outcome.findings {
            ctx.events.finding_added(&finding.source_url);
        }
        let new_count = outcome.findings.len();
        counts_per_iteration.push(new_count);
        all_findings.extend(outcome.findings.iter().cloned());
        delta.findings.extend(outcome.findings);

        ctx.events.thought(&outcome.thought);
        delta.thoughts.push(outcome.thought);
        delta.iterations += 1;

        // Loop decision: continue only if the analyzer wants to, budget
        // remains, this iteration produced something new, and the
        // sufficiency rule is not already met.
        let wants_continue = match outcome.action {
            AnalyzeAction::Continue { next_query } => {
                proposed_query = next_query;
                true
            }
            AnalyzeAction::Finish => false,
        };

        let budget_left = iteration + 1 < max_iterations;
        let sufficient =
            analyzer::sufficiency_met(focus_areas, &all_findings, &counts_per_iteration);

        if !(wants_continue && budget_left && new_count > 0 && !sufficient) {
            debug!(
                wants_continue,
                budget_left, new_count, sufficient, "sequential loop finishing"
            );
            break;
        }
    }

    Ok(delta)
}

/// Result of one parallel research task, merged at the join.
struct TaskOutput {
    search_record: SearchRecord,
    pages: Vec<PageContent>,
    findings: Vec<Finding>,
    thought: String,
    tokens_in: u64,
    tokens_out: u64,
    warning: Option<String>,
}

/// Parallel mode: fan out one Search → Read → Analyze triple per query.
async fn run_parallel(
    state: &ResearchState,
    plan_queries: &[String],
    focus_areas: &[String],
    max_parallelism: usize,
    ctx: &RunContext,
) -> Result<StateDelta, ResearchError> {
    let queries: Vec<String> = plan_queries.iter().take(max_parallelism).cloned().collect();

    // The only shared mutable state across tasks: the URL-dedup view.
    // The lock is taken to claim URLs and released before any fetch.
    let seen_urls: Arc<Mutex<HashSet<String>>> =
        Arc::new(Mutex::new(state.read_urls().into_iter().collect()));

    let mut handles = Vec::with_capacity(queries.len());
    for query in &queries {
        let query = query.clone();
        let research_query = state.query.clone();
        let focus_areas = focus_areas.to_vec();
        let seen_urls = Arc::clone(&seen_urls);
        let ctx = ctx.clone();

        handles.push(tokio::spawn(async move {
            if ctx.cancel.is_cancelled() {
                return None;
            }

            let Ok((hits, warning)) = search_step(&query, &ctx).await else {
                return None;
            };
            let search_record =
                SearchRecord::new(&query, hits.iter().map(|h| h.url.clone()).collect());

            // Claim unfetched URLs under the lock, fetch outside it.
            let new_urls: Vec<String> = {
                let mut seen = seen_urls.lock().await;
                hits.iter()
                    .map(|h| h.url.clone())
                    .filter(|u| seen.insert(u.clone()))
                    .collect()
            };

            let pages = read_pages(new_urls, &ctx).await;

            let search_urls: HashSet<String> = search_record.result_urls.iter().cloned().collect();
            let ok_urls: HashSet<String> = pages
                .iter()
                .filter(|p| p.is_ok())
                .map(|p| p.url.clone())
                .collect();

            let outcome = analyze_pages(
                ModelRole::SearcherAnalyzer,
                &research_query,
                &focus_areas,
                &query,
                hits.len(),
                &pages,
                |url| ok_urls.contains(url) || search_urls.contains(url),
                &ctx,
            )
            .await;

            Some(TaskOutput {
                search_record,
                pages,
                findings: outcome.findings,
                thought: outcome.thought,
                tokens_in: outcome.usage.tokens_in,
                tokens_out: outcome.usage.tokens_out,
                warning,
            })
        }));
    }

    // Join in plan order so the merge is stable regardless of completion
    // order.
    let mut delta = StateDelta::empty();
    delta.iterations = 1;

    for (handle, query) in handles.into_iter().zip(queries.iter()) {
        match handle.await {
            Ok(Some(output)) => {
                delta.search_history.push(output.search_record);
                delta.read_contents.extend(output.pages);
                for finding in &output.findings {
                    ctx.events.finding_added(&finding.source_url);
                }
                delta.findings.extend(output.findings);
                ctx.events.thought(&output.thought);
                delta.thoughts.push(output.thought);
                delta.tokens_in += output.tokens_in;
                delta.tokens_out += output.tokens_out;
                if let Some(w) = output.warning {
                    delta.warnings.push(w);
                }
            }
            Ok(None) => {
                debug!(%query, "parallel task skipped by cancellation");
            }
            Err(join_err) => {
                // One failed task does not fail the fan-out.
                warn!(%query, error = %join_err, "parallel research task failed");
                delta
                    .warnings
                    .push(format!("research task for '{query}' failed: {join_err}"));
            }
        }
    }

    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::event::{CancellationToken, EventSink, RunEvent};
    use crate::provider::ModelRegistry;
    use crate::state::{ResearchPlan, Strategy};
    use crate::test_support::{FixedSearch, MapFetcher, ScriptedModel};

    fn base_state(queries: &[&str], strategy: Strategy) -> ResearchState {
        let mut state = ResearchState::new("what is the answer", "t");
        state.plan = Some(ResearchPlan {
            queries: queries.iter().map(|s| s.to_string()).collect(),
            focus_areas: vec!["background".into(), "specifics".into()],
            depth: 2,
        });
        state.strategy = Some(strategy);
        state
    }

    fn analysis_json(claim: &str, url: &str, action: &str, next: Option<&str>) -> String {
        format!(
            r#"{{"findings": [{{"claim": "{claim}", "source_url": "{url}", "confidence": 0.9, "supporting_snippet": "snip"}}],
                "summary": "s", "action": "{action}", "next_query": {}}}"#,
            match next {
                Some(q) => format!("\"{q}\""),
                None => "null".to_string(),
            }
        )
    }

    fn make_ctx(
        model: ScriptedModel,
        search: Arc<FixedSearch>,
        fetcher: Arc<MapFetcher>,
    ) -> (RunContext, tokio::sync::mpsc::UnboundedReceiver<RunEvent>) {
        let (events, rx) = EventSink::channel();
        (
            RunContext {
                config: RunnerConfig::default(),
                models: ModelRegistry::new().bind_all(Arc::new(model)),
                search,
                fetcher,
                events,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn single_query_depth_one_runs_once() {
        let search = Arc::new(FixedSearch::new(&["https://a.com", "https://b.com"]));
        let fetcher = Arc::new(MapFetcher::new(&[
            ("https://a.com", "body a"),
            ("https://b.com", "body b"),
        ]));
        let model = ScriptedModel::returning(&analysis_json(
            "an answer",
            "https://a.com",
            "finish",
            None,
        ));
        let (ctx, _rx) = make_ctx(model, Arc::clone(&search), Arc::clone(&fetcher));

        let state = base_state(&["only query"], Strategy::sequential(1));
        let delta = ResearchStage.run(&state, &ctx).await.unwrap();

        assert_eq!(search.call_count(), 1);
        assert_eq!(delta.iterations, 1);
        assert_eq!(delta.search_history.len(), 1);
        assert_eq!(delta.findings.len(), 1);
        assert_eq!(delta.thoughts.len(), 1);
        assert_eq!(delta.read_contents.len(), 2);
    }

    #[tokio::test]
    async fn sequential_loop_follows_proposed_query() {
        let search = Arc::new(FixedSearch::new(&["https://a.com"]));
        let fetcher = Arc::new(MapFetcher::new(&[("https://a.com", "body")]));
        // First iteration proposes a follow-up; second finishes. The page is
        // only fetched once, so the second analysis sees no readable pages
        // and finishes on its own as well.
        let model = ScriptedModel::sequence(vec![
            &analysis_json("first claim", "https://a.com", "continue", Some("follow up query")),
            &analysis_json("second claim", "https://a.com", "finish", None),
        ]);
        let (ctx, _rx) = make_ctx(model, Arc::clone(&search), Arc::clone(&fetcher));

        let state = base_state(&["seed query"], Strategy::sequential(3));
        let delta = ResearchStage.run(&state, &ctx).await.unwrap();

        assert_eq!(delta.search_history.len(), 2);
        assert_eq!(delta.search_history[0].query, "seed query");
        assert_eq!(delta.search_history[1].query, "follow up query");
        assert!(delta.iterations <= 3);
        // One thought per iteration.
        assert_eq!(delta.thoughts.len(), delta.iterations);
    }

    #[tokio::test]
    async fn iteration_cap_is_enforced() {
        let search = Arc::new(FixedSearch::new(&["https://a.com"]));
        let fetcher = Arc::new(MapFetcher::new(&[("https://a.com", "body")]));
        // Analyzer always wants to continue with a fresh query.
        let model = ScriptedModel::sequence(vec![
            &analysis_json("c1", "https://a.com", "continue", Some("q2")),
            &analysis_json("c2", "https://a.com", "continue", Some("q3")),
            &analysis_json("c3", "https://a.com", "continue", Some("q4")),
            &analysis_json("c4", "https://a.com", "continue", Some("q5")),
        ]);
        let (ctx, _rx) = make_ctx(model, Arc::clone(&search), Arc::clone(&fetcher));

        let state = base_state(&["seed"], Strategy::sequential(3));
        let delta = ResearchStage.run(&state, &ctx).await.unwrap();

        assert!(delta.iterations <= 3);
        assert!(delta.search_history.len() <= 3);
    }

    #[tokio::test]
    async fn no_url_fetched_twice() {
        let search = Arc::new(FixedSearch::new(&["https://a.com", "https://b.com"]));
        let fetcher = Arc::new(MapFetcher::new(&[
            ("https://a.com", "body a"),
            ("https://b.com", "body b"),
        ]));
        let model = ScriptedModel::sequence(vec![
            &analysis_json("c1", "https://a.com", "continue", Some("second query")),
            &analysis_json("c2", "https://b.com", "finish", None),
        ]);
        let (ctx, _rx) = make_ctx(model, Arc::clone(&search), Arc::clone(&fetcher));

        let state = base_state(&["first query"], Strategy::sequential(3));
        let _delta = ResearchStage.run(&state, &ctx).await.unwrap();

        assert_eq!(fetcher.fetch_count("https://a.com"), 1);
        assert_eq!(fetcher.fetch_count("https://b.com"), 1);
    }

    #[tokio::test]
    async fn parallel_mode_merges_in_plan_order() {
        let search = Arc::new(FixedSearch::new(&["https://shared.com"]));
        let fetcher = Arc::new(MapFetcher::new(&[("https://shared.com", "body")]));
        let model = ScriptedModel::returning(&analysis_json(
            "claim",
            "https://shared.com",
            "finish",
            None,
        ));
        let (ctx, _rx) = make_ctx(model, Arc::clone(&search), Arc::clone(&fetcher));

        let state = base_state(&["alpha", "beta", "gamma"], Strategy::parallel(3));
        let delta = ResearchStage.run(&state, &ctx).await.unwrap();

        // One search per task, merged in plan order.
        assert_eq!(delta.search_history.len(), 3);
        assert_eq!(delta.search_history[0].query, "alpha");
        assert_eq!(delta.search_history[1].query, "beta");
        assert_eq!(delta.search_history[2].query, "gamma");
        assert_eq!(delta.iterations, 1);
        // All tasks hit the same URL; only one fetch happened.
        assert_eq!(fetcher.fetch_count("https://shared.com"), 1);
        assert_eq!(delta.read_contents.len(), 1);
        // One thought per task.
        assert_eq!(delta.thoughts.len(), 3);
    }

    #[tokio::test]
    async fn parallel_respects_max_parallelism() {
        let search = Arc::new(FixedSearch::new(&["https://a.com"]));
        let fetcher = Arc::new(MapFetcher::new(&[("https://a.com", "body")]));
        let model = ScriptedModel::returning(&analysis_json(
            "claim",
            "https://a.com",
            "finish",
            None,
        ));
        let (ctx, _rx) = make_ctx(model, Arc::clone(&search), Arc::clone(&fetcher));

        let state = base_state(&["a", "b", "c", "d", "e"], Strategy::parallel(2));
        let delta = ResearchStage.run(&state, &ctx).await.unwrap();

        assert_eq!(delta.search_history.len(), 2);
        assert_eq!(search.call_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_run_returns_partial_delta() {
        let search = Arc::new(FixedSearch::new(&["https://a.com"]));
        let fetcher = Arc::new(MapFetcher::new(&[("https://a.com", "body")]));
        let model = ScriptedModel::returning(&analysis_json(
            "claim",
            "https://a.com",
            "continue",
            Some("next"),
        ));
        let (ctx, _rx) = make_ctx(model, Arc::clone(&search), Arc::clone(&fetcher));
        ctx.cancel.cancel();

        let state = base_state(&["seed"], Strategy::sequential(3));
        let delta = ResearchStage.run(&state, &ctx).await.unwrap();
        assert_eq!(delta.iterations, 0);
        assert!(delta.findings.is_empty());
    }

    #[tokio::test]
    async fn missing_strategy_is_an_input_error() {
        let search = Arc::new(FixedSearch::new(&[]));
        let fetcher = Arc::new(MapFetcher::new(&[]));
        let model = ScriptedModel::returning("{}");
        let (ctx, _rx) = make_ctx(model, search, fetcher);

        let mut state = ResearchState::new("q", "t");
        state.plan = Some(ResearchPlan {
            queries: vec!["q".into()],
            focus_areas: vec![],
            depth: 1,
        });
        assert!(ResearchStage.run(&state, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn search_failure_demotes_to_empty_and_warns() {
        use crate::error::ProviderError;
        use crate::provider::{SearchHit, SearchProvider};
        use async_trait::async_trait;

        struct FailingSearch;

        #[async_trait]
        impl SearchProvider for FailingSearch {
            async fn search(
                &self,
                _q: &str,
                _n: usize,
            ) -> Result<Vec<SearchHit>, ProviderError> {
                Err(ProviderError::Status(404))
            }
        }

        let fetcher = Arc::new(MapFetcher::new(&[]));
        let model = ScriptedModel::returning("{}");
        let (events, _rx) = EventSink::channel();
        let ctx = RunContext {
            config: RunnerConfig::default(),
            models: ModelRegistry::new().bind_all(Arc::new(model)),
            search: Arc::new(FailingSearch),
            fetcher,
            events,
            cancel: CancellationToken::new(),
        };

        let state = base_state(&["doomed query"], Strategy::sequential(1));
        let delta = ResearchStage.run(&state, &ctx).await.unwrap();

        assert_eq!(delta.search_history.len(), 1);
        assert!(delta.search_history[0].result_urls.is_empty());
        assert!(delta.warnings.iter().any(|w| w.contains("search failed")));
        // No readable pages, so the iteration still records its thought.
        assert_eq!(delta.thoughts.len(), 1);
    }
}
