//! Research run state
//!
//! A single [`ResearchState`] document is threaded through the stage graph.
//! Stages receive a read-only view and return a [`StateDelta`]; the run
//! coordinator merges deltas under fixed rules: list fields append (with
//! URL deduplication for `read_contents`), scalar fields are
//! last-writer-wins, and token counters accumulate. Once `ended_at` is set
//! the state is frozen and further deltas are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of fetching one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    /// Fetched with a 2xx status and a non-empty body.
    Ok,
    /// The site refused the request (403/401/429).
    Blocked,
    /// Fetched but the body was empty.
    Empty,
    /// Transport failure, timeout, or other non-success status.
    Error,
}

/// The body of one fetched page, deduplicated by URL within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub status: PageStatus,
    /// May be empty for blocked or failed fetches.
    pub body: String,
    /// Length of the body as fetched, before truncation.
    pub content_length: usize,
    pub bytes_truncated: bool,
}

impl PageContent {
    /// A page that fetched successfully.
    pub fn ok(url: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            url: url.into(),
            fetched_at: Utc::now(),
            status: if body.is_empty() {
                PageStatus::Empty
            } else {
                PageStatus::Ok
            },
            content_length: body.len(),
            body,
            bytes_truncated: false,
        }
    }

    /// A page whose fetch failed; the status records the cause.
    pub fn failed(url: impl Into<String>, status: PageStatus) -> Self {
        Self {
            url: url.into(),
            fetched_at: Utc::now(),
            status,
            body: String::new(),
            content_length: 0,
            bytes_truncated: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == PageStatus::Ok
    }
}

/// A single extracted claim with its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub claim: String,
    pub source_url: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub supporting_snippet: String,
}

impl Finding {
    pub fn new(
        claim: impl Into<String>,
        source_url: impl Into<String>,
        confidence: f32,
        supporting_snippet: impl Into<String>,
    ) -> Self {
        Self {
            claim: claim.into(),
            source_url: source_url.into(),
            confidence: confidence.clamp(0.0, 1.0),
            supporting_snippet: supporting_snippet.into(),
        }
    }
}

/// A numbered reference bound to a URL.
///
/// Ids are dense and assigned in first-use order within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based, dense, monotonically assigned.
    pub id: usize,
    pub url: String,
    pub title: Option<String>,
    pub snippet: String,
}

/// One executed search and the URLs it returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRecord {
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub result_urls: Vec<String>,
}

impl SearchRecord {
    pub fn new(query: impl Into<String>, result_urls: Vec<String>) -> Self {
        Self {
            query: query.into(),
            timestamp: Utc::now(),
            result_urls,
        }
    }
}

/// Planner output: search queries, focus areas, and a depth level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchPlan {
    /// 2–5 English search queries.
    pub queries: Vec<String>,
    /// 2–6 focus areas the report should cover.
    pub focus_areas: Vec<String>,
    /// 1 = single aspect, 2 = multi-aspect overview, 3 = deep comparative.
    pub depth: u8,
}

/// Execution mode chosen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    /// Iterative loop where later searches depend on earlier analysis.
    Sequential,
    /// Fan-out over plan queries, one Search → Read → Analyze triple each.
    Parallel,
}

/// Supervisor output controlling the research subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub mode: StrategyMode,
    /// At least 1, capped by configuration (≤ 4).
    pub max_parallelism: usize,
    /// At least 1, capped by configuration (≤ 3).
    pub max_iterations: usize,
}

impl Strategy {
    pub fn sequential(max_iterations: usize) -> Self {
        Self {
            mode: StrategyMode::Sequential,
            max_parallelism: 1,
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn parallel(max_parallelism: usize) -> Self {
        Self {
            mode: StrategyMode::Parallel,
            max_parallelism: max_parallelism.max(1),
            max_iterations: 1,
        }
    }
}

/// Compressed findings with their citation table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressedFindings {
    pub text: String,
    pub citations: Vec<Citation>,
}

/// Advisory critique scores, each in [0, 5].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CritiqueScores {
    pub completeness: f32,
    pub accuracy: f32,
    pub relevance: f32,
    pub clarity: f32,
    /// Sum of the four sub-scores, in [0, 20].
    pub total: f32,
}

impl CritiqueScores {
    pub fn new(completeness: f32, accuracy: f32, relevance: f32, clarity: f32) -> Self {
        let completeness = completeness.clamp(0.0, 5.0);
        let accuracy = accuracy.clamp(0.0, 5.0);
        let relevance = relevance.clamp(0.0, 5.0);
        let clarity = clarity.clamp(0.0, 5.0);
        Self {
            completeness,
            accuracy,
            relevance,
            clarity,
            total: completeness + accuracy + relevance + clarity,
        }
    }
}

/// The complete state of one research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    /// Original user question.
    pub query: String,

    /// Stable identifier for checkpointing.
    pub thread_id: String,

    pub needs_clarification: bool,
    pub clarification_question: Option<String>,
    pub query_analysis: String,
    pub detected_topics: Vec<String>,

    pub plan: Option<ResearchPlan>,
    pub strategy: Option<Strategy>,

    /// Append-only across iterations.
    pub findings: Vec<Finding>,

    /// Append-only, deduplicated by URL.
    pub read_contents: Vec<PageContent>,

    pub search_history: Vec<SearchRecord>,

    /// Append-only analyzer trace; consumed by observability tooling and
    /// never re-fed to the model.
    pub thoughts: Vec<String>,

    pub compressed: Option<CompressedFindings>,
    pub report: String,
    pub critique: Option<CritiqueScores>,

    pub iteration_count: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Soft warnings attached by stages (planner rule violations, degraded
    /// critiques). Never fail the run.
    pub warnings: Vec<String>,
}

impl ResearchState {
    /// Create the state for a new run.
    pub fn new(query: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            thread_id: thread_id.into(),
            needs_clarification: false,
            clarification_question: None,
            query_analysis: String::new(),
            detected_topics: Vec::new(),
            plan: None,
            strategy: None,
            findings: Vec::new(),
            read_contents: Vec::new(),
            search_history: Vec::new(),
            thoughts: Vec::new(),
            compressed: None,
            report: String::new(),
            critique: None,
            iteration_count: 0,
            tokens_in: 0,
            tokens_out: 0,
            started_at: Utc::now(),
            ended_at: None,
            warnings: Vec::new(),
        }
    }

    /// Whether the run is sealed; a sealed state ignores further deltas.
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Check whether a URL has already been read this run.
    pub fn has_read(&self, url: &str) -> bool {
        self.read_contents.iter().any(|p| p.url == url)
    }

    /// All URLs fetched so far, in read order.
    pub fn read_urls(&self) -> Vec<String> {
        self.read_contents.iter().map(|p| p.url.clone()).collect()
    }

    /// Plan queries that have not yet been executed.
    pub fn unexecuted_queries(&self) -> Vec<String> {
        let Some(plan) = &self.plan else {
            return Vec::new();
        };
        plan.queries
            .iter()
            .filter(|q| !self.search_history.iter().any(|r| &&r.query == q))
            .cloned()
            .collect()
    }

    /// Whether `url` is backed by evidence in this run: a successfully read
    /// page or a search result.
    pub fn url_is_grounded(&self, url: &str) -> bool {
        self.read_contents
            .iter()
            .any(|p| p.url == url && p.is_ok())
            || self
                .search_history
                .iter()
                .any(|r| r.result_urls.iter().any(|u| u == url))
    }

    /// Merge a delta into this state. No-op after `ended_at` is set.
    pub fn apply(&mut self, delta: StateDelta) {
        if self.is_ended() {
            tracing::warn!(thread_id = %self.thread_id, "delta dropped: run already ended");
            return;
        }

        if let Some(v) = delta.needs_clarification {
            self.needs_clarification = v;
        }
        if let Some(q) = delta.clarification_question {
            self.clarification_question = Some(q);
        }
        if let Some(a) = delta.query_analysis {
            self.query_analysis = a;
        }
        self.detected_topics.extend(delta.detected_topics);

        if let Some(plan) = delta.plan {
            self.plan = Some(plan);
        }
        if let Some(strategy) = delta.strategy {
            self.strategy = Some(strategy);
        }

        self.findings.extend(delta.findings);

        for page in delta.read_contents {
            if !self.has_read(&page.url) {
                self.read_contents.push(page);
            }
        }

        self.search_history.extend(delta.search_history);
        self.thoughts.extend(delta.thoughts);

        if let Some(compressed) = delta.compressed {
            self.compressed = Some(compressed);
        }
        if let Some(report) = delta.report {
            self.report = report;
        }
        if let Some(critique) = delta.critique {
            self.critique = Some(critique);
        }

        self.iteration_count += delta.iterations;
        self.tokens_in += delta.tokens_in;
        self.tokens_out += delta.tokens_out;
        self.warnings.extend(delta.warnings);

        if let Some(ended_at) = delta.ended_at {
            self.ended_at = Some(ended_at);
        }
    }

    /// Seal the state. Idempotent.
    pub fn seal(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }
}

/// Incremental update produced by one stage.
///
/// List fields append; `Option` scalars are last-writer-wins; counters add.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDelta {
    pub needs_clarification: Option<bool>,
    pub clarification_question: Option<String>,
    pub query_analysis: Option<String>,
    pub detected_topics: Vec<String>,

    pub plan: Option<ResearchPlan>,
    pub strategy: Option<Strategy>,

    pub findings: Vec<Finding>,
    pub read_contents: Vec<PageContent>,
    pub search_history: Vec<SearchRecord>,
    pub thoughts: Vec<String>,

    pub compressed: Option<CompressedFindings>,
    pub report: Option<String>,
    pub critique: Option<CritiqueScores>,

    pub iterations: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,

    pub warnings: Vec<String>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StateDelta {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.needs_clarification.is_none()
            && self.clarification_question.is_none()
            && self.query_analysis.is_none()
            && self.detected_topics.is_empty()
            && self.plan.is_none()
            && self.strategy.is_none()
            && self.findings.is_empty()
            && self.read_contents.is_empty()
            && self.search_history.is_empty()
            && self.thoughts.is_empty()
            && self.compressed.is_none()
            && self.report.is_none()
            && self.critique.is_none()
            && self.iterations == 0
            && self.tokens_in == 0
            && self.tokens_out == 0
            && self.warnings.is_empty()
            && self.ended_at.is_none()
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
        self
    }

    /// Fold several deltas into one, preserving order. Last writer wins for
    /// scalar fields, matching [`ResearchState::apply`] applied in sequence.
    pub fn merge(deltas: Vec<StateDelta>) -> StateDelta {
        let mut merged = StateDelta::empty();
        for delta in deltas {
            if delta.needs_clarification.is_some() {
                merged.needs_clarification = delta.needs_clarification;
            }
            if delta.clarification_question.is_some() {
                merged.clarification_question = delta.clarification_question;
            }
            if delta.query_analysis.is_some() {
                merged.query_analysis = delta.query_analysis;
            }
            merged.detected_topics.extend(delta.detected_topics);
            if delta.plan.is_some() {
                merged.plan = delta.plan;
            }
            if delta.strategy.is_some() {
                merged.strategy = delta.strategy;
            }
            merged.findings.extend(delta.findings);
            merged.read_contents.extend(delta.read_contents);
            merged.search_history.extend(delta.search_history);
            merged.thoughts.extend(delta.thoughts);
            if delta.compressed.is_some() {
                merged.compressed = delta.compressed;
            }
            if delta.report.is_some() {
                merged.report = delta.report;
            }
            if delta.critique.is_some() {
                merged.critique = delta.critique;
            }
            merged.iterations += delta.iterations;
            merged.tokens_in += delta.tokens_in;
            merged.tokens_out += delta.tokens_out;
            merged.warnings.extend(delta.warnings);
            if delta.ended_at.is_some() {
                merged.ended_at = delta.ended_at;
            }
        }
        merged
    }
}
