//! Prompt templates
//!
//! One template per model-facing stage. Each prompt that expects
//! structured output carries an explicit schema block; parsing runs
//! through [`crate::extract::parse_json_loose`].

use chrono::Utc;

/// Prompt templates for the research pipeline.
pub struct Prompts;

impl Prompts {
    fn current_date() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    /// Clarify: decide whether the query is specific enough to research.
    pub fn clarify(query: &str) -> (String, String) {
        let system = format!(
            r#"You decide whether a research question is specific enough to research directly. Today's date is {date}.

## Decision criteria

Needs clarification when the query:
- contains opaque acronyms with no disambiguating context
- is about a trend-like topic but has no temporal or scope anchor
- is a single term that covers many subdomains

Remains clear when the query:
- names specific entities
- carries a timeframe
- states an explicit comparison or explanation intent

## Output schema

Respond with ONLY a JSON object:
{{
  "needs_clarification": true|false,
  "clarification_question": "one question to ask the user, or null",
  "query_analysis": "one or two sentences on what the query asks",
  "detected_topics": ["topic", ...]
}}"#,
            date = Self::current_date()
        );
        let prompt = format!("Research question: {query}");
        (system, prompt)
    }

    /// Planner: produce search queries, focus areas, and a depth level.
    pub fn plan(query: &str, query_analysis: &str) -> (String, String) {
        let system = format!(
            r#"You plan web research for a question. Today's date is {date}.

## Task

Produce 2-5 English search queries, 2-6 focus areas the final report must cover, and a depth level.

Depth policy:
- 1: single aspect, a handful of results answers it
- 2: multi-aspect overview (the default)
- 3: deep comparative analysis across subjects

Rules for queries:
- lexically diverse: no two queries may start with the same four words
- every query mentions at least one entity or concept from the question
- search in English regardless of the question's language

## Output schema

Respond with ONLY a JSON object:
{{
  "queries": ["...", "..."],
  "focus_areas": ["...", "..."],
  "depth": 1|2|3
}}"#,
            date = Self::current_date()
        );
        let prompt = format!("Question: {query}\n\nAnalysis: {query_analysis}");
        (system, prompt)
    }

    /// Analyzer: extract findings from page bodies and decide whether to
    /// keep searching.
    pub fn analyze(
        query: &str,
        focus_areas: &[String],
        search_query: &str,
        pages: &str,
    ) -> (String, String) {
        let system = r#"You extract factual findings from fetched web pages, grounded in the original research question.

## Task

For each page, extract the claims that bear on the question. Every claim needs its source URL (one of the page URLs below) and a short verbatim supporting snippet. Then judge whether the evidence gathered so far is sufficient or another, more specific search is needed.

## Output schema

Respond with ONLY a JSON object:
{
  "findings": [
    {"claim": "...", "source_url": "...", "confidence": 0.0-1.0, "supporting_snippet": "..."}
  ],
  "summary": "one sentence on what is now known",
  "action": "continue"|"finish",
  "next_query": "the follow-up search to run next, or null"
}"#
        .to_string();

        let focus = focus_areas.join(", ");
        let prompt = format!(
            "Research question: {query}\nFocus areas: {focus}\nExecuted search: {search_query}\n\nPages:\n{pages}"
        );
        (system, prompt)
    }

    /// Writer: produce the cited report from compressed findings.
    pub fn write(query: &str, focus_areas: &[String], compressed: &str, sources: &str) -> (String, String) {
        let system = r###"You write a research report from prepared findings.

## Task

Write structured prose answering the question:
- a short executive summary first
- then sections following the focus areas
- cite every non-trivial factual claim with its marker [n] immediately after the sentence
- use ONLY the numbered sources provided; never invent a fact or a citation number
- end with a "## Sources" section listing the citations in ascending order"###
            .to_string();

        let focus = focus_areas.join(", ");
        let prompt = format!(
            "Question: {query}\nFocus areas: {focus}\n\nFindings:\n{compressed}\n\nNumbered sources:\n{sources}"
        );
        (system, prompt)
    }

    /// Correction directive appended when citation validation fails.
    pub fn write_correction(problems: &str) -> String {
        format!(
            "Your previous report failed citation validation:\n{problems}\n\nRewrite the report fixing every problem. Every [n] must reference a listed source; every factual sentence needs a marker."
        )
    }

    /// Critique: score the report on the four CARC axes.
    pub fn critique(query: &str, report: &str, compressed: &str) -> (String, String) {
        let system = r#"You score a research report. Be consistent: identical inputs must receive identical scores.

## Task

Score each axis from 0 to 5:
- completeness: covers the focus areas of the question
- accuracy: claims are backed by the provided findings and cited
- relevance: answers the question that was asked
- clarity: structure and readability

## Output schema

Respond with ONLY a JSON object:
{"completeness": 0-5, "accuracy": 0-5, "relevance": 0-5, "clarity": 0-5}"#
            .to_string();

        let prompt = format!(
            "Question: {query}\n\nReport:\n{report}\n\nFindings the report was written from:\n{compressed}"
        );
        (system, prompt)
    }
}
