//! Compress stage
//!
//! Deduplicates and condenses findings while preserving source URLs. Pure
//! code, no model call: citation ordering must be deterministic given
//! ordered findings. Near-identical claims are clustered by token Jaccard
//! similarity; each cluster keeps its highest-confidence finding and the
//! distinct source URLs of the whole cluster. Citation ids are dense and
//! assigned in first-appearance order.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ResearchError;
use crate::graph::StageName;
use crate::state::{Citation, CompressedFindings, Finding, ResearchState, StateDelta};

use super::{RunContext, Stage};

/// Stage 5: finding compression.
pub struct CompressStage;

fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Token Jaccard similarity of two claims.
pub(crate) fn jaccard(a: &str, b: &str) -> f32 {
    let sa = token_set(a);
    let sb = token_set(b);
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count() as f32;
    let union = sa.union(&sb).count() as f32;
    intersection / union
}

struct Cluster {
    /// Index into the findings slice of the retained representative.
    representative: usize,
    /// Distinct source URLs in first-appearance order.
    urls: Vec<String>,
}

fn cluster_findings(findings: &[Finding], threshold: f32) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = Vec::new();

    for (idx, finding) in findings.iter().enumerate() {
        let existing = clusters
            .iter_mut()
            .find(|c| jaccard(&findings[c.representative].claim, &finding.claim) >= threshold);

        match existing {
            Some(cluster) => {
                if finding.confidence > findings[cluster.representative].confidence {
                    cluster.representative = idx;
                }
                if !cluster.urls.contains(&finding.source_url) {
                    cluster.urls.push(finding.source_url.clone());
                }
            }
            None => clusters.push(Cluster {
                representative: idx,
                urls: vec![finding.source_url.clone()],
            }),
        }
    }

    clusters
}

/// Compress a list of findings. Deterministic: identical input yields
/// identical text and citation ordering.
pub(crate) fn compress_findings(
    findings: &[Finding],
    threshold: f32,
    target_ratio: f32,
) -> CompressedFindings {
    if findings.is_empty() {
        return CompressedFindings::default();
    }

    let clusters = cluster_findings(findings, threshold);

    // Dense citation ids in first-appearance order across clusters.
    let mut citations: Vec<Citation> = Vec::new();
    let mut cluster_citation_ids: Vec<Vec<usize>> = Vec::new();
    for cluster in &clusters {
        let mut ids = Vec::new();
        for url in &cluster.urls {
            let id = match citations.iter().find(|c| &c.url == url) {
                Some(existing) => existing.id,
                None => {
                    let id = citations.len() + 1;
                    citations.push(Citation {
                        id,
                        url: url.clone(),
                        title: None,
                        snippet: findings[cluster.representative].supporting_snippet.clone(),
                    });
                    id
                }
            };
            ids.push(id);
        }
        cluster_citation_ids.push(ids);
    }

    let raw_len: usize = findings
        .iter()
        .map(|f| f.claim.len() + f.supporting_snippet.len())
        .sum();
    let target_len = (raw_len as f32 * target_ratio) as usize;

    // Claims first; quoted snippets are added verbatim, in order, while the
    // text is still under the target size.
    let mut lines: Vec<String> = clusters
        .iter()
        .zip(&cluster_citation_ids)
        .map(|(cluster, ids)| {
            let markers: String = ids.iter().map(|id| format!("[{id}]")).collect();
            format!("{} {}", findings[cluster.representative].claim, markers)
        })
        .collect();

    let mut text_len: usize = lines.iter().map(|l| l.len()).sum();
    for (i, cluster) in clusters.iter().enumerate() {
        if text_len >= target_len {
            break;
        }
        let snippet = &findings[cluster.representative].supporting_snippet;
        if snippet.is_empty() {
            continue;
        }
        lines[i].push_str(&format!(" (\"{snippet}\")"));
        text_len += snippet.len() + 4;
    }

    CompressedFindings {
        text: lines.join("\n"),
        citations,
    }
}

#[async_trait]
impl Stage for CompressStage {
    fn name(&self) -> StageName {
        StageName::Compress
    }

    async fn run(
        &self,
        state: &ResearchState,
        ctx: &RunContext,
    ) -> Result<StateDelta, ResearchError> {
        ctx.check_cancelled()?;

        let compressed = compress_findings(
            &state.findings,
            ctx.config.jaccard_dedup_threshold,
            ctx.config.compression_target_ratio,
        );

        debug!(
            findings = state.findings.len(),
            citations = compressed.citations.len(),
            chars = compressed.text.len(),
            "findings compressed"
        );

        let mut delta = StateDelta::empty();
        delta.compressed = Some(compressed);
        Ok(delta)
    }
}
