//! Stage graph
//!
//! The pipeline is a static transition table over named stages:
//!
//! ```text
//! Clarify ──needs_clarification──▶ End
//!    │
//!  next
//!    ▼
//!  Plan ──▶ Supervise ──▶ Research ──▶ Compress ──▶ Write ──▶ Critique ──▶ End
//!                            ▲  │
//!                            └──┘ loop (bounded by strategy.max_iterations,
//!                                 resolved inside the research subgraph)
//! ```
//!
//! A static table instead of dynamic registration keeps the control flow
//! directly verifiable and renderable as a diagram.

use serde::{Deserialize, Serialize};

/// Names of the pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Clarify,
    Plan,
    Supervise,
    Research,
    Compress,
    Write,
    Critique,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Clarify => "clarify",
            StageName::Plan => "plan",
            StageName::Supervise => "supervise",
            StageName::Research => "research",
            StageName::Compress => "compress",
            StageName::Write => "write",
            StageName::Critique => "critique",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge label selecting the next transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionLabel {
    /// Normal forward progress.
    Next,
    /// Clarify decided the query is too vague.
    NeedsClarification,
}

/// Transition target: another stage or the end of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Stage(StageName),
    End,
}

/// The full transition table. The research self-loop is internal to the
/// research subgraph and does not appear here.
pub const TRANSITIONS: &[(StageName, TransitionLabel, Target)] = &[
    (
        StageName::Clarify,
        TransitionLabel::NeedsClarification,
        Target::End,
    ),
    (
        StageName::Clarify,
        TransitionLabel::Next,
        Target::Stage(StageName::Plan),
    ),
    (
        StageName::Plan,
        TransitionLabel::Next,
        Target::Stage(StageName::Supervise),
    ),
    (
        StageName::Supervise,
        TransitionLabel::Next,
        Target::Stage(StageName::Research),
    ),
    (
        StageName::Research,
        TransitionLabel::Next,
        Target::Stage(StageName::Compress),
    ),
    (
        StageName::Compress,
        TransitionLabel::Next,
        Target::Stage(StageName::Write),
    ),
    (
        StageName::Write,
        TransitionLabel::Next,
        Target::Stage(StageName::Critique),
    ),
    (StageName::Critique, TransitionLabel::Next, Target::End),
];

/// The entry stage of every run.
pub const ENTRY: StageName = StageName::Clarify;

/// Resolve the next target for a stage and label.
pub fn next_target(from: StageName, label: TransitionLabel) -> Option<Target> {
    TRANSITIONS
        .iter()
        .find(|(stage, l, _)| *stage == from && *l == label)
        .map(|(_, _, target)| *target)
}

/// Render the transition table as a Mermaid flowchart.
pub fn mermaid() -> String {
    let mut out = String::from("flowchart TD\n");
    for (from, label, target) in TRANSITIONS {
        let to = match target {
            Target::Stage(s) => s.as_str(),
            Target::End => "END",
        };
        match label {
            TransitionLabel::Next => {
                out.push_str(&format!("    {} --> {}\n", from.as_str(), to));
            }
            TransitionLabel::NeedsClarification => {
                out.push_str(&format!(
                    "    {} -->|needs clarification| {}\n",
                    from.as_str(),
                    to
                ));
            }
        }
    }
    out.push_str("    research --> research\n");
    out
}
