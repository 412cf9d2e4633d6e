//! Verdict extraction from contrarian output.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static VERDICT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)VERDICT:\s*(APPROVED|REJECTED)").unwrap());

/// Contrarian verdict for one iteration.
///
/// `Implementation` marks the synthetic post-approval record appended when
/// the implementer turn produces output; it never comes from extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Proposal accepted as-is.
    Approved,
    /// Proposal rejected with (ideally) stated reasons.
    Rejected,
    /// No recognizable verdict in the text.
    Unknown,
    /// Post-approval implementation record.
    Implementation,
}

impl Verdict {
    /// Uppercase token as it appears in artifacts.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Unknown => "UNKNOWN",
            Self::Implementation => "IMPLEMENTATION",
        }
    }

    /// Whether this verdict terminates the loop successfully.
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approved)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pull an APPROVED/REJECTED verdict out of free-form agent text.
///
/// Case-insensitive; the first `VERDICT:` token wins. No match means
/// `Unknown` — a valid outcome, not an error.
pub fn extract_verdict(text: &str) -> Verdict {
    match VERDICT_PATTERN.captures(text) {
        Some(caps) if caps[1].eq_ignore_ascii_case("APPROVED") => Verdict::Approved,
        Some(_) => Verdict::Rejected,
        None => Verdict::Unknown,
    }
}
