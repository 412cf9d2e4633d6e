//! Rejection-reason extraction and feedback injection.
//!
//! Contrarian output is unpredictable free text, so extraction runs an
//! ordered cascade of parsing strategies and stops at the first one that
//! yields results. The extracted reasons feed the next advocate prompt via
//! [`inject_context_into_prompt`], which improves convergence by addressing
//! the specific concerns from the previous iteration.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::CrucibleResult;

/// Maximum number of reasons kept after extraction.
pub const MAX_REASONS: usize = 5;

/// Prompt markers scanned for the feedback injection point, in no
/// particular order — the earliest occurrence by position wins.
const INJECTION_MARKERS: [&str; 4] = ["## Deliverables", "## Your Task", "## Requirements", "---"];

static SECTION_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^##[ \t]*(?:(?:critical[ \t]+)?issues?|(?:rejection[ \t]+)?reasons?|concerns?)[ \t]*$",
    )
    .unwrap()
});
static VERDICT_REJECTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)VERDICT:\s*REJECTED").unwrap());
static NUMBERED_BOLD_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\.\s*\*\*(.+?)\*\*\s*-\s*(.+)$").unwrap());
static NUMBERED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\.\s*(.+)$").unwrap());
static BULLET_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*[-*]\s*(.+)$").unwrap());
static REASONS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:reasons?|concerns?|issues?):\s*$").unwrap());
static BOLD_MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static ITALIC_MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*(.+?)\*").unwrap());
static CODE_MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`(.+?)`").unwrap());
static FILENAME_ITERATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Context extracted from a previous rejection.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionContext {
    /// Iteration the rejection came from (parsed from the artifact name).
    pub iteration: u32,
    /// Role label, present only for studio-phase artifacts.
    pub role: Option<String>,
    /// Extracted reasons, at most [`MAX_REASONS`], in discovery order.
    pub reasons: Vec<String>,
    /// Full text of the rejecting artifact.
    pub full_text: String,
}

impl RejectionContext {
    /// Format the rejection for inclusion in the next advocate prompt.
    ///
    /// Empty reasons produce an empty string.
    pub fn format_for_prompt(&self) -> String {
        if self.reasons.is_empty() {
            return String::new();
        }

        let mut lines = vec![
            "**Previous iteration was REJECTED for the following reasons:**".to_string(),
            String::new(),
        ];
        for (i, reason) in self.reasons.iter().enumerate() {
            lines.push(format!("{}. {}", i + 1, reason));
        }
        lines.push(String::new());
        lines.push("Please address these concerns in your revised proposal.".to_string());
        lines.join("\n")
    }
}

/// Extract up to [`MAX_REASONS`] rejection reasons from contrarian output.
///
/// Safe on arbitrary text. Text without the substring `REJECTED` (any
/// case) yields an empty list immediately. Otherwise the strategies in
/// [`STRATEGIES`] run against the scoped sub-text in order, and the first
/// one producing results wins. Every surviving reason has its inline
/// markdown stripped; reasons of 15 characters or fewer are dropped as
/// noise.
pub fn extract_rejection_reasons(text: &str) -> Vec<String> {
    if !text.to_uppercase().contains("REJECTED") {
        return Vec::new();
    }

    let scope = scope_section(text);

    let mut raw = Vec::new();
    for (name, strategy) in STRATEGIES {
        raw = strategy(scope);
        if !raw.is_empty() {
            debug!(strategy = name, count = raw.len(), "rejection reasons found");
            break;
        }
    }

    raw.into_iter()
        .map(|reason| strip_markup(&reason))
        .filter(|reason| reason.len() > 15)
        .take(MAX_REASONS)
        .collect()
}

/// Ordered extraction strategies, first success wins.
///
/// Kept as named functions so each can be exercised on its own.
const STRATEGIES: [(&str, fn(&str) -> Vec<String>); 5] = [
    ("numbered_bold", numbered_bold_items),
    ("numbered", simple_numbered_items),
    ("bullets", bullet_items),
    ("labeled_block", labeled_block_items),
    ("paragraphs", paragraph_items),
];

/// Narrow the text to the region most likely to hold rejection reasons.
///
/// Prefers an issues/reasons/concerns section body; falls back to
/// everything from `VERDICT: REJECTED` up to the next section header, and
/// finally to the whole text.
fn scope_section(text: &str) -> &str {
    if let Some(header) = SECTION_HEADER.find(text) {
        let body_start = match text[header.end()..].find('\n') {
            Some(offset) => header.end() + offset + 1,
            None => text.len(),
        };
        let body_end = text[body_start..]
            .find("\n##")
            .map(|offset| body_start + offset)
            .unwrap_or(text.len());
        return &text[body_start..body_end];
    }

    if let Some(verdict) = VERDICT_REJECTED.find(text) {
        let end = text[verdict.end()..]
            .find("\n##")
            .map(|offset| verdict.end() + offset)
            .unwrap_or(text.len());
        return &text[verdict.start()..end];
    }

    text
}

/// Strategy: `N. **Title** - description` lines.
fn numbered_bold_items(scope: &str) -> Vec<String> {
    scope
        .lines()
        .filter_map(|line| NUMBERED_BOLD_LINE.captures(line))
        .map(|caps| format!("{} - {}", caps[1].trim(), caps[2].trim()))
        .collect()
}

/// Strategy: plain `N. text` lines, markdown stripped, over 10 chars.
fn simple_numbered_items(scope: &str) -> Vec<String> {
    scope
        .lines()
        .filter_map(|line| NUMBERED_LINE.captures(line))
        .map(|caps| strip_markup(&caps[1]))
        .filter(|reason| reason.len() > 10)
        .collect()
}

/// Strategy: `-` / `*` bullet lines over 10 chars.
fn bullet_items(scope: &str) -> Vec<String> {
    scope
        .lines()
        .filter_map(|line| BULLET_LINE.captures(line))
        .map(|caps| caps[1].trim().to_string())
        .filter(|reason| reason.len() > 10)
        .collect()
}

/// Strategy: block following a `Reasons:` / `Concerns:` / `Issues:` label.
fn labeled_block_items(scope: &str) -> Vec<String> {
    let mut reasons = Vec::new();
    let mut in_block = false;
    for line in scope.lines() {
        if !in_block {
            if REASONS_LABEL.is_match(line.trim_end()) {
                in_block = true;
            }
            continue;
        }
        if line.starts_with("##") || line.starts_with("**") {
            break;
        }
        let cleaned = line.trim().trim_start_matches(['-', '*', '•']).trim();
        if cleaned.len() > 10 {
            reasons.push(cleaned.to_string());
        }
    }
    reasons
}

/// Fallback strategy: the first substantive paragraphs of the scoped text.
fn paragraph_items(scope: &str) -> Vec<String> {
    scope
        .split("\n\n")
        .map(str::trim)
        .filter(|para| !para.is_empty())
        .filter(|para| !para.to_uppercase().contains("VERDICT:"))
        .filter(|para| para.len() > 20 && !para.starts_with('#'))
        .take(3)
        .map(str::to_string)
        .collect()
}

/// Strip inline bold, italic, and code markup from a candidate reason.
fn strip_markup(reason: &str) -> String {
    let cleaned = BOLD_MARKUP.replace_all(reason, "$1");
    let cleaned = ITALIC_MARKUP.replace_all(&cleaned, "$1");
    let cleaned = CODE_MARKUP.replace_all(&cleaned, "$1");
    cleaned.trim().to_string()
}

/// Inject rejection context into an advocate prompt.
///
/// Absent context, or context with zero reasons, returns the prompt
/// unchanged. Otherwise the formatted rejection block is spliced in at the
/// earliest recognized section marker (end of prompt if none is present),
/// preserving all original content verbatim.
pub fn inject_context_into_prompt(base_prompt: &str, context: Option<&RejectionContext>) -> String {
    let Some(context) = context else {
        return base_prompt.to_string();
    };
    if context.reasons.is_empty() {
        return base_prompt.to_string();
    }

    let injection_point = INJECTION_MARKERS
        .iter()
        .filter_map(|marker| base_prompt.find(marker))
        .min()
        .unwrap_or(base_prompt.len());

    let block = format!("\n---\n\n{}\n\n---\n", context.format_for_prompt());
    format!(
        "{}{}{}",
        &base_prompt[..injection_point],
        block,
        &base_prompt[injection_point..]
    )
}

/// Whether a run directory already holds contrarian artifacts.
pub fn detect_rerun_mode(run_dir: &Path) -> bool {
    matches!(contrarian_files(run_dir, "contrarian"), Ok(Some(files)) if !files.is_empty())
}

/// Find the most recent contrarian artifact containing `VERDICT: REJECTED`.
///
/// `role` selects studio-phase per-role files (`contrarian--<role>--NN.md`)
/// over the plain `contrarian_<n>.md` naming.
pub fn find_latest_rejection(run_dir: &Path, role: Option<&str>) -> CrucibleResult<Option<PathBuf>> {
    let prefix = match role {
        Some(role) => format!("contrarian--{}--", role.replace(' ', "-")),
        None => "contrarian_".to_string(),
    };
    let Some(mut files) = contrarian_files(run_dir, &prefix)? else {
        return Ok(None);
    };
    files.sort();
    files.reverse();

    for path in files {
        let content = fs::read_to_string(&path)?;
        if content.contains("VERDICT: REJECTED") {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Load rejection context from the most recent rejected contrarian file.
pub fn load_rejection_context(
    run_dir: &Path,
    role: Option<&str>,
) -> CrucibleResult<Option<RejectionContext>> {
    let Some(path) = find_latest_rejection(run_dir, role)? else {
        return Ok(None);
    };

    let content = fs::read_to_string(&path)?;
    let reasons = extract_rejection_reasons(&content);

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let iteration = FILENAME_ITERATION
        .find(&stem)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);

    Ok(Some(RejectionContext {
        iteration,
        role: role.map(str::to_string),
        reasons,
        full_text: content,
    }))
}

/// Generate human-readable instructions for a rerun with failure context.
pub fn generate_rerun_instructions(run_dir: &Path, role: Option<&str>) -> CrucibleResult<String> {
    let Some(context) = load_rejection_context(run_dir, role)? else {
        return Ok("No previous rejections found. Starting fresh iteration.".to_string());
    };

    let mut lines = vec![
        "# Rerun Mode Detected".to_string(),
        String::new(),
        format!(
            "Previous iteration {} was **REJECTED**.",
            context.iteration
        ),
        String::new(),
    ];

    if let Some(role) = &context.role {
        lines.push(format!("**Role**: {}", role));
        lines.push(String::new());
    }

    lines.push("## Rejection Reasons".to_string());
    lines.push(String::new());
    for (i, reason) in context.reasons.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, reason));
    }

    lines.extend([
        String::new(),
        "## Next Steps".to_string(),
        String::new(),
        "1. Review the rejection reasons above".to_string(),
        "2. Address each concern in your revised proposal".to_string(),
        "3. The advocate prompt will automatically include this context".to_string(),
        "4. Focus on the specific issues raised rather than starting from scratch".to_string(),
        String::new(),
    ]);

    Ok(lines.join("\n"))
}

/// List artifact paths matching a filename prefix, or `None` when the
/// directory is absent.
fn contrarian_files(run_dir: &Path, prefix: &str) -> CrucibleResult<Option<Vec<PathBuf>>> {
    if !run_dir.exists() {
        return Ok(None);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(run_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) && name.ends_with(".md") {
            files.push(entry.path());
        }
    }
    Ok(Some(files))
}
