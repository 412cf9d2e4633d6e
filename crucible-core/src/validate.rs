//! Lightweight validation of generated markdown artifacts.
//!
//! Pattern-level checks only: section completeness, basic format hygiene,
//! and verdict presence. Judging content quality is the contrarian's job,
//! not the validator's.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::CrucibleResult;

/// Files larger than this are rejected instead of scanned.
pub const MAX_VALIDATED_FILE_SIZE: u64 = 1_000_000;

static SECTION_HEADERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,3}\s+(.+?)\s*$").unwrap());
static TOP_LEVEL_TITLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s+\S").unwrap());
static EXCESSIVE_BLANKS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\n\n\n+").unwrap());
static NUMBERED_NO_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\d+\.\S").unwrap());
static BULLET_NO_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[-*]\S").unwrap());
static VERDICT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)VERDICT:\s*(APPROVED|REJECTED)").unwrap());
static NUMBERED_ANY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*\d+\.").unwrap());
static BULLET_ANY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*[-*]\s").unwrap());
static REASONS_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:reasons?|issues?|concerns?):").unwrap());

/// Result of one validation check.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Whether the document passed (warnings do not fail a check).
    pub passed: bool,
    /// Hard failures.
    pub issues: Vec<String>,
    /// Soft findings worth surfacing.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn pass() -> Self {
        Self {
            passed: true,
            issues: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn fail(issues: Vec<String>) -> Self {
        Self {
            passed: false,
            issues,
            warnings: Vec::new(),
        }
    }

    /// Whether the report carries any finding at all.
    pub fn has_findings(&self) -> bool {
        !self.issues.is_empty() || !self.warnings.is_empty()
    }
}

/// Check that a document contains every required section header.
///
/// Headers `#` through `###` are harvested case-insensitively; a required
/// section matches when either string contains the other.
pub fn check_completeness(
    doc_path: &Path,
    required_sections: &[&str],
) -> CrucibleResult<ValidationReport> {
    let Some(content) = read_guarded(doc_path)? else {
        return Ok(oversize_or_missing(doc_path));
    };

    let found: Vec<String> = SECTION_HEADERS
        .captures_iter(&content)
        .map(|caps| caps[1].trim().to_lowercase())
        .collect();

    let missing: Vec<String> = required_sections
        .iter()
        .filter(|required| {
            let required = required.to_lowercase();
            !found
                .iter()
                .any(|header| header.contains(&required) || required.contains(header.as_str()))
        })
        .map(|required| required.to_string())
        .collect();

    if missing.is_empty() {
        Ok(ValidationReport::pass())
    } else {
        Ok(ValidationReport::fail(missing))
    }
}

/// Check basic document format and structure.
pub fn check_format(doc_path: &Path) -> CrucibleResult<ValidationReport> {
    let Some(content) = read_guarded(doc_path)? else {
        return Ok(oversize_or_missing(doc_path));
    };

    let mut report = ValidationReport::pass();

    if !TOP_LEVEL_TITLE.is_match(&content) {
        report
            .warnings
            .push("Missing top-level title (# Header)".to_string());
    }
    if EXCESSIVE_BLANKS.is_match(&content) {
        report
            .warnings
            .push("Excessive blank lines (>3 consecutive)".to_string());
    }
    if NUMBERED_NO_SPACE.is_match(&content) {
        report
            .warnings
            .push("Numbered list items missing space after period".to_string());
    }
    if BULLET_NO_SPACE.is_match(&content) {
        report
            .warnings
            .push("Bullet list items missing space after marker".to_string());
    }
    if content.trim().len() < 100 {
        report
            .issues
            .push("Document is too short (<100 characters)".to_string());
        report.passed = false;
    }

    Ok(report)
}

/// Check that a contrarian document carries a valid verdict.
///
/// A REJECTED verdict without a recognizable reasons structure passes
/// with a warning — missing reasons degrade feedback quality but do not
/// invalidate the verdict itself.
pub fn check_verdict(contrarian_path: &Path) -> CrucibleResult<ValidationReport> {
    let Some(content) = read_guarded(contrarian_path)? else {
        return Ok(oversize_or_missing(contrarian_path));
    };

    let Some(found) = VERDICT_LINE.captures(&content) else {
        return Ok(ValidationReport::fail(vec![
            "Missing or invalid verdict (must be 'VERDICT: APPROVED' or 'VERDICT: REJECTED')"
                .to_string(),
        ]));
    };

    let mut report = ValidationReport::pass();
    if found[1].eq_ignore_ascii_case("REJECTED") {
        let match_end = found.get(0).map(|m| m.end()).unwrap_or(0);
        let after_verdict = &content[match_end..];
        let has_reasons = NUMBERED_ANY.is_match(after_verdict)
            || BULLET_ANY.is_match(after_verdict)
            || REASONS_ANY.is_match(after_verdict);
        if !has_reasons {
            report
                .warnings
                .push("REJECTED verdict without clear rejection reasons".to_string());
        }
    }

    Ok(report)
}

fn read_guarded(path: &Path) -> CrucibleResult<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let size = fs::metadata(path)?.len();
    if size > MAX_VALIDATED_FILE_SIZE {
        return Ok(None);
    }
    Ok(Some(fs::read_to_string(path)?))
}

fn oversize_or_missing(path: &Path) -> ValidationReport {
    if !path.exists() {
        return ValidationReport::fail(vec![format!("Document not found: {}", path.display())]);
    }
    ValidationReport::fail(vec![format!(
        "File too large for validation (limit: {} bytes): {}",
        MAX_VALIDATED_FILE_SIZE,
        path.display()
    )])
}
