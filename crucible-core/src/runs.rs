//! Run lifecycle — directories, metadata, instructions, and the index.
//!
//! A run lives at `output/<phase>/run_<phase>_<timestamp>/` with its
//! metadata in `run.json` and operator instructions in `instructions.md`.
//! `output/index.md` is regenerated from all run metadata after every
//! prepare/finalize so other projects can discover completed runs.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CrucibleError, CrucibleResult};
use crate::phase::Phase;

const INDEX_HEADER: [&str; 4] = [
    "# Crucible Run Index",
    "",
    "| Run ID | Phase | Created (UTC) | Status | Input | Summary |",
    "| --- | --- | --- | --- | --- | --- |",
];

/// Persistent metadata for one run, serialized to `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub phase: Phase,
    pub input: String,
    /// Budget cap, studio phase only; empty otherwise.
    #[serde(default)]
    pub budget_cap: String,
    pub max_iterations: u32,
    pub created_iso: String,
    pub created_display: String,
    pub status: String,
    #[serde(default)]
    pub summary_path: String,
    #[serde(default)]
    pub verdict: String,
    #[serde(default)]
    pub iterations_run: Option<u32>,
    #[serde(default)]
    pub updated_iso: Option<String>,
    #[serde(default)]
    pub hours: Option<f64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

/// Result of preparing a run.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub instructions_path: PathBuf,
}

/// Optional fields applied at finalize time.
#[derive(Debug, Clone, Default)]
pub struct FinalizeOptions {
    pub status: String,
    pub summary: Option<String>,
    pub verdict: Option<String>,
    pub iterations_run: Option<u32>,
    pub hours: Option<f64>,
    pub cost: Option<f64>,
}

/// The output tree under a project root.
pub fn output_root(root: &Path) -> PathBuf {
    root.join("output")
}

/// Create a run directory with metadata and operator instructions.
pub fn prepare_run(
    root: &Path,
    phase: Phase,
    text: &str,
    budget: &str,
    max_iterations: u32,
    now: DateTime<Utc>,
) -> CrucibleResult<PreparedRun> {
    let text = text.trim();
    if text.is_empty() {
        return Err(CrucibleError::config("input text cannot be empty"));
    }

    let run_id = format!("run_{}_{}", phase, now.format("%Y%m%d_%H%M%S"));
    let run_dir = output_root(root).join(phase.as_str()).join(&run_id);
    fs::create_dir_all(run_dir.parent().expect("run dir has a parent"))?;
    fs::create_dir(&run_dir)?;

    let meta = RunMeta {
        run_id: run_id.clone(),
        phase,
        input: text.to_string(),
        budget_cap: if phase.is_studio() {
            budget.to_string()
        } else {
            String::new()
        },
        max_iterations,
        created_iso: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        created_display: now.format("%Y-%m-%d %H:%M").to_string(),
        status: "PENDING".to_string(),
        summary_path: String::new(),
        verdict: String::new(),
        iterations_run: None,
        updated_iso: None,
        hours: None,
        cost: None,
    };

    let instructions = build_instruction_doc(&meta, &run_dir);
    let instructions_path = run_dir.join("instructions.md");
    fs::write(&instructions_path, instructions)?;
    write_meta(&run_dir, &meta)?;
    rebuild_index(&output_root(root))?;

    info!(run_id = %run_id, phase = %phase, "prepared run");
    Ok(PreparedRun {
        run_id,
        run_dir,
        instructions_path,
    })
}

/// Mark a run finished: validate artifacts, update metadata, refresh the
/// index, and append to the knowledge run log.
pub fn finalize_run(
    root: &Path,
    phase: Phase,
    run_id: &str,
    options: FinalizeOptions,
) -> CrucibleResult<RunMeta> {
    let run_dir = output_root(root).join(phase.as_str()).join(run_id);
    let meta_path = run_dir.join("run.json");
    if !meta_path.exists() {
        return Err(CrucibleError::RunNotFound { path: meta_path });
    }

    let mut meta: RunMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
    meta.status = options.status.to_uppercase();
    if let Some(summary) = options.summary {
        meta.summary_path = summary;
    }
    if meta.summary_path.is_empty() {
        meta.summary_path = run_dir.join("summary.md").to_string_lossy().to_string();
    }

    let iterations_found = validate_artifacts(phase, &run_dir, Path::new(&meta.summary_path))?;

    if let Some(verdict) = options.verdict {
        meta.verdict = verdict.to_uppercase();
    }
    meta.iterations_run = options.iterations_run.or(Some(iterations_found));
    meta.hours = options.hours.or(meta.hours);
    meta.cost = options.cost.or(meta.cost);
    meta.updated_iso = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

    write_meta(&run_dir, &meta)?;
    rebuild_index(&output_root(root))?;
    append_run_log(root, &meta)?;

    info!(run_id = %meta.run_id, status = %meta.status, "finalized run");
    Ok(meta)
}

/// Regenerate `output/index.md` from every run's metadata.
pub fn rebuild_index(output_root: &Path) -> CrucibleResult<()> {
    let entries = collect_runs(output_root)?;
    write_index(&entries, &output_root.join("index.md"))
}

/// Load every `run.json` under the output tree.
pub fn collect_runs(output_root: &Path) -> CrucibleResult<Vec<RunMeta>> {
    let mut entries = Vec::new();
    if !output_root.exists() {
        return Ok(entries);
    }

    let mut phase_dirs: Vec<PathBuf> = fs::read_dir(output_root)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    phase_dirs.sort();

    for phase_dir in phase_dirs {
        let mut run_dirs: Vec<PathBuf> = fs::read_dir(&phase_dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_dir()
                    && path
                        .file_name()
                        .map_or(false, |name| name.to_string_lossy().starts_with("run_"))
            })
            .collect();
        run_dirs.sort();

        for run_dir in run_dirs {
            let meta_path = run_dir.join("run.json");
            if meta_path.exists() {
                let meta: RunMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
                entries.push(meta);
            }
        }
    }
    Ok(entries)
}

fn write_index(entries: &[RunMeta], index_path: &Path) -> CrucibleResult<()> {
    let mut lines: Vec<String> = INDEX_HEADER.iter().map(|line| line.to_string()).collect();

    let mut sorted: Vec<&RunMeta> = entries.iter().collect();
    sorted.sort_by(|a, b| b.created_iso.cmp(&a.created_iso));

    for entry in sorted {
        let summary_cell = if entry.summary_path.is_empty() {
            "_pending_".to_string()
        } else {
            format!("[summary]({})", entry.summary_path)
        };
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} |",
            entry.run_id,
            entry.phase,
            entry.created_display,
            entry.status,
            sanitize_cell(&entry.input),
            summary_cell,
        ));
    }

    if let Some(parent) = index_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(index_path, lines.join("\n") + "\n")?;
    Ok(())
}

/// Escape table-breaking characters in an index cell.
fn sanitize_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ").trim().to_string()
}

fn write_meta(run_dir: &Path, meta: &RunMeta) -> CrucibleResult<()> {
    let payload = serde_json::to_string_pretty(meta)? + "\n";
    fs::write(run_dir.join("run.json"), payload)?;
    Ok(())
}

/// Verify the run directory holds the artifacts its phase requires.
///
/// Returns the iteration count inferred from advocate outputs. Every gap
/// is collected so the error names all of them at once.
fn validate_artifacts(phase: Phase, run_dir: &Path, summary_path: &Path) -> CrucibleResult<u32> {
    let mut missing = Vec::new();

    let advocate_files = matching_files(run_dir, "advocate")?;
    if advocate_files.is_empty() {
        missing.push("Missing advocate outputs (advocate_*.md).".to_string());
    }
    let contrarian_files = matching_files(run_dir, "contrarian")?;
    if contrarian_files.is_empty() {
        missing.push("Missing contrarian outputs (contrarian_*.md).".to_string());
    }
    if phase.is_studio() && !run_dir.join("integrator.md").exists() {
        missing.push("Missing integrator roadmap (integrator.md).".to_string());
    }
    if !summary_path.exists() {
        missing.push(format!("Missing summary file at {}.", summary_path.display()));
    }

    if !missing.is_empty() {
        return Err(CrucibleError::MissingArtifacts { missing });
    }
    Ok(advocate_files.len() as u32)
}

fn matching_files(run_dir: &Path, prefix: &str) -> CrucibleResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !run_dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(run_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) && name.ends_with(".md") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn append_run_log(root: &Path, meta: &RunMeta) -> CrucibleResult<()> {
    use std::io::Write;

    let log_path = root.join("knowledge").join("run_log.md");
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if !log_path.exists() {
        fs::write(&log_path, "# Crucible Run Log\n\n")?;
    }

    let summary_cell = if meta.summary_path.is_empty() {
        String::new()
    } else {
        format!("[summary]({})", meta.summary_path)
    };
    let verdict = if meta.verdict.is_empty() {
        "N/A".to_string()
    } else {
        meta.verdict.clone()
    };
    let iterations = meta
        .iterations_run
        .map(|n| n.to_string())
        .unwrap_or_else(|| "N/A".to_string());

    let lines = [
        format!("## {} ({}) – {}", meta.run_id, meta.phase, meta.status),
        format!("- Created: {}", meta.created_display),
        format!("- Verdict: {}", verdict),
        format!("- Iterations: {}", iterations),
        format!("- Summary: {}", summary_cell),
        String::new(),
    ];

    let mut file = fs::OpenOptions::new().append(true).open(&log_path)?;
    file.write_all((lines.join("\n") + "\n").as_bytes())?;
    Ok(())
}

/// Render the operator instruction document for a prepared run.
pub fn build_instruction_doc(meta: &RunMeta, run_dir: &Path) -> String {
    let phase = meta.phase;
    let details = phase.details();
    let rel_dir = run_dir.to_string_lossy();

    let mut lines = vec![
        format!("# Crucible Instructions — {}", meta.run_id),
        String::new(),
        format!("- **Phase:** {}", title_word(phase.as_str())),
        format!("- **Run directory:** `{}`", rel_dir),
        format!("- **Max iterations:** {}", meta.max_iterations),
        format!("- **Input:** {}", meta.input),
    ];
    if phase.is_studio() {
        lines.push(format!("- **Budget Cap:** {}", meta.budget_cap));
    }
    lines.push(format!("- **Created:** {} (UTC)", meta.created_display));
    lines.push("- **Artifacts:**".to_string());
    lines.push(format!("  - Advocate outputs → `{}/advocate_<iteration>.md`", rel_dir));
    lines.push(format!(
        "  - Contrarian outputs → `{}/contrarian_<iteration>.md`",
        rel_dir
    ));
    if phase.is_studio() {
        lines.push(format!(
            "  - Integrator/Roadmap → `{}/integrator.md` (after approval)",
            rel_dir
        ));
    } else {
        lines.push(format!(
            "  - Implementation → `{}/implementation.md` (after approval)",
            rel_dir
        ));
    }
    lines.push(format!("  - Summary → `{}/summary.md`", rel_dir));

    lines.push(String::new());
    lines.push("## Agent Roles".to_string());
    lines.push(String::new());
    lines.push(format!("- **Advocate:** {}", details.advocate));
    lines.push(format!("- **Contrarian:** {}", details.contrarian));
    if let Some(implementer) = &details.implementer {
        lines.push(format!(
            "- **Implementer:** {} — generate the deliverables listed below once APPROVED.",
            implementer.title
        ));
        lines.push(String::new());
        lines.push("### Implementation Checklist".to_string());
        lines.push(String::new());
        for item in implementer.deliverables {
            lines.push(format!("- {}", item));
        }
    }
    if let Some(integrator) = details.integrator {
        lines.push(format!("- **Integrator:** {}", integrator));
    }

    lines.push(String::new());
    lines.push("## Iteration Loop".to_string());
    lines.push(String::new());
    lines.push("1. Start at iteration 1.".to_string());
    lines.push("2. Run the Advocate prompt, save to `advocate_<n>.md`.".to_string());
    lines.push(
        "3. Run the Contrarian prompt using that advocate file, save to `contrarian_<n>.md`."
            .to_string(),
    );
    lines.push(
        "4. If the contrarian verdict is `VERDICT: REJECTED` and you still have iterations left, feed the rejection back into the Advocate and repeat."
            .to_string(),
    );
    if phase.is_studio() {
        lines.push(
            "5. Once the contrarian returns `VERDICT: APPROVED`, operate as the Integrator to merge inspiration + constraints into a roadmap (`integrator.md`)."
                .to_string(),
        );
    } else {
        lines.push(
            "5. As soon as a contrarian returns `VERDICT: APPROVED`, move to the Implementer checklist."
                .to_string(),
        );
    }
    lines.push(String::new());
    lines.push(format!("**Notes:** {}", details.notes));

    lines.push(String::new());
    lines.push("## Summary & Packaging".to_string());
    lines.push(String::new());
    lines.push(
        "- Summarize the entire run (inputs, iterations, verdict, key recommendations, next actions) in `summary.md`."
            .to_string(),
    );
    lines.push("- When finished, finalize the index entry:".to_string());
    lines.push("```".to_string());
    lines.push(format!(
        "crucible finalize --phase {} --run-id {} --status completed --verdict <APPROVED|REJECTED|N/A>",
        phase, meta.run_id
    ));
    lines.push("```".to_string());
    lines.push(
        "- `finalize` updates `output/index.md` so other projects can discover this run."
            .to_string(),
    );

    lines.join("\n") + "\n"
}

fn title_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap()
    }

    fn prepare(root: &Path, phase: Phase) -> PreparedRun {
        prepare_run(root, phase, "A web stealth roguelike", "$0-20/mo", 3, fixed_now()).unwrap()
    }

    #[test]
    fn test_prepare_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let prepared = prepare(dir.path(), Phase::Market);

        assert_eq!(prepared.run_id, "run_market_20250601_123000");
        assert!(prepared.run_dir.join("run.json").exists());
        assert!(prepared.instructions_path.exists());
        assert!(output_root(dir.path()).join("index.md").exists());

        let meta: RunMeta = serde_json::from_str(
            &fs::read_to_string(prepared.run_dir.join("run.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta.status, "PENDING");
        assert_eq!(meta.phase, Phase::Market);
        assert!(meta.budget_cap.is_empty());
    }

    #[test]
    fn test_prepare_rejects_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = prepare_run(dir.path(), Phase::Market, "   ", "", 3, fixed_now()).unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_prepare_studio_records_budget() {
        let dir = tempfile::tempdir().unwrap();
        let prepared = prepare(dir.path(), Phase::Studio);
        let meta: RunMeta = serde_json::from_str(
            &fs::read_to_string(prepared.run_dir.join("run.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta.budget_cap, "$0-20/mo");

        let instructions = fs::read_to_string(&prepared.instructions_path).unwrap();
        assert!(instructions.contains("Budget Cap"));
        assert!(instructions.contains("Integrator"));
    }

    #[test]
    fn test_instruction_doc_for_verdict_phase() {
        let dir = tempfile::tempdir().unwrap();
        let prepared = prepare(dir.path(), Phase::Tech);
        let instructions = fs::read_to_string(&prepared.instructions_path).unwrap();

        assert!(instructions.contains("## Agent Roles"));
        assert!(instructions.contains("### Implementation Checklist"));
        assert!(instructions.contains("## Iteration Loop"));
        assert!(instructions.contains("VERDICT: REJECTED"));
        assert!(instructions.contains("crucible finalize --phase tech"));
    }

    #[test]
    fn test_finalize_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let prepared = prepare(dir.path(), Phase::Market);

        fs::write(prepared.run_dir.join("advocate_1.md"), "proposal").unwrap();
        fs::write(
            prepared.run_dir.join("contrarian_1.md"),
            "VERDICT: APPROVED",
        )
        .unwrap();
        fs::write(prepared.run_dir.join("summary.md"), "summary").unwrap();

        let meta = finalize_run(
            dir.path(),
            Phase::Market,
            &prepared.run_id,
            FinalizeOptions {
                status: "completed".to_string(),
                verdict: Some("approved".to_string()),
                ..FinalizeOptions::default()
            },
        )
        .unwrap();

        assert_eq!(meta.status, "COMPLETED");
        assert_eq!(meta.verdict, "APPROVED");
        assert_eq!(meta.iterations_run, Some(1));
        assert!(meta.updated_iso.is_some());

        let index = fs::read_to_string(output_root(dir.path()).join("index.md")).unwrap();
        assert!(index.contains(&prepared.run_id));
        assert!(index.contains("COMPLETED"));

        let log = fs::read_to_string(dir.path().join("knowledge/run_log.md")).unwrap();
        assert!(log.contains(&prepared.run_id));
        assert!(log.contains("APPROVED"));
    }

    #[test]
    fn test_finalize_lists_all_missing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let prepared = prepare(dir.path(), Phase::Design);

        let err = finalize_run(
            dir.path(),
            Phase::Design,
            &prepared.run_id,
            FinalizeOptions {
                status: "completed".to_string(),
                ..FinalizeOptions::default()
            },
        )
        .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("advocate"));
        assert!(text.contains("contrarian"));
        assert!(text.contains("summary"));
    }

    #[test]
    fn test_finalize_studio_requires_integrator() {
        let dir = tempfile::tempdir().unwrap();
        let prepared = prepare(dir.path(), Phase::Studio);

        fs::write(prepared.run_dir.join("advocate--product--01.md"), "a").unwrap();
        fs::write(
            prepared.run_dir.join("contrarian--product--01.md"),
            "VERDICT: APPROVED",
        )
        .unwrap();
        fs::write(prepared.run_dir.join("summary.md"), "s").unwrap();

        let err = finalize_run(
            dir.path(),
            Phase::Studio,
            &prepared.run_id,
            FinalizeOptions {
                status: "completed".to_string(),
                ..FinalizeOptions::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("integrator.md"));

        fs::write(prepared.run_dir.join("integrator.md"), "roadmap").unwrap();
        let meta = finalize_run(
            dir.path(),
            Phase::Studio,
            &prepared.run_id,
            FinalizeOptions {
                status: "completed".to_string(),
                ..FinalizeOptions::default()
            },
        )
        .unwrap();
        assert_eq!(meta.status, "COMPLETED");
    }

    #[test]
    fn test_finalize_unknown_run() {
        let dir = tempfile::tempdir().unwrap();
        let err = finalize_run(
            dir.path(),
            Phase::Market,
            "run_market_19990101_000000",
            FinalizeOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CrucibleError::RunNotFound { .. }));
    }

    #[test]
    fn test_index_sorts_newest_first_and_escapes_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let older = prepare_run(
            dir.path(),
            Phase::Market,
            "older | idea",
            "",
            3,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let newer = prepare_run(
            dir.path(),
            Phase::Market,
            "newer idea",
            "",
            3,
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();

        let index = fs::read_to_string(output_root(dir.path()).join("index.md")).unwrap();
        let newer_pos = index.find(&newer.run_id).unwrap();
        let older_pos = index.find(&older.run_id).unwrap();
        assert!(newer_pos < older_pos);
        assert!(index.contains("older \\| idea"));
    }
}
