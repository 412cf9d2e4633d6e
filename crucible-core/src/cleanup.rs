//! Retention cleanup for historical run directories.
//!
//! Two passes: a TTL pass removes runs older than the configured age, and
//! a size pass removes the oldest remaining runs until the output tree
//! fits the size budget. Deletion failures are collected into the report
//! instead of aborting the sweep.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::CrucibleResult;

/// Default run age before TTL deletion, in days.
pub const DEFAULT_TTL_DAYS: i64 = 30;
/// Default output-tree size budget, in megabytes.
pub const DEFAULT_SIZE_LIMIT_MB: u64 = 900;
/// Settings file location relative to the project root.
pub const SETTINGS_RELATIVE_PATH: &str = "config/settings.toml";

/// Retention thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupSettings {
    /// Runs older than this many days are deleted (0 disables the pass).
    pub ttl_days: i64,
    /// Output-tree budget in megabytes (0 disables the pass).
    pub size_limit_mb: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            ttl_days: DEFAULT_TTL_DAYS,
            size_limit_mb: DEFAULT_SIZE_LIMIT_MB,
        }
    }
}

impl CleanupSettings {
    /// TTL as a chrono duration, clamped at zero.
    pub fn ttl(&self) -> Duration {
        Duration::days(self.ttl_days.max(0))
    }

    /// Size budget in bytes.
    pub fn size_limit_bytes(&self) -> u64 {
        self.size_limit_mb * 1024 * 1024
    }
}

/// One discovered run directory.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub phase: String,
    pub run_id: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl RunRecord {
    /// `phase/run_id` identifier for reporting.
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.phase, self.run_id)
    }
}

/// Why a run was selected for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionReason {
    /// Older than the TTL.
    Ttl,
    /// Evicted to fit the size budget.
    Budget,
}

impl std::fmt::Display for DeletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ttl => write!(f, "ttl"),
            Self::Budget => write!(f, "budget"),
        }
    }
}

/// A run selected for deletion.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionRecord {
    pub run: RunRecord,
    pub reason: DeletionReason,
}

/// Outcome of one cleanup sweep.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub settings: CleanupSettings,
    pub total_runs: usize,
    pub total_size_bytes: u64,
    pub deletions: Vec<DeletionRecord>,
    pub dry_run: bool,
    pub errors: Vec<String>,
}

impl CleanupReport {
    /// Bytes reclaimed (or reclaimable, in dry-run mode).
    pub fn freed_bytes(&self) -> u64 {
        self.deletions.iter().map(|record| record.run.size_bytes).sum()
    }

    /// Deletion counts per reason, e.g. `[("budget", 2), ("ttl", 5)]`.
    pub fn reasons_summary(&self) -> Vec<(DeletionReason, usize)> {
        let mut counts: Vec<(DeletionReason, usize)> = Vec::new();
        for record in &self.deletions {
            match counts.iter_mut().find(|(reason, _)| *reason == record.reason) {
                Some((_, count)) => *count += 1,
                None => counts.push((record.reason, 1)),
            }
        }
        counts
    }
}

/// Load retention settings from `config/settings.toml` under the root.
///
/// An absent file yields the defaults; missing keys default individually.
/// A size limit of 1024 MB or more is clamped down to 1023.
pub fn load_cleanup_settings(root: &Path) -> CrucibleResult<CleanupSettings> {
    let path = root.join(SETTINGS_RELATIVE_PATH);
    if !path.exists() {
        return Ok(CleanupSettings::default());
    }

    let text = fs::read_to_string(&path)?;
    let doc: toml::Table = toml::from_str(&text)?;
    let section = doc.get("cleanup").and_then(toml::Value::as_table);

    let ttl_days = section
        .and_then(|s| s.get("ttl_days"))
        .and_then(toml::Value::as_integer)
        .unwrap_or(DEFAULT_TTL_DAYS);
    let size_limit_mb = section
        .and_then(|s| s.get("size_limit_mb"))
        .and_then(toml::Value::as_integer)
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(DEFAULT_SIZE_LIMIT_MB);
    let size_limit_mb = size_limit_mb.min(1023);

    Ok(CleanupSettings {
        ttl_days,
        size_limit_mb,
    })
}

/// Sweep the output tree, deleting runs past the TTL and then evicting
/// the oldest runs until the tree fits the size budget.
///
/// `now` is injectable for tests; `dry_run` reports without deleting.
pub fn cleanup_runs(
    output_root: &Path,
    settings: CleanupSettings,
    now: Option<DateTime<Utc>>,
    dry_run: bool,
) -> CleanupReport {
    let current_time = now.unwrap_or_else(Utc::now);
    let mut report = CleanupReport {
        settings,
        total_runs: 0,
        total_size_bytes: 0,
        deletions: Vec::new(),
        dry_run,
        errors: Vec::new(),
    };

    let records = collect_runs(output_root);
    if records.is_empty() {
        return report;
    }

    report.total_runs = records.len();
    report.total_size_bytes = records.iter().map(|record| record.size_bytes).sum();

    let mut to_delete: Vec<DeletionRecord> = Vec::new();
    let cutoff = current_time - settings.ttl();

    if settings.ttl_days > 0 {
        for record in &records {
            if record.created_at < cutoff {
                to_delete.push(DeletionRecord {
                    run: record.clone(),
                    reason: DeletionReason::Ttl,
                });
            }
        }
    }

    let doomed: HashSet<PathBuf> = to_delete.iter().map(|d| d.run.path.clone()).collect();
    let mut remaining: Vec<&RunRecord> = records
        .iter()
        .filter(|record| !doomed.contains(&record.path))
        .collect();
    let mut remaining_size: u64 = remaining.iter().map(|record| record.size_bytes).sum();

    let size_limit = settings.size_limit_bytes();
    if size_limit > 0 && remaining_size > size_limit {
        remaining.sort_by_key(|record| record.created_at);
        for record in remaining {
            if remaining_size <= size_limit {
                break;
            }
            to_delete.push(DeletionRecord {
                run: record.clone(),
                reason: DeletionReason::Budget,
            });
            remaining_size -= record.size_bytes;
        }
    }

    let mut seen_paths = HashSet::new();
    let mut final_deletions = Vec::new();
    for record in to_delete {
        if !seen_paths.insert(record.run.path.clone()) {
            continue;
        }
        if !dry_run && record.run.path.exists() {
            if let Err(err) = fs::remove_dir_all(&record.run.path) {
                report
                    .errors
                    .push(format!("failed to delete {}: {}", record.run.path.display(), err));
                warn!(path = %record.run.path.display(), error = %err, "cleanup deletion failed");
            } else {
                info!(
                    run = %record.run.identifier(),
                    reason = %record.reason,
                    "removed expired run"
                );
            }
        }
        final_deletions.push(record);
    }

    report.deletions = final_deletions;
    report
}

/// Render a byte count as a human-readable size.
pub fn format_bytes(num_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = num_bytes as f64;
    for unit in UNITS {
        if value < 1024.0 || unit == "TB" {
            return format!("{:.1}{}", value, unit);
        }
        value /= 1024.0;
    }
    unreachable!("TB branch always returns")
}

fn collect_runs(output_root: &Path) -> Vec<RunRecord> {
    let mut records = Vec::new();
    let Ok(phase_dirs) = fs::read_dir(output_root) else {
        return records;
    };

    let mut phase_paths: Vec<PathBuf> = phase_dirs
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    phase_paths.sort();

    for phase_dir in phase_paths {
        let phase = phase_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let Ok(run_dirs) = fs::read_dir(&phase_dir) else {
            continue;
        };
        let mut run_paths: Vec<PathBuf> = run_dirs
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_dir()
                    && path
                        .file_name()
                        .map_or(false, |name| name.to_string_lossy().starts_with("run_"))
            })
            .collect();
        run_paths.sort();

        for run_dir in run_paths {
            if let Some(record) = build_run_record(&phase, &run_dir) {
                records.push(record);
            }
        }
    }
    records
}

fn build_run_record(phase: &str, run_dir: &Path) -> Option<RunRecord> {
    let run_id = run_dir.file_name()?.to_string_lossy().to_string();

    let created_at = fs::read_to_string(run_dir.join("run.json"))
        .ok()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
        .and_then(|meta| {
            meta.get("created_iso")
                .and_then(|v| v.as_str())
                .and_then(|iso| DateTime::parse_from_rfc3339(iso).ok())
                .map(|dt| dt.with_timezone(&Utc))
        })
        .or_else(|| {
            fs::metadata(run_dir)
                .and_then(|meta| meta.modified())
                .ok()
                .map(DateTime::<Utc>::from)
        })?;

    Some(RunRecord {
        phase: phase.to_string(),
        run_id,
        path: run_dir.to_path_buf(),
        created_at,
        size_bytes: directory_size(run_dir),
    })
}

fn directory_size(path: &Path) -> u64 {
    let mut total = 0;
    let Ok(entries) = fs::read_dir(path) else {
        return total;
    };
    for entry in entries.flatten() {
        let child = entry.path();
        if child.is_dir() {
            total += directory_size(&child);
        } else if let Ok(meta) = fs::metadata(&child) {
            total += meta.len();
        }
    }
    total
}
