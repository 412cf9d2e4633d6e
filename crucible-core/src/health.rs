//! Model candidate health — rate-limit headroom, cooldowns, and fallback
//! selection.
//!
//! The selector owns its state explicitly (constructor-injected, mutex
//! guarded) so tests and concurrent callers run in isolation. It never
//! fails and never blocks: when every candidate is suppressed the full
//! priority list is treated as available again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::TurnError;

/// Candidate used when no priority list has been configured.
pub const DEFAULT_CANDIDATE: &str = "gemini-2.5-flash";

const RATE_LIMIT_TOKENS: [&str; 4] = ["rate limit", "rate_limit", "too many requests", "quota"];
const OVERHEAT_TOKENS: [&str; 3] = ["overloaded", "temperature", "busy"];

/// Tuning for the health layer.
///
/// Sourced once at process startup by an external loader (the CLI); the
/// core never reads environment state directly.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Cooldown applied on rate limit when the provider gave no hint.
    pub default_cooldown: Duration,
    /// Floor for every suppression window.
    pub min_cooldown: Duration,
    /// Suppression window applied on transient provider failure.
    pub overheat_cooldown: Duration,
    /// HTTP-like status codes treated as transient overload.
    pub overheat_status_codes: Vec<u16>,
    /// Remaining/limit ratio at or below which headroom is considered low.
    pub warn_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            default_cooldown: Duration::from_secs(30),
            min_cooldown: Duration::from_secs(5),
            overheat_cooldown: Duration::from_secs(45),
            overheat_status_codes: vec![500, 502, 503, 504],
            warn_ratio: 0.2,
        }
    }
}

/// Per-candidate rate-limit state parsed from provider response headers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimitSnapshot {
    pub remaining_requests: Option<i64>,
    pub limit_requests: Option<i64>,
    pub remaining_tokens: Option<i64>,
    pub limit_tokens: Option<i64>,
    pub reset_requests: Option<String>,
    pub reset_tokens: Option<String>,
    pub retry_after: Option<u64>,
    pub low_headroom: bool,
}

/// Tracks rate-limit headroom per candidate from response headers.
pub struct RateLimitMonitor {
    warn_ratio: f64,
    snapshots: Mutex<HashMap<String, RateLimitSnapshot>>,
}

impl RateLimitMonitor {
    /// Create a monitor with the given low-headroom warn ratio.
    pub fn new(warn_ratio: f64) -> Self {
        Self {
            warn_ratio,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest response headers for a candidate.
    ///
    /// Header keys are matched case-insensitively. Logs a warning on the
    /// low-headroom rising edge.
    pub fn update(&self, candidate: &str, headers: &HashMap<String, String>) {
        if candidate.is_empty() || headers.is_empty() {
            return;
        }

        let normalized: HashMap<String, &str> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.as_str()))
            .collect();

        let mut snapshot = RateLimitSnapshot {
            remaining_requests: parse_int(normalized.get("x-ratelimit-remaining-requests")),
            limit_requests: parse_int(normalized.get("x-ratelimit-limit-requests")),
            remaining_tokens: parse_int(normalized.get("x-ratelimit-remaining-tokens")),
            limit_tokens: parse_int(normalized.get("x-ratelimit-limit-tokens")),
            reset_requests: normalized.get("x-ratelimit-reset-requests").map(|v| v.to_string()),
            reset_tokens: normalized.get("x-ratelimit-reset-tokens").map(|v| v.to_string()),
            retry_after: parse_int(normalized.get("retry-after")).and_then(|v| u64::try_from(v).ok()),
            low_headroom: false,
        };
        snapshot.low_headroom = self
            .should_warn(snapshot.remaining_requests, snapshot.limit_requests)
            || self.should_warn(snapshot.remaining_tokens, snapshot.limit_tokens);

        let previous_low = {
            let mut snapshots = self.snapshots.lock().expect("rate limit state poisoned");
            let previous = snapshots
                .insert(candidate.to_string(), snapshot.clone())
                .map(|s| s.low_headroom)
                .unwrap_or(false);
            previous
        };

        if snapshot.low_headroom && !previous_low {
            warn!(
                candidate,
                remaining_requests = ?snapshot.remaining_requests,
                limit_requests = ?snapshot.limit_requests,
                remaining_tokens = ?snapshot.remaining_tokens,
                limit_tokens = ?snapshot.limit_tokens,
                "candidate nearing rate-limit quota"
            );
        }
    }

    /// Whether the candidate was last seen with low headroom.
    pub fn is_low_headroom(&self, candidate: &str) -> bool {
        let snapshots = self.snapshots.lock().expect("rate limit state poisoned");
        snapshots
            .get(candidate)
            .map(|s| s.low_headroom)
            .unwrap_or(false)
    }

    /// The most recent `retry-after` value observed for the candidate.
    pub fn last_retry_after(&self, candidate: &str) -> Option<u64> {
        let snapshots = self.snapshots.lock().expect("rate limit state poisoned");
        snapshots.get(candidate).and_then(|s| s.retry_after)
    }

    /// Copy of the per-candidate state, for run reporting.
    pub fn snapshot(&self) -> HashMap<String, RateLimitSnapshot> {
        self.snapshots
            .lock()
            .expect("rate limit state poisoned")
            .clone()
    }

    /// Clear all tracked state.
    pub fn reset(&self) {
        self.snapshots
            .lock()
            .expect("rate limit state poisoned")
            .clear();
    }

    fn should_warn(&self, remaining: Option<i64>, limit: Option<i64>) -> bool {
        match (remaining, limit) {
            (Some(remaining), Some(limit)) if limit > 0 && remaining > 0 => {
                remaining as f64 / limit as f64 <= self.warn_ratio
            }
            // Zero remaining still means exhausted headroom.
            (Some(0), Some(limit)) if limit > 0 => true,
            _ => false,
        }
    }
}

impl Default for RateLimitMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default().warn_ratio)
    }
}

fn parse_int(value: Option<&&str>) -> Option<i64> {
    value.and_then(|v| v.trim().parse::<f64>().ok()).map(|v| v as i64)
}

/// Whether a classified agent-turn failure warrants another candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Transient — retry the iteration with a different candidate.
    Retry,
    /// Non-retryable — propagate to the caller.
    Fatal,
}

/// Serializable view of the selector state, for run reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStrategySnapshot {
    pub candidates: Vec<String>,
    pub cooling: Vec<String>,
    pub overheated: Vec<String>,
    pub current: Option<String>,
}

#[derive(Default)]
struct SelectorState {
    candidates: Vec<String>,
    cooldowns: HashMap<String, Instant>,
    overheated: HashMap<String, Instant>,
    last_selected: Option<String>,
}

impl SelectorState {
    fn available(&self, now: Instant) -> Vec<&String> {
        self.candidates
            .iter()
            .filter(|candidate| {
                self.cooldowns.get(*candidate).map_or(true, |until| *until <= now)
                    && self.overheated.get(*candidate).map_or(true, |until| *until <= now)
            })
            .collect()
    }
}

/// Prioritized model candidate list with cooldown/overheat suppression.
pub struct ModelSelector {
    config: HealthConfig,
    monitor: Arc<RateLimitMonitor>,
    state: Mutex<SelectorState>,
}

impl ModelSelector {
    /// Create a selector with the default single-candidate list.
    pub fn new(config: HealthConfig, monitor: Arc<RateLimitMonitor>) -> Self {
        Self {
            config,
            monitor,
            state: Mutex::new(SelectorState {
                candidates: vec![DEFAULT_CANDIDATE.to_string()],
                ..SelectorState::default()
            }),
        }
    }

    /// Create a selector pre-configured with a candidate priority list.
    pub fn with_candidates(
        config: HealthConfig,
        monitor: Arc<RateLimitMonitor>,
        candidates: Vec<String>,
    ) -> Self {
        let selector = Self::new(config, monitor);
        selector.configure_candidates(candidates);
        selector
    }

    /// The shared rate-limit monitor.
    pub fn monitor(&self) -> &Arc<RateLimitMonitor> {
        &self.monitor
    }

    /// Replace the candidate priority list. An empty list falls back to
    /// the single default candidate.
    pub fn configure_candidates(&self, ordered: Vec<String>) {
        let canonical = if ordered.is_empty() {
            vec![DEFAULT_CANDIDATE.to_string()]
        } else {
            ordered
        };
        let mut state = self.state.lock().expect("selector state poisoned");
        state.candidates = canonical;
    }

    /// Number of configured candidates.
    pub fn candidate_count(&self) -> usize {
        self.state
            .lock()
            .expect("selector state poisoned")
            .candidates
            .len()
    }

    /// Select the best currently usable candidate.
    ///
    /// Preference order: not suppressed and not low on headroom, then not
    /// suppressed, then the first candidate regardless of state. Never
    /// fails, never blocks.
    pub fn select_model(&self) -> String {
        let now = Instant::now();
        let mut state = self.state.lock().expect("selector state poisoned");

        let available: Vec<String> = {
            let available = state.available(now);
            if available.is_empty() {
                state.candidates.clone()
            } else {
                available.into_iter().cloned().collect()
            }
        };

        let choice = available
            .iter()
            .find(|candidate| !self.monitor.is_low_headroom(candidate.as_str()))
            .or_else(|| available.first())
            .cloned()
            .unwrap_or_else(|| DEFAULT_CANDIDATE.to_string());

        state.last_selected = Some(choice.clone());
        debug!(candidate = %choice, "model selected");
        choice
    }

    /// The candidate chosen by the most recent [`select_model`] call.
    pub fn current_model(&self) -> Option<String> {
        self.state
            .lock()
            .expect("selector state poisoned")
            .last_selected
            .clone()
    }

    /// Suppress a candidate after a rate limit.
    ///
    /// Window = provider hint, else the last observed `retry-after`, else
    /// the configured default — floored at the minimum. Returns the
    /// applied window.
    pub fn mark_cooldown(
        &self,
        candidate: &str,
        retry_after: Option<u64>,
        reason: &str,
    ) -> Duration {
        let duration = retry_after
            .or_else(|| self.monitor.last_retry_after(candidate))
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_cooldown)
            .max(self.config.min_cooldown);

        let mut state = self.state.lock().expect("selector state poisoned");
        state
            .cooldowns
            .insert(candidate.to_string(), Instant::now() + duration);
        warn!(candidate, seconds = duration.as_secs(), reason, "cooling down candidate");
        duration
    }

    /// Suppress a candidate after a transient provider failure. Returns
    /// the applied window.
    pub fn mark_overheated(
        &self,
        candidate: &str,
        reason: &str,
        cooldown: Option<u64>,
    ) -> Duration {
        let duration = cooldown
            .map(Duration::from_secs)
            .unwrap_or(self.config.overheat_cooldown)
            .max(self.config.min_cooldown);

        let mut state = self.state.lock().expect("selector state poisoned");
        state
            .overheated
            .insert(candidate.to_string(), Instant::now() + duration);
        warn!(candidate, seconds = duration.as_secs(), reason, "marking candidate as hot");
        duration
    }

    /// Whether the candidate is currently in its overheat window.
    pub fn is_overheated(&self, candidate: &str) -> bool {
        let state = self.state.lock().expect("selector state poisoned");
        state
            .overheated
            .get(candidate)
            .map_or(false, |until| *until > Instant::now())
    }

    /// Classify an agent-turn failure and update candidate health.
    ///
    /// Rate limits (status 429 or rate-limit vocabulary) cool the
    /// candidate down; transient overload (configured 5xx codes or
    /// overload vocabulary) marks it hot. Both are retryable; anything
    /// else is fatal. Never fails itself.
    pub fn classify_failure(&self, candidate: &str, err: &TurnError) -> FailureAction {
        let message = err.message.to_lowercase();

        if err.status == Some(429) || RATE_LIMIT_TOKENS.iter().any(|t| message.contains(t)) {
            self.mark_cooldown(candidate, err.retry_after, "rate_limit");
            return FailureAction::Retry;
        }

        let overheat_status = err
            .status
            .map_or(false, |s| self.config.overheat_status_codes.contains(&s));
        if overheat_status {
            self.mark_overheated(
                candidate,
                &format!("HTTP {} failure", err.status.unwrap_or_default()),
                None,
            );
            return FailureAction::Retry;
        }
        if OVERHEAT_TOKENS.iter().any(|t| message.contains(t)) {
            let truncated: String = message.chars().take(60).collect();
            self.mark_overheated(candidate, &format!("provider reported {}", truncated), None);
            return FailureAction::Retry;
        }

        FailureAction::Fatal
    }

    /// Serializable view of the current strategy state.
    pub fn snapshot(&self) -> ModelStrategySnapshot {
        let now = Instant::now();
        let state = self.state.lock().expect("selector state poisoned");
        ModelStrategySnapshot {
            candidates: state.candidates.clone(),
            cooling: state
                .cooldowns
                .iter()
                .filter(|(_, until)| **until > now)
                .map(|(candidate, _)| candidate.clone())
                .collect(),
            overheated: state
                .overheated
                .iter()
                .filter(|(_, until)| **until > now)
                .map(|(candidate, _)| candidate.clone())
                .collect(),
            current: state.last_selected.clone(),
        }
    }

    /// Clear all suppression state and the candidate list.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("selector state poisoned");
        state.cooldowns.clear();
        state.overheated.clear();
        state.candidates = vec![DEFAULT_CANDIDATE.to_string()];
        state.last_selected = None;
    }
}
