//! Environment-sourced configuration.
//!
//! All environment reads happen here, once, at startup; the core library
//! receives plain values and never touches the environment itself.

use std::env;
use std::time::Duration;

use crucible_core::{HealthConfig, DEFAULT_CANDIDATE};

/// Default local fallback appended to every candidate list.
pub const DEFAULT_LOCAL_MODEL: &str = "ollama/llama3.1:8b";

/// Build the ordered model candidate list from the environment.
///
/// Priority: `CRUCIBLE_MODEL_PRIORITY`, else `CRUCIBLE_MODEL_CANDIDATES`,
/// then `CRUCIBLE_MODEL` and `CRUCIBLE_MODEL_FALLBACK` are appended. The
/// local fallback (`CRUCIBLE_LOCAL_MODEL`) is always appended if absent.
pub fn configured_model_candidates() -> Vec<String> {
    resolve_candidates(
        env::var("CRUCIBLE_MODEL_PRIORITY").ok().as_deref(),
        env::var("CRUCIBLE_MODEL_CANDIDATES").ok().as_deref(),
        env::var("CRUCIBLE_MODEL").ok().as_deref(),
        env::var("CRUCIBLE_MODEL_FALLBACK").ok().as_deref(),
        env::var("CRUCIBLE_LOCAL_MODEL").ok().as_deref(),
    )
}

/// Pure candidate-list resolution, deduplicated preserving first-seen
/// order.
pub fn resolve_candidates(
    priority: Option<&str>,
    candidates: Option<&str>,
    primary: Option<&str>,
    fallback: Option<&str>,
    local: Option<&str>,
) -> Vec<String> {
    let priority_list = parse_model_list(priority);
    let candidate_list = if priority_list.is_empty() {
        parse_model_list(candidates)
    } else {
        priority_list
    };
    let fallback_list = parse_model_list(fallback);
    // An explicitly empty local model disables the local fallback.
    let local_model = local.map(str::trim).unwrap_or(DEFAULT_LOCAL_MODEL);

    let mut ordered: Vec<String> = Vec::new();
    let primary_entry = primary.map(str::trim).filter(|value| !value.is_empty());
    for entry in candidate_list
        .iter()
        .map(String::as_str)
        .chain(primary_entry)
        .chain(fallback_list.iter().map(String::as_str))
    {
        if !ordered.iter().any(|existing| existing == entry) {
            ordered.push(entry.to_string());
        }
    }

    if !local_model.is_empty() && !ordered.iter().any(|existing| existing == local_model) {
        ordered.push(local_model.to_string());
    }

    if ordered.is_empty() {
        vec![DEFAULT_CANDIDATE.to_string()]
    } else {
        ordered
    }
}

/// Build the health-layer tuning from the environment, falling back to
/// the defaults for anything unset or unparseable.
pub fn health_config_from_env() -> HealthConfig {
    let mut config = HealthConfig::default();

    if let Some(seconds) = env_parse::<u64>("CRUCIBLE_OVERHEAT_COOLDOWN_SECONDS") {
        config.overheat_cooldown = Duration::from_secs(seconds);
    }
    if let Some(ratio) = env_parse::<f64>("CRUCIBLE_RATE_LIMIT_WARN_RATIO") {
        config.warn_ratio = ratio;
    }
    if let Ok(codes) = env::var("CRUCIBLE_OVERHEAT_STATUS_CODES") {
        let parsed: Vec<u16> = codes
            .split(',')
            .filter_map(|code| code.trim().parse().ok())
            .collect();
        if !parsed.is_empty() {
            config.overheat_status_codes = parsed;
        }
    }

    config
}

/// Whether a boolean-style environment flag is set.
pub fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| {
            matches!(
                value.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_model_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_wins_over_candidates() {
        let resolved = resolve_candidates(
            Some("model-a,model-b"),
            Some("model-c"),
            None,
            None,
            None,
        );
        assert_eq!(
            resolved,
            vec!["model-a", "model-b", DEFAULT_LOCAL_MODEL]
        );
    }

    #[test]
    fn test_dedupes_preserving_first_seen_order() {
        let resolved = resolve_candidates(
            None,
            Some("model-a, model-b, model-a"),
            Some("model-b"),
            Some("model-c,model-a"),
            None,
        );
        assert_eq!(
            resolved,
            vec!["model-a", "model-b", "model-c", DEFAULT_LOCAL_MODEL]
        );
    }

    #[test]
    fn test_local_model_not_duplicated() {
        let resolved = resolve_candidates(
            Some(&format!("model-a,{}", DEFAULT_LOCAL_MODEL)),
            None,
            None,
            None,
            None,
        );
        assert_eq!(resolved, vec!["model-a", DEFAULT_LOCAL_MODEL]);
    }

    #[test]
    fn test_custom_local_model() {
        let resolved = resolve_candidates(None, None, Some("model-a"), None, Some("ollama/qwen3:8b"));
        assert_eq!(resolved, vec!["model-a", "ollama/qwen3:8b"]);
    }

    #[test]
    fn test_empty_environment_defaults_to_local() {
        let resolved = resolve_candidates(None, None, None, None, None);
        assert_eq!(resolved, vec![DEFAULT_LOCAL_MODEL]);
    }

    #[test]
    fn test_disabled_local_falls_back_to_default_candidate() {
        let resolved = resolve_candidates(None, None, None, None, Some(""));
        assert_eq!(resolved, vec![DEFAULT_CANDIDATE]);
    }

    #[test]
    fn test_blank_segments_ignored() {
        let resolved = resolve_candidates(Some(" , model-a, ,"), None, None, None, None);
        assert_eq!(resolved, vec!["model-a", DEFAULT_LOCAL_MODEL]);
    }
}
