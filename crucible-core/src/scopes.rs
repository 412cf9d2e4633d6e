//! Scope-based iteration budgeting.
//!
//! Scopes split a run's iteration budget by decision granularity: spend
//! more rounds on high-level decisions (cheap to change) and fewer on
//! polish (expensive to change). The allocation annotates run
//! instructions at preparation time; the live kickoff loop deliberately
//! does not enforce scope boundaries.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::{CrucibleError, CrucibleResult};

/// Configuration for a single scope level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeConfig {
    /// Unique scope name.
    pub name: String,
    /// What this scope covers.
    pub focus: String,
    /// Declared iteration budget, at least 1.
    pub max_iterations: u32,
}

impl ScopeConfig {
    /// Create a validated scope entry.
    pub fn new(
        name: impl Into<String>,
        focus: impl Into<String>,
        max_iterations: u32,
    ) -> CrucibleResult<Self> {
        let name = name.into();
        if max_iterations < 1 {
            return Err(CrucibleError::scope(
                name.as_str(),
                "must have at least 1 iteration",
            ));
        }
        Ok(Self {
            name,
            focus: focus.into(),
            max_iterations,
        })
    }
}

/// Complete scopes configuration for one run.
///
/// Order is significant: scopes are worked sequentially, high-level first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopesConfig {
    pub scopes: Vec<ScopeConfig>,
}

impl ScopesConfig {
    /// Total declared iteration budget across all scopes.
    pub fn total_iterations(&self) -> u32 {
        self.scopes.iter().map(|scope| scope.max_iterations).sum()
    }

    /// Look up a scope by name.
    pub fn get_scope(&self, name: &str) -> Option<&ScopeConfig> {
        self.scopes.iter().find(|scope| scope.name == name)
    }
}

/// Load scopes configuration from a TOML file.
///
/// Expected format:
///
/// ```toml
/// [scopes.high_level]
/// focus = "Architecture, plans, strategic decisions"
/// max_iterations = 3
///
/// [scopes.polish]
/// focus = "Documentation, final review"
/// max_iterations = 1
/// ```
///
/// Any malformed shape is a fatal configuration error naming the
/// offending scope or field — never silently defaulted.
pub fn load_scopes_config(path: &Path) -> CrucibleResult<ScopesConfig> {
    if !path.exists() {
        return Err(CrucibleError::config(format!(
            "scopes config not found: {}",
            path.display()
        )));
    }

    let text = fs::read_to_string(path)?;
    let doc: toml::Table = toml::from_str(&text)?;

    let scopes_value = doc.get("scopes").ok_or_else(|| {
        CrucibleError::config(format!(
            "config must have a 'scopes' section: {}",
            path.display()
        ))
    })?;
    let scopes_table = scopes_value.as_table().ok_or_else(|| {
        CrucibleError::config(format!("'scopes' must be a table: {}", path.display()))
    })?;

    let mut scopes = Vec::new();
    for (name, value) in scopes_table {
        let entry = value
            .as_table()
            .ok_or_else(|| CrucibleError::scope(name.as_str(), "must be a table"))?;

        let focus = entry
            .get("focus")
            .and_then(toml::Value::as_str)
            .unwrap_or_default();
        if focus.is_empty() {
            return Err(CrucibleError::scope(name.as_str(), "missing 'focus' field"));
        }

        let max_iterations = entry
            .get("max_iterations")
            .ok_or_else(|| CrucibleError::scope(name.as_str(), "missing 'max_iterations' field"))?
            .as_integer()
            .ok_or_else(|| {
                CrucibleError::scope(name.as_str(), "'max_iterations' must be an integer")
            })?;
        let max_iterations = u32::try_from(max_iterations)
            .ok()
            .filter(|value| *value >= 1)
            .ok_or_else(|| CrucibleError::scope(name.as_str(), "must have at least 1 iteration"))?;

        scopes.push(ScopeConfig {
            name: name.clone(),
            focus: focus.to_string(),
            max_iterations,
        });
    }

    if scopes.is_empty() {
        return Err(CrucibleError::config(format!(
            "no scopes defined in {}",
            path.display()
        )));
    }

    Ok(ScopesConfig { scopes })
}

/// One scope's allocated share of the iteration budget.
///
/// Signed: the last scope absorbs the rounding remainder and can end up
/// with a non-positive share when the total budget is smaller than the
/// scope count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeAllocation {
    pub name: String,
    pub iterations: i64,
}

/// Allocate an iteration budget across scopes.
///
/// Without a budget override (or when it equals the config's own total),
/// each scope keeps its declared `max_iterations`. Otherwise every scope
/// except the last gets `max(1, floor(budget * share))` and the last
/// scope receives whatever remains, so the allocations always sum exactly
/// to the budget even under rounding.
pub fn allocate_iterations(
    config: &ScopesConfig,
    total_budget: Option<i64>,
) -> Vec<ScopeAllocation> {
    let config_total = config.total_iterations() as i64;

    let passthrough = || {
        config
            .scopes
            .iter()
            .map(|scope| ScopeAllocation {
                name: scope.name.clone(),
                iterations: scope.max_iterations as i64,
            })
            .collect()
    };

    let Some(total) = total_budget else {
        return passthrough();
    };
    if total == config_total {
        return passthrough();
    }

    let last = config.scopes.len().saturating_sub(1);
    let mut remaining = total;
    let mut allocations = Vec::with_capacity(config.scopes.len());

    for (i, scope) in config.scopes.iter().enumerate() {
        let iterations = if i == last {
            remaining
        } else {
            let share = scope.max_iterations as f64 / config_total as f64;
            let allocated = ((total as f64 * share).floor() as i64).max(1);
            remaining -= allocated;
            allocated
        };
        allocations.push(ScopeAllocation {
            name: scope.name.clone(),
            iterations,
        });
    }

    allocations
}

/// Render a human-readable scope plan for inclusion in run instructions.
pub fn generate_scope_instructions(
    config: &ScopesConfig,
    allocations: &[ScopeAllocation],
) -> String {
    let mut lines = vec![
        "## Scope-Based Iteration Plan".to_string(),
        String::new(),
        "This run uses scope-based iteration allocation:".to_string(),
        String::new(),
    ];

    for scope in &config.scopes {
        let allocated = allocations
            .iter()
            .find(|allocation| allocation.name == scope.name)
            .map(|allocation| allocation.iterations)
            .unwrap_or(0);
        lines.push(format!("### {}", title_case(&scope.name)));
        lines.push(format!("- **Focus**: {}", scope.focus));
        lines.push(format!("- **Max iterations**: {}", allocated));
        lines.push(String::new());
    }

    let total: i64 = allocations.iter().map(|allocation| allocation.iterations).sum();
    lines.push(format!("**Total iteration budget**: {}", total));
    lines.push(String::new());
    lines.push(
        "Work through scopes sequentially. Once a scope's iterations are exhausted or approved, move to the next scope."
            .to_string(),
    );
    lines.push(String::new());

    lines.join("\n")
}

fn title_case(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config(shares: &[(&str, u32)]) -> ScopesConfig {
        ScopesConfig {
            scopes: shares
                .iter()
                .map(|(name, iterations)| ScopeConfig {
                    name: name.to_string(),
                    focus: format!("Focus for {}", name),
                    max_iterations: *iterations,
                })
                .collect(),
        }
    }

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_scope_config_validation() {
        let scope = ScopeConfig::new("high_level", "Architecture", 3).unwrap();
        assert_eq!(scope.max_iterations, 3);

        let err = ScopeConfig::new("invalid", "Test", 0).unwrap_err();
        assert!(err.to_string().contains("at least 1 iteration"));
    }

    #[test]
    fn test_total_iterations() {
        let config = config(&[("high_level", 3), ("implementation", 2), ("polish", 1)]);
        assert_eq!(config.total_iterations(), 6);
    }

    #[test]
    fn test_get_scope() {
        let config = config(&[("high_level", 3), ("implementation", 2)]);
        assert_eq!(config.get_scope("high_level").unwrap().max_iterations, 3);
        assert!(config.get_scope("nonexistent").is_none());
    }

    #[test]
    fn test_load_valid_config_preserves_order() {
        let file = write_config(
            "[scopes.high_level]\nfocus = \"Architecture, plans\"\nmax_iterations = 3\n\n\
             [scopes.implementation]\nfocus = \"Code\"\nmax_iterations = 2\n",
        );
        let config = load_scopes_config(file.path()).unwrap();
        assert_eq!(config.scopes.len(), 2);
        assert_eq!(config.scopes[0].name, "high_level");
        assert_eq!(config.scopes[0].focus, "Architecture, plans");
        assert_eq!(config.scopes[1].name, "implementation");
        assert_eq!(config.total_iterations(), 5);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_scopes_config(Path::new("/nonexistent/scopes.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = write_config("invalid toml [[[");
        let err = load_scopes_config(file.path()).unwrap_err();
        assert!(matches!(err, CrucibleError::Toml(_)));
    }

    #[test]
    fn test_load_missing_scopes_section() {
        let file = write_config("[other]\nkey = \"value\"\n");
        let err = load_scopes_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("'scopes' section"));
    }

    #[test]
    fn test_load_missing_focus_names_scope() {
        let file = write_config("[scopes.polish]\nmax_iterations = 2\n");
        let err = load_scopes_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("polish"));
        assert!(err.to_string().contains("focus"));
    }

    #[test]
    fn test_load_missing_max_iterations_names_scope() {
        let file = write_config("[scopes.polish]\nfocus = \"Docs\"\n");
        let err = load_scopes_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("polish"));
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn test_load_non_integer_max_iterations() {
        let file = write_config("[scopes.polish]\nfocus = \"Docs\"\nmax_iterations = \"two\"\n");
        let err = load_scopes_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("integer"));
    }

    #[test]
    fn test_load_zero_max_iterations() {
        let file = write_config("[scopes.polish]\nfocus = \"Docs\"\nmax_iterations = 0\n");
        let err = load_scopes_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("at least 1 iteration"));
    }

    #[test]
    fn test_allocate_without_budget_is_passthrough() {
        let config = config(&[("high_level", 3), ("implementation", 2)]);
        let allocations = allocate_iterations(&config, None);
        assert_eq!(allocations[0].iterations, 3);
        assert_eq!(allocations[1].iterations, 2);
    }

    #[test]
    fn test_allocate_matching_budget_is_passthrough() {
        let config = config(&[("high_level", 3), ("implementation", 2)]);
        let allocations = allocate_iterations(&config, Some(5));
        assert_eq!(allocations[0].iterations, 3);
        assert_eq!(allocations[1].iterations, 2);
    }

    #[test]
    fn test_allocate_scales_proportionally_with_exact_sum() {
        let config = config(&[("high_level", 4), ("implementation", 3), ("polish", 1)]);
        let allocations = allocate_iterations(&config, Some(10));

        // floor(10 * 4/8) = 5, floor(10 * 3/8) = 3, last absorbs 2.
        assert_eq!(allocations[0].iterations, 5);
        assert_eq!(allocations[1].iterations, 3);
        assert_eq!(allocations[2].iterations, 2);
        let total: i64 = allocations.iter().map(|a| a.iterations).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_allocate_enforces_minimum_for_non_last_scopes() {
        let config = config(&[("high_level", 1), ("implementation", 1), ("polish", 8)]);
        let allocations = allocate_iterations(&config, Some(4));

        // floor(4 * 1/10) = 0 -> clamped to 1 for both non-last scopes.
        assert_eq!(allocations[0].iterations, 1);
        assert_eq!(allocations[1].iterations, 1);
        assert_eq!(allocations[2].iterations, 2);
    }

    #[test]
    fn test_allocate_tiny_budget_last_scope_can_go_nonpositive() {
        // Known edge case, preserved on purpose: with a budget smaller
        // than the scope count, the per-scope minimum of 1 exhausts the
        // budget before the last scope, whose remainder goes to zero.
        let config = config(&[("a", 1), ("b", 1), ("c", 1)]);
        let allocations = allocate_iterations(&config, Some(2));
        assert_eq!(allocations[0].iterations, 1);
        assert_eq!(allocations[1].iterations, 1);
        assert_eq!(allocations[2].iterations, 0);

        let allocations = allocate_iterations(&config, Some(1));
        assert_eq!(allocations[2].iterations, -1);
    }

    #[test]
    fn test_generate_scope_instructions() {
        let config = config(&[("high_level", 3), ("polish", 1)]);
        let allocations = allocate_iterations(&config, None);
        let instructions = generate_scope_instructions(&config, &allocations);

        assert!(instructions.contains("## Scope-Based Iteration Plan"));
        assert!(instructions.contains("### High Level"));
        assert!(instructions.contains("### Polish"));
        assert!(instructions.contains("**Max iterations**: 3"));
        assert!(instructions.contains("**Total iteration budget**: 4"));
        assert!(instructions.contains("sequentially"));
    }

    #[test]
    fn test_load_and_allocate_round_trip() {
        let file = write_config(
            "[scopes.high_level]\nfocus = \"Plans\"\nmax_iterations = 4\n\n\
             [scopes.implementation]\nfocus = \"Code\"\nmax_iterations = 3\n\n\
             [scopes.polish]\nfocus = \"Docs\"\nmax_iterations = 1\n",
        );
        let config = load_scopes_config(file.path()).unwrap();
        let allocations = allocate_iterations(&config, Some(16));
        let total: i64 = allocations.iter().map(|a| a.iterations).sum();
        assert_eq!(total, 16);
        assert_eq!(allocations[0].name, "high_level");
    }
}
