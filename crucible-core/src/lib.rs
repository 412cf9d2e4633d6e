//! Crucible — multi-agent debate orchestration for vetting project
//! proposals.
//!
//! A proposal is worked through phases (market, design, tech, studio); in
//! each phase an Advocate drafts, a Contrarian critiques and issues a
//! `VERDICT: APPROVED/REJECTED`, and rejected output is fed back into the
//! next round until approval or the iteration cap. This crate provides:
//!
//! - `verdict` / `rejection`: verdict extraction and the rejection-reason
//!   parsing cascade with prompt feedback injection
//! - `iteration`: the iterative kickoff loop with model-fallback retries
//! - `health`: candidate cooldown/overheat tracking and selection
//! - `scopes`: scope-based iteration budget allocation
//! - `runs` / `cleanup` / `validate`: run lifecycle, retention, and
//!   artifact validation
//!
//! The agent framework itself stays behind the [`iteration::AgentTurn`]
//! abstraction; this crate performs no inference.

pub mod cleanup;
pub mod error;
pub mod health;
pub mod iteration;
pub mod phase;
pub mod rejection;
pub mod runs;
pub mod scopes;
pub mod validate;
pub mod verdict;

pub use cleanup::{
    cleanup_runs, format_bytes, load_cleanup_settings, CleanupReport, CleanupSettings,
    DeletionReason,
};
pub use error::{CrucibleError, CrucibleResult, TurnError};
pub use health::{
    FailureAction, HealthConfig, ModelSelector, ModelStrategySnapshot, RateLimitMonitor,
    RateLimitSnapshot, DEFAULT_CANDIDATE,
};
pub use iteration::{
    run_iterative_kickoff, safe_max_iterations, AgentTurn, ImplementationTurn, IterationRecord,
    KickoffOutcome, TurnInputs,
};
pub use phase::{Phase, PhaseDetails};
pub use rejection::{
    detect_rerun_mode, extract_rejection_reasons, find_latest_rejection,
    generate_rerun_instructions, inject_context_into_prompt, load_rejection_context,
    RejectionContext,
};
pub use runs::{
    build_instruction_doc, collect_runs, finalize_run, output_root, prepare_run, rebuild_index,
    FinalizeOptions, PreparedRun, RunMeta,
};
pub use scopes::{
    allocate_iterations, generate_scope_instructions, load_scopes_config, ScopeAllocation,
    ScopeConfig, ScopesConfig,
};
pub use validate::{check_completeness, check_format, check_verdict, ValidationReport};
pub use verdict::{extract_verdict, Verdict};
