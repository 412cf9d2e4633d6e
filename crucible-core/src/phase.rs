//! Phase catalog — the four debate tracks and their role descriptions.
//!
//! A phase selects which role prompts and termination rules apply. The
//! market/design/tech phases run the adversarial Advocate vs. Contrarian
//! loop and hand off to an Implementer after approval; the studio phase is
//! a cooperative roundtable that runs exactly one round and ends with an
//! Integrator synthesis instead of a verdict.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CrucibleError;

/// A named debate track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Market viability vetting.
    Market,
    /// Core-loop and scope design vetting.
    Design,
    /// Architecture and ops vetting.
    Tech,
    /// Studio-wide roundtable (cooperative, no verdict).
    Studio,
}

impl Phase {
    /// All phases in pipeline order.
    pub fn all() -> &'static [Phase] {
        &[Self::Market, Self::Design, Self::Tech, Self::Studio]
    }

    /// Lowercase phase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Design => "design",
            Self::Tech => "tech",
            Self::Studio => "studio",
        }
    }

    /// Whether the contrarian issues a verdict in this phase.
    pub fn has_verdict(self) -> bool {
        !self.is_studio()
    }

    /// Whether this is the cooperative roundtable phase.
    pub fn is_studio(self) -> bool {
        matches!(self, Self::Studio)
    }

    /// Role descriptions and deliverables for this phase.
    pub fn details(self) -> &'static PhaseDetails {
        match self {
            Self::Market => &MARKET_DETAILS,
            Self::Design => &DESIGN_DETAILS,
            Self::Tech => &TECH_DETAILS,
            Self::Studio => &STUDIO_DETAILS,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = CrucibleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "market" => Ok(Self::Market),
            "design" => Ok(Self::Design),
            "tech" => Ok(Self::Tech),
            "studio" => Ok(Self::Studio),
            other => Err(CrucibleError::UnknownPhase(other.to_string())),
        }
    }
}

/// Implementer role metadata for a verdict phase.
#[derive(Debug, Clone)]
pub struct ImplementerDetails {
    /// Role title shown in run instructions.
    pub title: &'static str,
    /// Deliverables checklist produced after approval.
    pub deliverables: &'static [&'static str],
}

/// Role descriptions for one phase.
#[derive(Debug, Clone)]
pub struct PhaseDetails {
    /// Advocate role description.
    pub advocate: &'static str,
    /// Contrarian role description.
    pub contrarian: &'static str,
    /// Implementer role, absent for the studio phase.
    pub implementer: Option<ImplementerDetails>,
    /// Integrator role, studio phase only.
    pub integrator: Option<&'static str>,
    /// Phase-specific operator notes.
    pub notes: &'static str,
}

static MARKET_DETAILS: PhaseDetails = PhaseDetails {
    advocate: "Market Growth Strategist — steel-man the idea into a high-virality hook.",
    contrarian: "The Reality Check — hunt for fatal market flaws and issue VERDICT: APPROVED/REJECTED.",
    implementer: Some(ImplementerDetails {
        title: "Market Research Analyst",
        deliverables: &[
            "Target audience profile with segments + motivations.",
            "Competitor analysis table (at least 3 comparables).",
            "Unique value proposition statement.",
            "Go-to-market plan focused on low-cost tactics.",
            "Success metrics/KPIs to watch.",
        ],
    }),
    integrator: None,
    notes: "Stop iterating once the contrarian returns VERDICT: APPROVED, then run implementation.",
};

static DESIGN_DETAILS: PhaseDetails = PhaseDetails {
    advocate: "Lead Systems Designer — craft the Minimum Viable Fun core loop.",
    contrarian: "Scope-Creep Police — attack complexity, timeline, and missing UX safeguards.",
    implementer: Some(ImplementerDetails {
        title: "Design Documenter",
        deliverables: &[
            "Annotated core loop (bullets or diagram).",
            "Progression system outline.",
            "Key mechanics with rules/exceptions.",
            "UI/UX wireframe descriptions for critical screens.",
            "Technical/design constraints checklist.",
        ],
    }),
    integrator: None,
    notes: "Keep scope laser-focused on what can be shipped in weeks, not months.",
};

static TECH_DETAILS: PhaseDetails = PhaseDetails {
    advocate: "Technical Architect — define a performant, shippable architecture.",
    contrarian: "Senior SRE — flag performance, compatibility, and ops risks.",
    implementer: Some(ImplementerDetails {
        title: "Technical Architect & Code Generator",
        deliverables: &[
            "High-level architecture diagram or structured description.",
            "Technology stack with justifications + fallbacks.",
            "Suggested file/module structure.",
            "Key algorithms/data-structure notes.",
            "Starter configuration or scaffold snippet.",
        ],
    }),
    integrator: None,
    notes: "Don't forget client constraints and ops toil when approving.",
};

static STUDIO_DETAILS: PhaseDetails = PhaseDetails {
    advocate: "Studio Workflow Producer — articulate the inspiring yet actionable vision.",
    contrarian: "Bootstrapped Reality Auditor — interrogate costs, scope, and maintenance burden.",
    implementer: None,
    integrator: Some(
        "Systems Integrator & Ops Lead — merge inspiration + constraints into a pragmatic upgrade plan after approval.",
    ),
    notes: "Iterate like every other phase until the contrarian approves, then hand off to the Integrator for the roadmap.",
};
