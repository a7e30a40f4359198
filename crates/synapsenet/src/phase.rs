//! Repair phases — explicit states and legal transition guards.
//!
//! The repair loop moves through four phases. Every run starts at
//! `Reproduce` and terminates only through a mediator SUCCESS or FAIL
//! decision; the phase value itself is never terminal.
//!
//! ```text
//! Reproduce ── advance ──► RepairAnalyze ── advance ──► RepairPatch ── advance ──► Validate
//! any phase ── replan ──► Reproduce
//! any phase ── retry  ──► itself
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// The set of repair-loop phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairPhase {
    /// Discover the workspace and observe the failure by running tests.
    Reproduce,
    /// Produce a structured root-cause diagnosis. No tools allowed.
    RepairAnalyze,
    /// Apply a minimal patch to the diagnosed artifact.
    RepairPatch,
    /// Re-run the test suite to confirm the patch.
    Validate,
}

impl RepairPhase {
    /// The phase an ADVANCE decision moves into, when there is one.
    ///
    /// `Validate` has no successor phase — advancing from it moves to the
    /// next task of the current plan instead.
    pub fn advance_target(self) -> Option<RepairPhase> {
        match self {
            Self::Reproduce => Some(Self::RepairAnalyze),
            Self::RepairAnalyze => Some(Self::RepairPatch),
            Self::RepairPatch => Some(Self::Validate),
            Self::Validate => None,
        }
    }

    /// Whether a REPLAN from this phase closes a repair cycle and must be
    /// captured as a [`crate::repair_attempt::RepairAttempt`].
    ///
    /// Reproduce-phase replans carry no repair signal and are excluded —
    /// they would pollute history with meaningless NO_PATCH entries.
    pub fn records_repair_attempt(self) -> bool {
        matches!(self, Self::RepairAnalyze | Self::RepairPatch | Self::Validate)
    }
}

/// Legal phase transitions, independent of the decision that caused them.
///
/// Any phase may transition to itself (retry) or back to `Reproduce`
/// (replan); forward movement follows the advance chain only.
pub fn is_legal_transition(from: RepairPhase, to: RepairPhase) -> bool {
    if from == to || to == RepairPhase::Reproduce {
        return true;
    }
    from.advance_target() == Some(to)
}

impl fmt::Display for RepairPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reproduce => write!(f, "REPRODUCE"),
            Self::RepairAnalyze => write!(f, "REPAIR_ANALYZE"),
            Self::RepairPatch => write!(f, "REPAIR_PATCH"),
            Self::Validate => write!(f, "VALIDATE"),
        }
    }
}
