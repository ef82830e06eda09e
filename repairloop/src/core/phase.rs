//! Phase set and transition table for the build-and-repair state machine.
//!
//! The table is the single source of truth for which phase changes the
//! [`StateStore`](crate::io::state_store::StateStore) accepts. Crash recovery
//! has its own mapping ([`recovery_target`]) because it rewinds interrupted
//! phases rather than advancing them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named state in the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    Generating,
    Generated,
    Testing,
    Tested,
    Patching,
    Success,
    Failed,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Init,
        Phase::Generating,
        Phase::Generated,
        Phase::Testing,
        Phase::Tested,
        Phase::Patching,
        Phase::Success,
        Phase::Failed,
    ];

    /// Terminal phases have no outgoing transitions and are never resumed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Success | Phase::Failed)
    }

    /// Phases that only exist while a generation or test step is in flight.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Phase::Generating | Phase::Testing | Phase::Patching)
    }

    /// Targets reachable from `self` in one validated update.
    pub fn allowed_targets(self) -> &'static [Phase] {
        match self {
            Phase::Init => &[Phase::Generating],
            Phase::Generating => &[Phase::Generated, Phase::Failed, Phase::Init],
            Phase::Generated => &[Phase::Testing],
            Phase::Testing => &[Phase::Tested, Phase::Generated],
            Phase::Tested => &[Phase::Patching, Phase::Success, Phase::Failed],
            Phase::Patching => &[Phase::Generated, Phase::Failed, Phase::Tested],
            Phase::Success | Phase::Failed => &[],
        }
    }

    pub fn can_transition_to(self, target: Phase) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Generating => "GENERATING",
            Phase::Generated => "GENERATED",
            Phase::Testing => "TESTING",
            Phase::Tested => "TESTED",
            Phase::Patching => "PATCHING",
            Phase::Success => "SUCCESS",
            Phase::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an interrupted phase resumes.
///
/// An interrupted generation is assumed not to have taken effect, and an
/// interrupted test run must be repeated. Returns `None` for phases that are
/// safe to resume as-is.
pub fn recovery_target(phase: Phase, attempt: u32) -> Option<Phase> {
    match phase {
        Phase::Generating if attempt == 0 => Some(Phase::Init),
        Phase::Generating => Some(Phase::Tested),
        Phase::Testing => Some(Phase::Generated),
        Phase::Patching => Some(Phase::Tested),
        _ => None,
    }
}
