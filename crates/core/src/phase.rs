//! Workspace instance lifecycle phases.
//!
//! Phases form a total order by progress. Observers compare positions in this
//! order to discard stale or out-of-order instance updates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse lifecycle stage of a workspace instance.
///
/// Declaration order is the progress order: `Unknown < Preparing < ... < Stopped`.
/// Unrecognised phase strings deserialize to [`Phase::Unknown`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    #[serde(other)]
    Unknown,
    Preparing,
    Pending,
    Creating,
    Initializing,
    Interrupted,
    Running,
    Stopping,
    Stopped,
}

/// Display text per phase. Anything missing renders as the `Unknown` entry.
const PHASE_TEXT: &[(Phase, &str, &str)] = &[
    (Phase::Unknown, "unknown", "Unknown"),
    (Phase::Preparing, "preparing", "Preparing"),
    (Phase::Pending, "pending", "Allocating resources..."),
    (Phase::Creating, "creating", "Pulling container image..."),
    (Phase::Initializing, "initializing", "Initializing workspace content..."),
    (Phase::Interrupted, "interrupted", "Interrupted"),
    (Phase::Running, "running", "Running"),
    (Phase::Stopping, "stopping", "Stopping"),
    (Phase::Stopped, "stopped", "Stopped"),
];

impl Phase {
    /// All phases in progress order.
    pub const ALL: [Self; 9] = [
        Self::Unknown,
        Self::Preparing,
        Self::Pending,
        Self::Creating,
        Self::Initializing,
        Self::Interrupted,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
    ];

    /// Parse a phase name. Unrecognised names fail closed to `Unknown`.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        PHASE_TEXT
            .iter()
            .find(|(_, wire, _)| wire.eq_ignore_ascii_case(name))
            .map_or(Self::Unknown, |(phase, _, _)| *phase)
    }

    /// Wire name of the phase.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        lookup(self).0
    }

    /// Human readable progress text.
    #[must_use]
    pub fn display_text(self) -> &'static str {
        lookup(self).1
    }

    /// Position in the progress order.
    #[must_use]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Whether a live session tied to the instance must be torn down.
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

fn lookup(phase: Phase) -> (&'static str, &'static str) {
    PHASE_TEXT
        .iter()
        .find(|(p, _, _)| *p == phase)
        .or_else(|| PHASE_TEXT.first())
        .map_or(("unknown", "Unknown"), |(_, wire, text)| (*wire, *text))
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_order() {
        let ordered = Phase::ALL;
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{} should precede {}", pair[0], pair[1]);
        }
        assert!(Phase::Interrupted < Phase::Running);
        assert!(Phase::Running < Phase::Stopping);
    }

    #[test]
    fn test_parse_fails_closed() {
        assert_eq!(Phase::parse("running"), Phase::Running);
        assert_eq!(Phase::parse("RUNNING"), Phase::Running);
        assert_eq!(Phase::parse("hibernating"), Phase::Unknown);
        assert_eq!(Phase::parse(""), Phase::Unknown);
    }

    #[test]
    fn test_every_phase_has_text() {
        for phase in Phase::ALL {
            assert!(!phase.display_text().is_empty());
            assert_eq!(Phase::parse(phase.as_str()), phase);
        }
        assert_eq!(Phase::Pending.display_text(), "Allocating resources...");
    }

    #[test]
    fn test_serde_unknown_phase() {
        let phase: Phase = serde_json::from_str("\"bogus\"").unwrap_or(Phase::Running);
        assert_eq!(phase, Phase::Unknown);

        let phase: Phase = serde_json::from_str("\"stopping\"").unwrap_or(Phase::Unknown);
        assert_eq!(phase, Phase::Stopping);
        assert!(phase.is_terminating());
    }
}
