//! Activity samples and the report decision.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One sample of local client activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatState {
    /// A client is attached to the workspace.
    #[serde(default)]
    pub connected: bool,
    /// Idle time of the attached client.
    #[serde(default)]
    pub seconds_since_last_activity: u64,
}

impl HeartbeatState {
    #[must_use]
    pub const fn new(connected: bool, seconds_since_last_activity: u64) -> Self {
        Self {
            connected,
            seconds_since_last_activity,
        }
    }
}

/// Outcome of comparing two consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatDecision {
    /// Connectivity flipped; send one report.
    Report { was_closed: bool },
    /// Nothing new to say.
    Unchanged,
    /// Still connected but idle past the interval; no transition is guessed.
    Ambiguous,
}

/// Decide what to report given the previous and current sample.
///
/// `bound` is the jittered interval that separated the two samples.
#[must_use]
pub const fn decide(
    previous: &HeartbeatState,
    current: &HeartbeatState,
    bound: Duration,
) -> HeartbeatDecision {
    if previous.connected != current.connected {
        return HeartbeatDecision::Report {
            was_closed: !current.connected,
        };
    }
    if current.connected && current.seconds_since_last_activity > bound.as_secs() {
        return HeartbeatDecision::Ambiguous;
    }
    HeartbeatDecision::Unchanged
}
