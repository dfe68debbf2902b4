//! Out-of-order update suppression for instance updates.

use tracing::debug;

use crate::instance::WorkspaceInstance;
use crate::phase::Phase;

/// What applying one update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransition {
    /// The update replaced the recorded instance.
    pub applied: bool,
    /// Phase recorded after the update.
    pub phase: Phase,
    /// Failure reason carried by the update, surfaced even when stale.
    pub failed: Option<String>,
    /// The update moved a new instance, or an existing one, into `Running`.
    pub entered_running: bool,
    /// The recorded instance is stopping or stopped.
    pub teardown: bool,
}

/// Tracks the latest accepted update for a workspace.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    latest: Option<WorkspaceInstance>,
}

impl PhaseTracker {
    /// Create an empty tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self { latest: None }
    }

    /// Latest accepted instance.
    #[must_use]
    pub const fn latest(&self) -> Option<&WorkspaceInstance> {
        self.latest.as_ref()
    }

    /// Current phase, `Unknown` before any update.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.latest.as_ref().map_or(Phase::Unknown, WorkspaceInstance::phase)
    }

    /// Apply an update. Updates for the same instance whose phase does not
    /// advance past the recorded one are discarded.
    pub fn apply(&mut self, update: WorkspaceInstance) -> PhaseTransition {
        let failed = update.failure().map(str::to_owned);
        let previous = self
            .latest
            .as_ref()
            .filter(|latest| latest.id == update.id)
            .map(WorkspaceInstance::phase);

        if let Some(prev) = previous {
            if update.phase() <= prev {
                debug!(
                    instance = %update.id,
                    current = %prev,
                    stale = %update.phase(),
                    "Discarding stale instance update"
                );
                return PhaseTransition {
                    applied: false,
                    phase: prev,
                    failed,
                    entered_running: false,
                    teardown: prev.is_terminating(),
                };
            }
        }

        let phase = update.phase();
        self.latest = Some(update);

        PhaseTransition {
            applied: true,
            phase,
            failed,
            entered_running: phase == Phase::Running && previous != Some(Phase::Running),
            teardown: phase.is_terminating(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: &str, phase: Phase) -> WorkspaceInstance {
        WorkspaceInstance::new(id, "ws-1", phase)
    }

    #[test]
    fn test_out_of_order_tail_is_ignored() {
        let mut tracker = PhaseTracker::new();
        let results: Vec<bool> = [
            Phase::Preparing,
            Phase::Pending,
            Phase::Creating,
            Phase::Preparing,
        ]
        .into_iter()
        .map(|phase| tracker.apply(update("inst-1", phase)).applied)
        .collect();

        assert_eq!(results, vec![true, true, true, false]);
        assert_eq!(tracker.phase(), Phase::Creating);
    }

    #[test]
    fn test_repeated_phase_is_stale() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.apply(update("inst-1", Phase::Running)).applied);
        let again = tracker.apply(update("inst-1", Phase::Running));
        assert!(!again.applied);
        assert!(!again.entered_running);
    }

    #[test]
    fn test_new_instance_resets_ordering() {
        let mut tracker = PhaseTracker::new();
        tracker.apply(update("inst-1", Phase::Stopped));
        let next = tracker.apply(update("inst-2", Phase::Preparing));
        assert!(next.applied);
        assert_eq!(tracker.phase(), Phase::Preparing);
        assert!(!next.teardown);
    }

    #[test]
    fn test_failure_surfaced_on_stale_update() {
        let mut tracker = PhaseTracker::new();
        tracker.apply(update("inst-1", Phase::Running));
        let stale = tracker.apply(update("inst-1", Phase::Creating).with_failed("boom"));
        assert!(!stale.applied);
        assert_eq!(stale.failed.as_deref(), Some("boom"));
    }

    #[test]
    fn test_entering_running_and_teardown() {
        let mut tracker = PhaseTracker::new();
        assert!(!tracker.apply(update("inst-1", Phase::Creating)).entered_running);
        assert!(tracker.apply(update("inst-1", Phase::Running)).entered_running);
        let stopping = tracker.apply(update("inst-1", Phase::Stopping));
        assert!(stopping.teardown);
        assert!(!stopping.entered_running);
    }
}
