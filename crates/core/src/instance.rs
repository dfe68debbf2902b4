//! Workspace instance wire types.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::phase::Phase;

/// Conditions reported alongside an instance's phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConditions {
    /// Set when the instance failed; shown to users verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<String>,
    /// Set when the instance timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Status block of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub conditions: InstanceConditions,
}

/// A single run of a workspace, as pushed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInstance {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub ide_url: String,
}

impl WorkspaceInstance {
    /// Create an instance in the given phase.
    pub fn new(id: impl Into<String>, workspace_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            status: InstanceStatus {
                phase,
                conditions: InstanceConditions::default(),
            },
            ide_url: String::new(),
        }
    }

    /// Set the failed condition.
    #[must_use]
    pub fn with_failed(mut self, reason: impl Into<String>) -> Self {
        self.status.conditions.failed = Some(reason.into());
        self
    }

    /// Set the IDE URL.
    #[must_use]
    pub fn with_ide_url(mut self, url: impl Into<String>) -> Self {
        self.ide_url = url.into();
        self
    }

    /// Decode an instance from a JSON value, rejecting instances without an id.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let instance: Self = serde_json::from_value(value)?;
        if instance.id.is_empty() {
            return Err(Error::invalid_instance("missing instance id"));
        }
        Ok(instance)
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.status.phase
    }

    /// Non-empty failure reason, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.status
            .conditions
            .failed
            .as_deref()
            .filter(|reason| !reason.is_empty())
    }
}
