//! Cluster health state machine.
//!
//! This module defines the valid health transitions for a managed cluster and provides
//! validation logic so the manager can never move a cluster backwards.
//!
//! # State Machine
//!
//! ```text
//!     ┌─────────────────┐
//!     │    Starting     │───────────────────────────┐
//!     └────────┬────────┘                           │
//!              │ (probe ready)                      │ (launch or readiness failed)
//!              ▼                                    │
//!     ┌─────────────────┐   (restart,      ┌────────┴────────┐
//!     │      Ready      │──  add pool) ───▶│    Degraded     │
//!     │  (in use while  │◀── (recovered) ──│                 │
//!     │   refcount > 0) │                  └────────┬────────┘
//!     └────────┬────────┘                           │
//!              │ (last release / shutdown)          │ (did not recover)
//!              ▼                                    ▼
//!     ┌─────────────────┐                  ┌─────────────────┐
//!     │     Stopped     │                  │     Failed      │
//!     └─────────────────┘                  └─────────────────┘
//! ```
//!
//! `Stopped` and `Failed` are terminal; only clusters in a terminal state may leave the
//! registry.

use std::fmt;

use mcluster_core::ClusterId;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Health of a managed cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Launched, readiness not yet confirmed.
    Starting,
    /// Accepting work.
    Ready,
    /// Temporarily unavailable while a node restarts or the cluster relaunches.
    Degraded,
    /// Torn down on purpose.
    Stopped,
    /// Could not start or recover.
    Failed,
}

impl HealthState {
    /// The lowercase name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a health transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `ControlError::InvalidTransition` if the transition is not allowed.
pub fn validate_transition(
    cluster_id: &ClusterId,
    from: HealthState,
    to: HealthState,
) -> Result<HealthState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::InvalidTransition {
            cluster_id: *cluster_id,
            from,
            to,
        })
    }
}

/// Check if a health transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: HealthState, to: HealthState) -> bool {
    use HealthState::{Degraded, Failed, Ready, Starting, Stopped};

    matches!(
        (from, to),
        (Starting | Degraded, Ready)
            | (Ready, Degraded)
            | (Starting | Degraded, Failed)
            | (Starting | Ready | Degraded, Stopped)
    )
}

/// Returns the list of valid target states from the given state.
#[must_use]
pub fn valid_transitions_from(state: HealthState) -> Vec<HealthState> {
    use HealthState::{Degraded, Failed, Ready, Starting, Stopped};

    match state {
        Starting => vec![Ready, Failed, Stopped],
        Ready => vec![Degraded, Stopped],
        Degraded => vec![Ready, Failed, Stopped],
        Stopped | Failed => vec![],
    }
}

/// Returns true if a registered cluster in this state can be handed to another caller.
#[must_use]
pub const fn can_be_shared(state: HealthState) -> bool {
    matches!(state, HealthState::Ready)
}

/// Returns true if the cluster is in a terminal state (stopped or failed).
#[must_use]
pub const fn is_terminal(state: HealthState) -> bool {
    matches!(state, HealthState::Stopped | HealthState::Failed)
}

/// Returns true if the cluster may still have running nodes.
#[must_use]
pub const fn is_active(state: HealthState) -> bool {
    matches!(
        state,
        HealthState::Starting | HealthState::Ready | HealthState::Degraded
    )
}
