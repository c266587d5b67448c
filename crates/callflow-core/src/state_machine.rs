// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call status lifecycle.
//!
//! | From | Legal targets |
//! |------|---------------|
//! | `in_progress` | `completed`, `failed` |
//! | `completed` | `processing_enrichment`, `archived` |
//! | `processing_enrichment` | `completed`, `failed`, `archived` |
//! | `failed` | `archived` |
//! | `archived` | (terminal) |
//!
//! Requesting the current status is always legal and changes nothing.
//!
//! [`CallStateMachine::transition`] is the only way to obtain a [`Transition`],
//! and every status write in the persistence layer takes one. Status can
//! therefore only move along the edges listed in [`CallStatus::allowed_targets`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Lifecycle status of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Packets are still arriving.
    InProgress,
    /// The call ended and is eligible for enrichment (or was enriched).
    Completed,
    /// Claimed by a processor; enrichment is in flight.
    ProcessingEnrichment,
    /// Enrichment or processing failed.
    Failed,
    /// Terminal. No outgoing edges.
    Archived,
}

impl CallStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [CallStatus; 5] = [
        CallStatus::InProgress,
        CallStatus::Completed,
        CallStatus::ProcessingEnrichment,
        CallStatus::Failed,
        CallStatus::Archived,
    ];

    /// Stored and wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::ProcessingEnrichment => "processing_enrichment",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    /// Statuses reachable from this one in a single step, excluding the self-loop.
    pub fn allowed_targets(&self) -> &'static [CallStatus] {
        match self {
            Self::InProgress => &[CallStatus::Completed, CallStatus::Failed],
            Self::Completed => &[CallStatus::ProcessingEnrichment, CallStatus::Archived],
            Self::ProcessingEnrichment => &[
                CallStatus::Completed,
                CallStatus::Failed,
                CallStatus::Archived,
            ],
            Self::Failed => &[CallStatus::Archived],
            Self::Archived => &[],
        }
    }

    /// Whether `to` is legal from this status. The self-loop is always legal.
    pub fn can_transition_to(&self, to: CallStatus) -> bool {
        *self == to || self.allowed_targets().contains(&to)
    }

    /// Whether the status has no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        self.allowed_targets().is_empty()
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a status string is not one of the known statuses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown call status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for CallStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "processing_enrichment" => Ok(Self::ProcessingEnrichment),
            "failed" => Ok(Self::Failed),
            "archived" => Ok(Self::Archived),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for CallStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// A validated status move.
///
/// Only [`CallStateMachine::transition`] constructs these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    from: CallStatus,
    to: CallStatus,
}

impl Transition {
    /// Status the call must currently hold for the move to apply.
    pub fn from(&self) -> CallStatus {
        self.from
    }

    /// Status the call moves into.
    pub fn to(&self) -> CallStatus {
        self.to
    }

    /// Same-state request: succeeds without touching the call.
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }

    /// Whether applying this move sets `completed_at`.
    pub fn enters_completed(&self) -> bool {
        !self.is_noop() && self.to == CallStatus::Completed
    }

    /// Whether applying this move may record an error message.
    pub fn enters_failed(&self) -> bool {
        !self.is_noop() && self.to == CallStatus::Failed
    }
}

/// Validates status moves against the fixed transition graph.
pub struct CallStateMachine;

impl CallStateMachine {
    /// Validate moving call `call_id` from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTransition`] naming both states when `to`
    /// is not reachable from `from`. The caller must not apply the new status.
    pub fn transition(call_id: &str, from: CallStatus, to: CallStatus) -> Result<Transition> {
        if from.can_transition_to(to) {
            Ok(Transition { from, to })
        } else {
            Err(CoreError::InvalidTransition {
                call_id: call_id.to_string(),
                from,
                to,
            })
        }
    }
}
