// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for callflow-core.
//!
//! Provides a unified error type with stable codes for boundary mapping.

use std::fmt;

use crate::state_machine::CallStatus;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while ingesting, transitioning, or processing calls.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Call was not found in the store.
    CallNotFound {
        /// The external call ID that was not found.
        call_id: String,
    },

    /// Input validation failed at the boundary.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// The requested status move is not an edge of the transition graph.
    InvalidTransition {
        /// The external call ID.
        call_id: String,
        /// Status the call is currently in.
        from: CallStatus,
        /// Status that was requested.
        to: CallStatus,
    },

    /// Optimistic writes to a call row kept losing to concurrent writers.
    ConcurrentModification {
        /// The external call ID.
        call_id: String,
    },

    /// A stored row could not be decoded into its domain type.
    CorruptRecord {
        /// The external call ID.
        call_id: String,
        /// The column that failed to decode.
        field: String,
        /// Decode error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CallNotFound { .. } => "CALL_NOT_FOUND",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the error was caused by the caller's request rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::CallNotFound { .. } | Self::ValidationError { .. } | Self::InvalidTransition { .. }
        )
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallNotFound { call_id } => {
                write!(f, "Call '{}' not found", call_id)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::InvalidTransition { call_id, from, to } => {
                write!(
                    f,
                    "Invalid state transition for call '{}': {} -> {}",
                    call_id, from, to
                )
            }
            Self::ConcurrentModification { call_id } => {
                write!(
                    f,
                    "Call '{}' was modified concurrently too many times",
                    call_id
                )
            }
            Self::CorruptRecord {
                call_id,
                field,
                details,
            } => {
                write!(
                    f,
                    "Stored call '{}' has an unreadable '{}': {}",
                    call_id, field, details
                )
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
