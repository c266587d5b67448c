// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Packet sequence tracking.
//!
//! A call keeps an expected-sequence cursor and the set of sequence numbers
//! that were skipped over. [`SequenceTracker::ingest`] folds one packet into
//! that state and reports how the packet arrived. It has no hidden state; the
//! caller persists the result.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sequence numbers known to be skipped and not yet observed.
///
/// Stored as sorted, comma-joined text (`"1,2,3"`, empty when nothing is missing).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MissingSequences(BTreeSet<i64>);

impl MissingSequences {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no sequence is missing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of missing sequences.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether `sequence` is recorded as missing.
    pub fn contains(&self, sequence: i64) -> bool {
        self.0.contains(&sequence)
    }

    /// Ascending iterator over the missing sequences.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.iter().copied()
    }

    /// Ascending list of the missing sequences.
    pub fn to_vec(&self) -> Vec<i64> {
        self.iter().collect()
    }

    /// Highest missing sequence, if any.
    pub fn last(&self) -> Option<i64> {
        self.0.last().copied()
    }
}

impl FromIterator<i64> for MissingSequences {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for MissingSequences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seq in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}", seq)?;
            first = false;
        }
        Ok(())
    }
}

/// Returned when stored missing-sequence text cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid missing-sequence entry '{0}'")]
pub struct InvalidMissingSequences(pub String);

impl FromStr for MissingSequences {
    type Err = InvalidMissingSequences;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<i64>()
                    .map_err(|_| InvalidMissingSequences(part.to_string()))
            })
            .collect()
    }
}

impl TryFrom<String> for MissingSequences {
    type Error = InvalidMissingSequences;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Largest number of sequences a call may have recorded as missing.
///
/// Bounds both a single far-ahead packet and the stored missing-set text that
/// every later packet of the call has to read back.
pub const MAX_MISSING_SEQUENCES: usize = 10_000;

/// A packet the tracker cannot fold into a call's state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceRejected {
    /// Accepting the packet would move the cursor past `i64::MAX`.
    #[error("sequence {sequence} leaves no room for a next expected sequence")]
    CursorOverflow {
        /// Sequence the packet carried.
        sequence: i64,
    },
    /// Accepting the packet would record too many missing sequences.
    #[error(
        "sequence {received} skips ahead of expected {expected}; \
         {missing} sequences would be missing (limit {limit})"
    )]
    GapTooWide {
        /// Cursor before the packet.
        expected: i64,
        /// Sequence the packet carried.
        received: i64,
        /// Size the missing set would reach.
        missing: u64,
        /// [`MAX_MISSING_SEQUENCES`].
        limit: usize,
    },
}

/// What to do with `missingSequences` when a late packet fills a recorded gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatePacketPolicy {
    /// Leave the missing set untouched. A filled gap stays listed.
    #[default]
    Retain,
    /// Remove the late packet's sequence from the missing set.
    Reconcile,
}

/// How a packet relates to the cursor it was folded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// The packet carried exactly the expected sequence.
    InOrder,
    /// The packet skipped ahead; `first_missing..received` were recorded as missing.
    Gap {
        /// Cursor value before the packet arrived.
        first_missing: i64,
        /// Sequence the packet carried.
        received: i64,
    },
    /// The packet is behind the cursor.
    Late {
        /// Whether this sequence was recorded as missing when it arrived.
        filled_gap: bool,
    },
}

impl Arrival {
    /// The in-order flag reported to the caller.
    pub fn is_in_order(&self) -> bool {
        matches!(self, Self::InOrder)
    }
}

/// Sequence state of one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceState {
    /// Next sequence number the call expects. Never decreases.
    pub expected_sequence: i64,
    /// Skipped sequence numbers, always below `expected_sequence`.
    pub missing: MissingSequences,
}

/// Result of folding one packet into a [`SequenceState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    /// State after the packet.
    pub state: SequenceState,
    /// How the packet arrived.
    pub arrival: Arrival,
}

/// Pure fold over a call's packet sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceTracker {
    policy: LatePacketPolicy,
}

impl SequenceTracker {
    /// Tracker with the given late-packet policy.
    pub fn new(policy: LatePacketPolicy) -> Self {
        Self { policy }
    }

    /// Late-packet policy in effect.
    pub fn policy(&self) -> LatePacketPolicy {
        self.policy
    }

    /// Fold `sequence` into `state`.
    ///
    /// `sequence` must be non-negative; the ingestion boundary rejects
    /// anything else before it gets here.
    ///
    /// # Errors
    ///
    /// - [`SequenceRejected::CursorOverflow`] for `i64::MAX` at or past the cursor
    /// - [`SequenceRejected::GapTooWide`] when the missing set would exceed
    ///   [`MAX_MISSING_SEQUENCES`]; the set is never built in that case
    pub fn ingest(
        &self,
        state: &SequenceState,
        sequence: i64,
    ) -> Result<Ingested, SequenceRejected> {
        let cursor = state.expected_sequence;

        if sequence < cursor {
            let filled_gap = state.missing.contains(sequence);
            let mut next = state.clone();
            if filled_gap && self.policy == LatePacketPolicy::Reconcile {
                next.missing.0.remove(&sequence);
            }
            return Ok(Ingested {
                state: next,
                arrival: Arrival::Late { filled_gap },
            });
        }

        let expected_sequence = sequence
            .checked_add(1)
            .ok_or(SequenceRejected::CursorOverflow { sequence })?;

        if sequence == cursor {
            return Ok(Ingested {
                state: SequenceState {
                    expected_sequence,
                    missing: state.missing.clone(),
                },
                arrival: Arrival::InOrder,
            });
        }

        // Both are non-negative, so the difference cannot overflow
        let skipped = (sequence - cursor) as u64;
        let missing_after = state.missing.len() as u64 + skipped;
        if missing_after > MAX_MISSING_SEQUENCES as u64 {
            return Err(SequenceRejected::GapTooWide {
                expected: cursor,
                received: sequence,
                missing: missing_after,
                limit: MAX_MISSING_SEQUENCES,
            });
        }

        let mut missing = state.missing.0.clone();
        missing.extend(cursor..sequence);
        Ok(Ingested {
            state: SequenceState {
                expected_sequence,
                missing: MissingSequences(missing),
            },
            arrival: Arrival::Gap {
                first_missing: cursor,
                received: sequence,
            },
        })
    }
}
