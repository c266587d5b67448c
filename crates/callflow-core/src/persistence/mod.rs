//! Persistence interfaces and backends for callflow-core.
//!
//! The store is the single source of truth for calls and packets. Every status
//! write is conditioned on the status the caller observed, and every sequence
//! write is conditioned on the row version the caller read, so concurrent
//! writers can never silently overwrite each other.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CoreError;
use crate::sequence::{MissingSequences, SequenceState};
use crate::state_machine::{CallStatus, Transition};

/// Call record from the persistence layer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CallRecord {
    /// Caller-supplied identity key.
    pub external_id: String,
    /// Current lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: CallStatus,
    /// Next sequence number the call expects.
    pub expected_sequence: i64,
    /// Packets accepted, duplicates included.
    pub total_packets: i64,
    /// Sequence numbers skipped and not yet observed.
    #[sqlx(try_from = "String")]
    pub missing_sequences: MissingSequences,
    /// Set on successful enrichment.
    pub transcription: Option<String>,
    /// Set on successful enrichment.
    pub sentiment: Option<String>,
    /// Enrichment attempts made, successful or not.
    pub enrichment_attempts: i64,
    /// Set when the call enters Failed.
    pub error_message: Option<String>,
    /// Optimistic concurrency counter.
    #[serde(skip)]
    pub version: i64,
    /// Generation of the latest enrichment claim.
    #[serde(skip)]
    pub claim_generation: i64,
    /// When the call was created.
    pub created_at: DateTime<Utc>,
    /// When the call row last changed.
    pub updated_at: DateTime<Utc>,
    /// When the call last entered Completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// When enrichment succeeded.
    pub enriched_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    /// Sequence cursor and missing set as a [`SequenceState`].
    pub fn sequence_state(&self) -> SequenceState {
        SequenceState {
            expected_sequence: self.expected_sequence,
            missing: self.missing_sequences.clone(),
        }
    }
}

/// Packet record from the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PacketRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning call's external ID.
    pub call_id: String,
    /// Sequence number carried by the packet.
    pub sequence: i64,
    /// Packet payload.
    pub payload: String,
    /// Client-side timestamp (seconds since epoch).
    pub client_timestamp: f64,
    /// Server receive time.
    pub received_at: DateTime<Utc>,
}

/// A packet together with the sequence state it produces.
#[derive(Debug, Clone)]
pub struct PacketWrite {
    /// Owning call's external ID.
    pub call_id: String,
    /// Row version the new state was computed from.
    pub observed_version: i64,
    /// Sequence state after folding the packet in.
    pub state: SequenceState,
    /// Sequence number carried by the packet.
    pub sequence: i64,
    /// Packet payload.
    pub payload: String,
    /// Client-side timestamp.
    pub client_timestamp: f64,
    /// Server receive time.
    pub received_at: DateTime<Utc>,
}

/// Enrichment outcome recorded together with the status move out of ProcessingEnrichment.
#[derive(Debug, Clone)]
pub enum EnrichmentUpdate {
    /// Enrichment succeeded.
    Enriched {
        /// Transcribed text.
        transcription: String,
        /// Sentiment label.
        sentiment: String,
        /// Attempts consumed.
        attempts: u32,
        /// When the result was obtained.
        enriched_at: DateTime<Utc>,
    },
    /// Enrichment gave up.
    Failed {
        /// Attempts consumed.
        attempts: u32,
        /// Human-readable failure.
        error_message: String,
    },
}

/// Persistence backend for calls and packets.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    /// Create an InProgress call unless one exists. Returns the row and whether it was created.
    async fn create_call_if_absent(
        &self,
        external_id: &str,
    ) -> Result<(CallRecord, bool), CoreError>;

    /// Fetch a call by external ID.
    async fn get_call(&self, external_id: &str) -> Result<Option<CallRecord>, CoreError>;

    /// Calls ordered by most recently updated, optionally filtered by status.
    async fn list_calls(
        &self,
        status: Option<CallStatus>,
        limit: i64,
    ) -> Result<Vec<CallRecord>, CoreError>;

    /// Completed calls that have not been enriched yet, oldest update first.
    async fn calls_awaiting_enrichment(&self, limit: i64) -> Result<Vec<CallRecord>, CoreError>;

    /// ProcessingEnrichment calls last updated before `older_than`.
    async fn stale_claims(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CallRecord>, CoreError>;

    /// Store a packet and the call's new sequence state atomically.
    ///
    /// Returns `None` without writing anything when the call's version no
    /// longer matches `observed_version`.
    async fn append_packet(&self, write: &PacketWrite) -> Result<Option<PacketRecord>, CoreError>;

    /// Packets of a call ordered by sequence, then arrival.
    async fn packets_for_call(&self, external_id: &str) -> Result<Vec<PacketRecord>, CoreError>;

    /// Number of stored packets for a call.
    async fn count_packets(&self, external_id: &str) -> Result<i64, CoreError>;

    /// Apply a status move if the call still holds `transition.from()`.
    ///
    /// Sets `completed_at` when entering Completed and `error_message` when
    /// entering Failed with a message. A move into ProcessingEnrichment is a
    /// claim and behaves like [`claim_call`](Self::claim_call). Returns
    /// `false` if the condition no longer held.
    async fn apply_transition(
        &self,
        external_id: &str,
        transition: &Transition,
        error_message: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// Claim a call for enrichment.
    ///
    /// Applies `transition` (into ProcessingEnrichment) only if the call still
    /// holds `transition.from()` and has not been enriched, and returns the new
    /// claim generation. Every write the owner makes afterwards is fenced on
    /// that generation, so once a claim is released and taken again the
    /// previous owner can no longer change the call.
    async fn claim_call(
        &self,
        external_id: &str,
        transition: &Transition,
    ) -> Result<Option<i64>, CoreError>;

    /// Refresh `updated_at` of a live claim. Returns `false` if the claim was lost.
    async fn touch_claim(&self, external_id: &str, claim: i64) -> Result<bool, CoreError>;

    /// Move a claimed call out of ProcessingEnrichment without an enrichment
    /// outcome, if `claim` is still the current claim.
    async fn release_claim(
        &self,
        external_id: &str,
        claim: i64,
        transition: &Transition,
        error_message: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// Record an enrichment outcome and apply `transition` in one write, if
    /// `claim` is still the current claim.
    ///
    /// The attempts in `update` are added to `enrichment_attempts` even when
    /// the claim was lost, since the provider was called either way. Returns
    /// whether the outcome was applied.
    async fn finish_enrichment(
        &self,
        external_id: &str,
        claim: i64,
        transition: &Transition,
        update: &EnrichmentUpdate,
    ) -> Result<bool, CoreError>;

    /// Add provider calls made under a claim that was lost before an outcome
    /// could be recorded.
    async fn record_attempts(&self, external_id: &str, attempts: u32) -> Result<(), CoreError>;

    /// Verify the backend is reachable.
    async fn health_check(&self) -> Result<(), CoreError>;
}
