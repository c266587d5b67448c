//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;
use crate::migrations;
use crate::state_machine::{CallStatus, Transition};

use super::{CallRecord, EnrichmentUpdate, PacketRecord, PacketWrite, Persistence};

const CALL_COLUMNS: &str = "external_id, status, expected_sequence, total_packets, \
     missing_sequences, transcription, sentiment, enrichment_attempts, error_message, \
     version, claim_generation, created_at, updated_at, completed_at, enriched_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The pool must already be migrated (see [`migrations::run_sqlite`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, then run all migrations.
    ///
    /// In-memory URLs get a single connection, since every SQLite memory
    /// connection is a separate database.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            // The database lives only as long as its connection
            options = options.idle_timeout(None).max_lifetime(None);
        }

        let pool = options
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/calls.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Map row-decoding failures of a single call to [`CoreError::CorruptRecord`].
fn decode_error(external_id: &str, err: sqlx::Error) -> CoreError {
    match err {
        sqlx::Error::ColumnDecode { index, source } => CoreError::CorruptRecord {
            call_id: external_id.to_string(),
            field: index,
            details: source.to_string(),
        },
        other => other.into(),
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_call_if_absent(
        &self,
        external_id: &str,
    ) -> Result<(CallRecord, bool), CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO calls (external_id, status, created_at, updated_at)
            VALUES (?1, 'in_progress', ?2, ?2)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(external_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let record = self
            .get_call(external_id)
            .await?
            .ok_or_else(|| CoreError::CallNotFound {
                call_id: external_id.to_string(),
            })?;

        Ok((record, result.rows_affected() > 0))
    }

    async fn get_call(&self, external_id: &str) -> Result<Option<CallRecord>, CoreError> {
        sqlx::query_as::<_, CallRecord>(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE external_id = ?"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| decode_error(external_id, e))
    }

    async fn list_calls(
        &self,
        status: Option<CallStatus>,
        limit: i64,
    ) -> Result<Vec<CallRecord>, CoreError> {
        let records = sqlx::query_as::<_, CallRecord>(&format!(
            r#"
            SELECT {CALL_COLUMNS}
            FROM calls
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY updated_at DESC, id DESC
            LIMIT ?2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn calls_awaiting_enrichment(&self, limit: i64) -> Result<Vec<CallRecord>, CoreError> {
        let records = sqlx::query_as::<_, CallRecord>(&format!(
            r#"
            SELECT {CALL_COLUMNS}
            FROM calls
            WHERE status = 'completed' AND enriched_at IS NULL
            ORDER BY updated_at ASC, id ASC
            LIMIT ?
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn stale_claims(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CallRecord>, CoreError> {
        let records = sqlx::query_as::<_, CallRecord>(&format!(
            r#"
            SELECT {CALL_COLUMNS}
            FROM calls
            WHERE status = 'processing_enrichment' AND updated_at < ?
            ORDER BY updated_at ASC, id ASC
            LIMIT ?
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn append_packet(&self, write: &PacketWrite) -> Result<Option<PacketRecord>, CoreError> {
        let mut tx = self.pool.begin().await?;

        // The UPDATE comes first so the transaction takes the write lock
        // before anything else is read or written.
        let updated = sqlx::query(
            r#"
            UPDATE calls
            SET expected_sequence = ?1,
                missing_sequences = ?2,
                total_packets = total_packets + 1,
                version = version + 1,
                updated_at = ?3
            WHERE external_id = ?4
              AND version = ?5
            "#,
        )
        .bind(write.state.expected_sequence)
        .bind(write.state.missing.to_string())
        .bind(write.received_at)
        .bind(&write.call_id)
        .bind(write.observed_version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO packets (call_id, sequence, payload, client_timestamp, received_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&write.call_id)
        .bind(write.sequence)
        .bind(&write.payload)
        .bind(write.client_timestamp)
        .bind(write.received_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(PacketRecord {
            id: inserted.last_insert_rowid(),
            call_id: write.call_id.clone(),
            sequence: write.sequence,
            payload: write.payload.clone(),
            client_timestamp: write.client_timestamp,
            received_at: write.received_at,
        }))
    }

    async fn packets_for_call(&self, external_id: &str) -> Result<Vec<PacketRecord>, CoreError> {
        let packets = sqlx::query_as::<_, PacketRecord>(
            r#"
            SELECT id, call_id, sequence, payload, client_timestamp, received_at
            FROM packets
            WHERE call_id = ?
            ORDER BY sequence ASC, id ASC
            "#,
        )
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(packets)
    }

    async fn count_packets(&self, external_id: &str) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM packets WHERE call_id = ?")
            .bind(external_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0)
    }

    async fn apply_transition(
        &self,
        external_id: &str,
        transition: &Transition,
        error_message: Option<&str>,
    ) -> Result<bool, CoreError> {
        if transition.to() == CallStatus::ProcessingEnrichment && !transition.is_noop() {
            return Ok(self.claim_call(external_id, transition).await?.is_some());
        }

        let now = Utc::now();
        let completed_at = transition.enters_completed().then_some(now);
        let error_message = error_message.filter(|_| transition.enters_failed());

        let result = sqlx::query(
            r#"
            UPDATE calls
            SET status = ?1,
                updated_at = ?2,
                completed_at = COALESCE(?3, completed_at),
                error_message = COALESCE(?4, error_message),
                version = version + 1
            WHERE external_id = ?5
              AND status = ?6
            "#,
        )
        .bind(transition.to().as_str())
        .bind(now)
        .bind(completed_at)
        .bind(error_message)
        .bind(external_id)
        .bind(transition.from().as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_call(
        &self,
        external_id: &str,
        transition: &Transition,
    ) -> Result<Option<i64>, CoreError> {
        if transition.to() != CallStatus::ProcessingEnrichment || transition.is_noop() {
            return Err(CoreError::InvalidTransition {
                call_id: external_id.to_string(),
                from: transition.from(),
                to: transition.to(),
            });
        }

        // An enriched call back in Completed is never claimed again
        let claim: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE calls
            SET status = ?1,
                updated_at = ?2,
                claim_generation = claim_generation + 1,
                version = version + 1
            WHERE external_id = ?3
              AND status = ?4
              AND enriched_at IS NULL
            RETURNING claim_generation
            "#,
        )
        .bind(transition.to().as_str())
        .bind(Utc::now())
        .bind(external_id)
        .bind(transition.from().as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(claim.map(|(generation,)| generation))
    }

    async fn touch_claim(&self, external_id: &str, claim: i64) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE calls
            SET updated_at = ?1
            WHERE external_id = ?2
              AND status = 'processing_enrichment'
              AND claim_generation = ?3
            "#,
        )
        .bind(Utc::now())
        .bind(external_id)
        .bind(claim)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_claim(
        &self,
        external_id: &str,
        claim: i64,
        transition: &Transition,
        error_message: Option<&str>,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        let completed_at = transition.enters_completed().then_some(now);
        let error_message = error_message.filter(|_| transition.enters_failed());

        let result = sqlx::query(
            r#"
            UPDATE calls
            SET status = ?1,
                updated_at = ?2,
                completed_at = COALESCE(?3, completed_at),
                error_message = COALESCE(?4, error_message),
                version = version + 1
            WHERE external_id = ?5
              AND status = ?6
              AND claim_generation = ?7
            "#,
        )
        .bind(transition.to().as_str())
        .bind(now)
        .bind(completed_at)
        .bind(error_message)
        .bind(external_id)
        .bind(transition.from().as_str())
        .bind(claim)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_enrichment(
        &self,
        external_id: &str,
        claim: i64,
        transition: &Transition,
        update: &EnrichmentUpdate,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        let completed_at = transition.enters_completed().then_some(now);

        let (transcription, sentiment, enriched_at, attempts, error_message) = match update {
            EnrichmentUpdate::Enriched {
                transcription,
                sentiment,
                attempts,
                enriched_at,
            } => (
                Some(transcription.as_str()),
                Some(sentiment.as_str()),
                Some(*enriched_at),
                *attempts,
                None,
            ),
            EnrichmentUpdate::Failed {
                attempts,
                error_message,
            } => (None, None, None, *attempts, Some(error_message.as_str())),
        };
        let error_message = error_message.filter(|_| transition.enters_failed());

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE calls
            SET status = ?1,
                updated_at = ?2,
                completed_at = COALESCE(?3, completed_at),
                transcription = COALESCE(?4, transcription),
                sentiment = COALESCE(?5, sentiment),
                enriched_at = COALESCE(?6, enriched_at),
                enrichment_attempts = enrichment_attempts + ?7,
                error_message = COALESCE(?8, error_message),
                version = version + 1
            WHERE external_id = ?9
              AND status = ?10
              AND claim_generation = ?11
            "#,
        )
        .bind(transition.to().as_str())
        .bind(now)
        .bind(completed_at)
        .bind(transcription)
        .bind(sentiment)
        .bind(enriched_at)
        .bind(i64::from(attempts))
        .bind(error_message)
        .bind(external_id)
        .bind(transition.from().as_str())
        .bind(claim)
        .execute(&mut *tx)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            sqlx::query(
                "UPDATE calls SET enrichment_attempts = enrichment_attempts + ?1 WHERE external_id = ?2",
            )
            .bind(i64::from(attempts))
            .bind(external_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(applied)
    }

    async fn record_attempts(&self, external_id: &str, attempts: u32) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE calls SET enrichment_attempts = enrichment_attempts + ?1 WHERE external_id = ?2",
        )
        .bind(i64::from(attempts))
        .bind(external_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        let _: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{MissingSequences, SequenceState};
    use crate::state_machine::CallStateMachine;
    use uuid::Uuid;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    async fn new_call(persistence: &SqlitePersistence) -> CallRecord {
        let call_id = Uuid::new_v4().to_string();
        let (call, created) = persistence
            .create_call_if_absent(&call_id)
            .await
            .expect("Failed to create call");
        assert!(created);
        call
    }

    fn packet_write(call: &CallRecord, sequence: i64, state: SequenceState) -> PacketWrite {
        PacketWrite {
            call_id: call.external_id.clone(),
            observed_version: call.version,
            state,
            sequence,
            payload: format!("packet_{}", sequence),
            client_timestamp: 1_738_512_345.0 + sequence as f64,
            received_at: Utc::now(),
        }
    }

    async fn move_to(persistence: &SqlitePersistence, call_id: &str, path: &[CallStatus]) {
        let mut current = persistence.get_call(call_id).await.unwrap().unwrap().status;
        for &next in path {
            let t = CallStateMachine::transition(call_id, current, next).unwrap();
            assert!(persistence.apply_transition(call_id, &t, None).await.unwrap());
            current = next;
        }
    }

    async fn claim(persistence: &SqlitePersistence, call_id: &str) -> i64 {
        let t = CallStateMachine::transition(
            call_id,
            CallStatus::Completed,
            CallStatus::ProcessingEnrichment,
        )
        .unwrap();
        persistence
            .claim_call(call_id, &t)
            .await
            .unwrap()
            .expect("Call should be claimable")
    }

    #[tokio::test]
    async fn test_create_call_is_idempotent() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let call = new_call(&persistence).await;

        assert_eq!(call.status, CallStatus::InProgress);
        assert_eq!(call.expected_sequence, 0);
        assert_eq!(call.total_packets, 0);
        assert!(call.missing_sequences.is_empty());
        assert_eq!(call.enrichment_attempts, 0);

        let (again, created) = persistence
            .create_call_if_absent(&call.external_id)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.created_at, call.created_at);
    }

    #[tokio::test]
    async fn test_get_missing_call() {
        let persistence = SqlitePersistence::new(test_pool().await);
        assert!(persistence.get_call("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_packet_updates_call_and_stores_packet() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let call = new_call(&persistence).await;

        let state = SequenceState {
            expected_sequence: 4,
            missing: [0, 1, 2].into_iter().collect(),
        };
        let packet = persistence
            .append_packet(&packet_write(&call, 3, state))
            .await
            .unwrap()
            .expect("Version should match");

        assert_eq!(packet.sequence, 3);
        assert_eq!(packet.payload, "packet_3");

        let call = persistence
            .get_call(&call.external_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(call.expected_sequence, 4);
        assert_eq!(call.total_packets, 1);
        assert_eq!(call.missing_sequences.to_vec(), vec![0, 1, 2]);
        assert_eq!(call.version, 1);
        assert_eq!(persistence.count_packets(&call.external_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_packet_with_stale_version_writes_nothing() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let stale = new_call(&persistence).await;

        let first = SequenceState {
            expected_sequence: 1,
            missing: MissingSequences::new(),
        };
        assert!(
            persistence
                .append_packet(&packet_write(&stale, 0, first.clone()))
                .await
                .unwrap()
                .is_some()
        );

        // Same observed version again: must lose
        let result = persistence
            .append_packet(&packet_write(&stale, 0, first))
            .await
            .unwrap();
        assert!(result.is_none());

        let call = persistence
            .get_call(&stale.external_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(call.total_packets, 1);
        assert_eq!(persistence.count_packets(&call.external_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_packets_ordered_by_sequence_then_arrival() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let mut call = new_call(&persistence).await;

        for seq in [2, 0, 1, 0] {
            let mut write = packet_write(&call, seq, call.sequence_state());
            write.payload = format!("p{}-{}", seq, call.total_packets);
            persistence.append_packet(&write).await.unwrap().unwrap();
            call = persistence
                .get_call(&call.external_id)
                .await
                .unwrap()
                .unwrap();
        }

        let payloads: Vec<_> = persistence
            .packets_for_call(&call.external_id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.payload)
            .collect();
        assert_eq!(payloads, vec!["p0-1", "p0-3", "p1-2", "p2-0"]);
    }

    #[tokio::test]
    async fn test_apply_transition_is_conditional() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let call = new_call(&persistence).await;
        let id = call.external_id.as_str();

        let complete =
            CallStateMachine::transition(id, CallStatus::InProgress, CallStatus::Completed)
                .unwrap();
        assert!(persistence.apply_transition(id, &complete, None).await.unwrap());

        // Second attempt observed InProgress, which is no longer true
        assert!(!persistence.apply_transition(id, &complete, None).await.unwrap());

        let call = persistence.get_call(id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert!(call.completed_at.is_some());
        assert!(call.error_message.is_none());
    }

    #[tokio::test]
    async fn test_error_message_only_recorded_when_entering_failed() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let call = new_call(&persistence).await;
        let id = call.external_id.as_str();

        let complete =
            CallStateMachine::transition(id, CallStatus::InProgress, CallStatus::Completed)
                .unwrap();
        persistence
            .apply_transition(id, &complete, Some("ignored"))
            .await
            .unwrap();
        assert!(
            persistence
                .get_call(id)
                .await
                .unwrap()
                .unwrap()
                .error_message
                .is_none()
        );

        move_to(&persistence, id, &[CallStatus::ProcessingEnrichment]).await;
        let fail = CallStateMachine::transition(
            id,
            CallStatus::ProcessingEnrichment,
            CallStatus::Failed,
        )
        .unwrap();
        persistence
            .apply_transition(id, &fail, Some("provider down"))
            .await
            .unwrap();

        let call = persistence.get_call(id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Failed);
        assert_eq!(call.error_message.as_deref(), Some("provider down"));
    }

    #[tokio::test]
    async fn test_finish_enrichment_success() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let call = new_call(&persistence).await;
        let id = call.external_id.as_str();
        move_to(&persistence, id, &[CallStatus::Completed]).await;
        let generation = claim(&persistence, id).await;
        assert_eq!(generation, 1);

        let done = CallStateMachine::transition(
            id,
            CallStatus::ProcessingEnrichment,
            CallStatus::Completed,
        )
        .unwrap();
        let applied = persistence
            .finish_enrichment(
                id,
                generation,
                &done,
                &EnrichmentUpdate::Enriched {
                    transcription: "hello".to_string(),
                    sentiment: "positive".to_string(),
                    attempts: 2,
                    enriched_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(applied);

        let call = persistence.get_call(id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert_eq!(call.transcription.as_deref(), Some("hello"));
        assert_eq!(call.sentiment.as_deref(), Some("positive"));
        assert_eq!(call.enrichment_attempts, 2);
        assert!(call.enriched_at.is_some());

        // Enriched calls are no longer eligible
        assert!(
            persistence
                .calls_awaiting_enrichment(10)
                .await
                .unwrap()
                .is_empty()
        );

        // ...and cannot be claimed from a stale snapshot
        let claim = CallStateMachine::transition(
            id,
            CallStatus::Completed,
            CallStatus::ProcessingEnrichment,
        )
        .unwrap();
        assert!(persistence.claim_call(id, &claim).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_enrichment_failure_skipped_when_claim_lost() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let call = new_call(&persistence).await;
        let id = call.external_id.as_str();
        move_to(&persistence, id, &[CallStatus::Completed]).await;
        let generation = claim(&persistence, id).await;
        move_to(&persistence, id, &[CallStatus::Archived]).await;

        let fail = CallStateMachine::transition(
            id,
            CallStatus::ProcessingEnrichment,
            CallStatus::Failed,
        )
        .unwrap();
        let applied = persistence
            .finish_enrichment(
                id,
                generation,
                &fail,
                &EnrichmentUpdate::Failed {
                    attempts: 5,
                    error_message: "gave up".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(!applied);

        // Status untouched, but the provider calls still count
        let call = persistence.get_call(id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Archived);
        assert!(call.error_message.is_none());
        assert_eq!(call.enrichment_attempts, 5);
    }

    #[tokio::test]
    async fn test_superseded_claim_is_fenced() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let call = new_call(&persistence).await;
        let id = call.external_id.as_str();
        move_to(&persistence, id, &[CallStatus::Completed]).await;

        let first = claim(&persistence, id).await;
        let release = CallStateMachine::transition(
            id,
            CallStatus::ProcessingEnrichment,
            CallStatus::Completed,
        )
        .unwrap();
        assert!(persistence.release_claim(id, first, &release, None).await.unwrap());
        let second = claim(&persistence, id).await;
        assert_eq!(second, first + 1);

        // The first holder can neither refresh nor release nor finish
        assert!(!persistence.touch_claim(id, first).await.unwrap());
        assert!(!persistence.release_claim(id, first, &release, None).await.unwrap());
        let applied = persistence
            .finish_enrichment(
                id,
                first,
                &release,
                &EnrichmentUpdate::Enriched {
                    transcription: "stale".to_string(),
                    sentiment: "negative".to_string(),
                    attempts: 2,
                    enriched_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(!applied);

        let call = persistence.get_call(id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::ProcessingEnrichment);
        assert_eq!(call.claim_generation, second);
        assert!(call.transcription.is_none());
        assert!(call.enriched_at.is_none());
        assert_eq!(call.enrichment_attempts, 2);

        // The current holder still owns it
        assert!(persistence.touch_claim(id, second).await.unwrap());
        persistence.record_attempts(id, 1).await.unwrap();
        let applied = persistence
            .finish_enrichment(
                id,
                second,
                &release,
                &EnrichmentUpdate::Enriched {
                    transcription: "fresh".to_string(),
                    sentiment: "positive".to_string(),
                    attempts: 1,
                    enriched_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(applied);

        let call = persistence.get_call(id).await.unwrap().unwrap();
        assert_eq!(call.transcription.as_deref(), Some("fresh"));
        assert_eq!(call.enrichment_attempts, 4);
    }

    #[tokio::test]
    async fn test_claim_call_rejects_other_targets() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let call = new_call(&persistence).await;
        let id = call.external_id.as_str();

        let complete =
            CallStateMachine::transition(id, CallStatus::InProgress, CallStatus::Completed)
                .unwrap();
        let err = persistence.claim_call(id, &complete).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn test_list_calls_filter_and_limit() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let a = new_call(&persistence).await;
        let b = new_call(&persistence).await;
        let c = new_call(&persistence).await;
        move_to(&persistence, &b.external_id, &[CallStatus::Completed]).await;

        let all = persistence.list_calls(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        // b was updated last
        assert_eq!(all[0].external_id, b.external_id);

        let completed = persistence
            .list_calls(Some(CallStatus::Completed), 10)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].external_id, b.external_id);

        let limited = persistence.list_calls(None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        let in_progress: Vec<_> = persistence
            .list_calls(Some(CallStatus::InProgress), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.external_id)
            .collect();
        assert!(in_progress.contains(&a.external_id));
        assert!(in_progress.contains(&c.external_id));
    }

    #[tokio::test]
    async fn test_stale_claims() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let old = new_call(&persistence).await;
        let fresh = new_call(&persistence).await;
        for call in [&old, &fresh] {
            move_to(
                &persistence,
                &call.external_id,
                &[CallStatus::Completed, CallStatus::ProcessingEnrichment],
            )
            .await;
        }

        sqlx::query("UPDATE calls SET updated_at = ? WHERE external_id = ?")
            .bind(Utc::now() - chrono::Duration::minutes(10))
            .bind(&old.external_id)
            .execute(persistence.pool())
            .await
            .unwrap();

        let stale = persistence
            .stale_claims(Utc::now() - chrono::Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].external_id, old.external_id);
    }

    #[tokio::test]
    async fn test_unreadable_missing_sequences_is_corrupt_record() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let call = new_call(&persistence).await;

        sqlx::query("UPDATE calls SET missing_sequences = '1,x' WHERE external_id = ?")
            .bind(&call.external_id)
            .execute(persistence.pool())
            .await
            .unwrap();

        let err = persistence.get_call(&call.external_id).await.unwrap_err();
        assert_eq!(err.error_code(), "CORRUPT_RECORD");
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("calls.db");

        let persistence = SqlitePersistence::from_path(&path)
            .await
            .expect("Failed to open file database");
        persistence.health_check().await.unwrap();
        let (call, _) = persistence.create_call_if_absent("CALL-FILE").await.unwrap();
        assert_eq!(call.external_id, "CALL-FILE");
        assert!(path.exists());

        persistence.pool().close().await;
        let reopened = SqlitePersistence::from_path(&path).await.unwrap();
        assert!(reopened.get_call("CALL-FILE").await.unwrap().is_some());
    }
}
