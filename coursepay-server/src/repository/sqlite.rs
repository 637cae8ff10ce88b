//! SQLite implementation of `Repository`.
//!
//! Durable storage that survives service restarts. Uses a
//! `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`; all
//! operations run inside `tokio::task::spawn_blocking` so the async
//! runtime is never blocked on storage I/O.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema
//! versions. When the schema changes, increment `SCHEMA_VERSION` and add a
//! migration function in `run_migrations`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::warn;
use uuid::Uuid;

use super::{
    ActivationOutcome, CommitEffects, CommitReceipt, DeadLetterRecord, EnrollmentRecord,
    EventClaim, EventStatus, IngestOutcome, NewEvent, Repository, RepositoryError, StoredEvent,
    TransactionRecord,
};
use crate::state_machine::state::{
    ChargeId, CourseId, PaymentIntent, PaymentState, ProviderEventId, ProviderIntentId, UserId,
};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed repository.
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open or create the database file at the given path.
    ///
    /// The database is configured with `journal_mode = WAL`,
    /// `synchronous = FULL` and a busy timeout; WAL must actually engage
    /// or the open fails, because the durability guarantees of the dedup
    /// gate depend on it.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy().to_string();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // The database holds raw webhook payloads; keep it private.
        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!("Failed to set restrictive permissions on database file: {}", e);
            }
        }

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!("expected WAL, SQLite returned '{}'", journal_mode),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    /// In-memory database (for tests).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    fn init_schema(&self) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|e| RepositoryError::storage("read schema version", e.to_string()))?;

        if current_version > SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "check schema version",
                format!(
                    "database schema version {} is newer than supported version {}",
                    current_version, SCHEMA_VERSION
                ),
            ));
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), RepositoryError> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<(), RepositoryError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                provider_event_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                received_at TEXT NOT NULL,
                processed_at TEXT,
                status TEXT NOT NULL CHECK(status IN (
                    'received', 'processing', 'applied', 'rejected'
                ))
            );

            CREATE INDEX IF NOT EXISTS idx_events_received
            ON webhook_events(received_at)
            WHERE status = 'received';

            CREATE TABLE IF NOT EXISTS payment_intents (
                id TEXT PRIMARY KEY,
                provider_intent_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                course_id TEXT NOT NULL,
                amount_minor INTEGER NOT NULL,
                currency TEXT NOT NULL,
                state TEXT NOT NULL CHECK(state IN (
                    'pending', 'processing', 'completed', 'failed', 'requires_action'
                )),
                charge_id TEXT,
                failure_reason TEXT,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                paid_at TEXT
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                payment_intent_id TEXT NOT NULL,
                charge_id TEXT NOT NULL,
                amount_minor INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(payment_intent_id, charge_id)
            );

            CREATE TABLE IF NOT EXISTS enrollments (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                course_id TEXT NOT NULL,
                payment_intent_id TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, course_id)
            );

            CREATE TABLE IF NOT EXISTS dead_letters (
                provider_event_id TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| {
            RepositoryError::storage("create initial schema (v0 -> v1)", e.to_string())
        })?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| RepositoryError::storage("parse timestamp", format!("{}: {}", s, e)))
}

fn state_from_columns(
    state: &str,
    charge_id: Option<String>,
    failure_reason: Option<String>,
    paid_at: Option<String>,
) -> Result<PaymentState, RepositoryError> {
    match state {
        "pending" => Ok(PaymentState::Pending),
        "processing" => Ok(PaymentState::Processing),
        "requires_action" => Ok(PaymentState::RequiresAction),
        "completed" => {
            let charge_id = charge_id.ok_or_else(|| {
                RepositoryError::storage("load intent", "completed row without charge_id")
            })?;
            let paid_at = paid_at.ok_or_else(|| {
                RepositoryError::storage("load intent", "completed row without paid_at")
            })?;
            Ok(PaymentState::Completed {
                charge_id: ChargeId(charge_id),
                paid_at: parse_ts(&paid_at)?,
            })
        }
        "failed" => Ok(PaymentState::Failed {
            reason: failure_reason.unwrap_or_default(),
        }),
        other => Err(RepositoryError::storage(
            "load intent",
            format!("unknown state '{}'", other),
        )),
    }
}

fn intent_from_row(row: &rusqlite::Row<'_>) -> Result<PaymentIntent, rusqlite::Error> {
    // Column order matches SELECT_INTENT_COLUMNS. State reassembly errors
    // surface as FromSql conversion failures.
    let id: String = row.get(0)?;
    let provider_intent_id: String = row.get(1)?;
    let user_id: String = row.get(2)?;
    let course_id: String = row.get(3)?;
    let amount_minor: i64 = row.get(4)?;
    let currency: String = row.get(5)?;
    let state: String = row.get(6)?;
    let charge_id: Option<String> = row.get(7)?;
    let failure_reason: Option<String> = row.get(8)?;
    let version: i64 = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    let paid_at: Option<String> = row.get(12)?;

    let invalid = |message: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            message.into(),
        )
    };

    Ok(PaymentIntent {
        id: Uuid::parse_str(&id).map_err(|e| invalid(e.to_string()))?,
        provider_intent_id: ProviderIntentId(provider_intent_id),
        user_id: UserId(user_id),
        course_id: CourseId(course_id),
        amount_minor,
        currency,
        state: state_from_columns(&state, charge_id, failure_reason, paid_at)
            .map_err(|e| invalid(e.to_string()))?,
        version: version as u64,
        created_at: parse_ts(&created_at).map_err(|e| invalid(e.to_string()))?,
        updated_at: parse_ts(&updated_at).map_err(|e| invalid(e.to_string()))?,
    })
}

const SELECT_INTENT_COLUMNS: &str = "id, provider_intent_id, user_id, course_id, amount_minor, \
     currency, state, charge_id, failure_reason, version, created_at, updated_at, paid_at";

fn event_from_row(row: &rusqlite::Row<'_>) -> Result<StoredEvent, rusqlite::Error> {
    let provider_event_id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let payload: String = row.get(2)?;
    let payload_hash: String = row.get(3)?;
    let received_at: String = row.get(4)?;
    let processed_at: Option<String> = row.get(5)?;
    let status: String = row.get(6)?;

    let invalid = |message: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            message.into(),
        )
    };

    Ok(StoredEvent {
        provider_event_id: ProviderEventId(provider_event_id),
        kind,
        payload,
        payload_hash,
        received_at: parse_ts(&received_at).map_err(|e| invalid(e.to_string()))?,
        processed_at: match processed_at {
            Some(s) => Some(parse_ts(&s).map_err(|e| invalid(e.to_string()))?),
            None => None,
        },
        status: EventStatus::parse(&status)
            .ok_or_else(|| invalid(format!("unknown event status '{}'", status)))?,
    })
}

fn set_event_status(
    conn: &Mutex<Connection>,
    id: &ProviderEventId,
    status: EventStatus,
    processed: bool,
    op: &'static str,
) -> Result<(), RepositoryError> {
    let conn = conn.lock().expect("mutex poisoned");
    let processed_at = processed.then(|| Utc::now().to_rfc3339());
    conn.execute(
        "UPDATE webhook_events SET status = ?1, processed_at = ?2 WHERE provider_event_id = ?3",
        params![status.name(), processed_at, id.0],
    )
    .map_err(|e| RepositoryError::storage(op, e.to_string()))?;
    Ok(())
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn ingest_event(&self, event: NewEvent) -> Result<IngestOutcome, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            // Atomic INSERT OR IGNORE avoids the read-then-insert race: if
            // two deliveries both see "missing", the loser's insert is
            // silently ignored and detected via changes() == 0.
            conn.execute(
                "INSERT OR IGNORE INTO webhook_events \
                 (provider_event_id, kind, payload, payload_hash, received_at, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'received')",
                params![
                    event.provider_event_id.0,
                    event.kind,
                    event.payload,
                    event.payload_hash,
                    event.received_at.to_rfc3339(),
                ],
            )
            .map_err(|e| RepositoryError::storage("ingest_event", e.to_string()))?;

            if conn.changes() > 0 {
                return Ok(IngestOutcome::Fresh);
            }

            let status: String = conn
                .query_row(
                    "SELECT status FROM webhook_events WHERE provider_event_id = ?1",
                    params![event.provider_event_id.0],
                    |row| row.get(0),
                )
                .map_err(|e| RepositoryError::storage("ingest_event", e.to_string()))?;

            match EventStatus::parse(&status) {
                Some(EventStatus::Received) | Some(EventStatus::Processing) => {
                    Ok(IngestOutcome::AlreadyInFlight)
                }
                Some(EventStatus::Applied) | Some(EventStatus::Rejected) => {
                    Ok(IngestOutcome::AlreadyProcessed)
                }
                None => Err(RepositoryError::storage(
                    "ingest_event",
                    format!("unknown event status '{}'", status),
                )),
            }
        })
        .await
        .map_err(|e| RepositoryError::storage("ingest_event", e.to_string()))?
    }

    async fn load_event(
        &self,
        id: &ProviderEventId,
    ) -> Result<Option<StoredEvent>, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.query_row(
                "SELECT provider_event_id, kind, payload, payload_hash, received_at, \
                 processed_at, status FROM webhook_events WHERE provider_event_id = ?1",
                params![id.0],
                event_from_row,
            )
            .optional()
            .map_err(|e| RepositoryError::storage("load_event", e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage("load_event", e.to_string()))?
    }

    async fn claim_event(&self, id: &ProviderEventId) -> Result<EventClaim, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE webhook_events SET status = 'processing' \
                 WHERE provider_event_id = ?1 AND status = 'received'",
                params![id.0],
            )
            .map_err(|e| RepositoryError::storage("claim_event", e.to_string()))?;

            if conn.changes() > 0 {
                return Ok(EventClaim::Claimed);
            }

            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM webhook_events WHERE provider_event_id = ?1",
                    params![id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("claim_event", e.to_string()))?;

            Ok(match status.as_deref() {
                Some("processing") => EventClaim::Busy,
                _ => EventClaim::Done,
            })
        })
        .await
        .map_err(|e| RepositoryError::storage("claim_event", e.to_string()))?
    }

    async fn release_event(&self, id: &ProviderEventId) -> Result<(), RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE webhook_events SET status = 'received' \
                 WHERE provider_event_id = ?1 AND status = 'processing'",
                params![id.0],
            )
            .map_err(|e| RepositoryError::storage("release_event", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("release_event", e.to_string()))?
    }

    async fn mark_event_applied(&self, id: &ProviderEventId) -> Result<(), RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            set_event_status(&conn, &id, EventStatus::Applied, true, "mark_event_applied")
        })
        .await
        .map_err(|e| RepositoryError::storage("mark_event_applied", e.to_string()))?
    }

    async fn mark_event_rejected(&self, id: &ProviderEventId) -> Result<(), RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            set_event_status(
                &conn,
                &id,
                EventStatus::Rejected,
                true,
                "mark_event_rejected",
            )
        })
        .await
        .map_err(|e| RepositoryError::storage("mark_event_rejected", e.to_string()))?
    }

    async fn stale_received_events(
        &self,
        older_than_secs: i64,
    ) -> Result<Vec<ProviderEventId>, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let cutoff = (Utc::now() - Duration::seconds(older_than_secs)).to_rfc3339();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT provider_event_id FROM webhook_events \
                     WHERE status = 'received' AND received_at <= ?1",
                )
                .map_err(|e| RepositoryError::storage("stale_received_events", e.to_string()))?;
            let rows = stmt
                .query_map(params![cutoff], |row| {
                    row.get::<_, String>(0).map(ProviderEventId)
                })
                .map_err(|e| RepositoryError::storage("stale_received_events", e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| RepositoryError::storage("stale_received_events", e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage("stale_received_events", e.to_string()))?
    }

    async fn release_in_flight_events(&self) -> Result<usize, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE webhook_events SET status = 'received' WHERE status = 'processing'",
                [],
            )
            .map_err(|e| RepositoryError::storage("release_in_flight_events", e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage("release_in_flight_events", e.to_string()))?
    }

    async fn find_intent(
        &self,
        id: &ProviderIntentId,
    ) -> Result<Option<PaymentIntent>, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.query_row(
                &format!(
                    "SELECT {} FROM payment_intents WHERE provider_intent_id = ?1",
                    SELECT_INTENT_COLUMNS
                ),
                params![id.0],
                intent_from_row,
            )
            .optional()
            .map_err(|e| RepositoryError::storage("find_intent", e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage("find_intent", e.to_string()))?
    }

    async fn find_or_create_intent(
        &self,
        intent: PaymentIntent,
    ) -> Result<PaymentIntent, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT OR IGNORE INTO payment_intents \
                 (id, provider_intent_id, user_id, course_id, amount_minor, currency, \
                  state, version, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    intent.id.to_string(),
                    intent.provider_intent_id.0,
                    intent.user_id.0,
                    intent.course_id.0,
                    intent.amount_minor,
                    intent.currency,
                    intent.state.name(),
                    intent.version as i64,
                    intent.created_at.to_rfc3339(),
                    intent.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| RepositoryError::storage("find_or_create_intent", e.to_string()))?;

            conn.query_row(
                &format!(
                    "SELECT {} FROM payment_intents WHERE provider_intent_id = ?1",
                    SELECT_INTENT_COLUMNS
                ),
                params![intent.provider_intent_id.0],
                intent_from_row,
            )
            .map_err(|e| RepositoryError::storage("find_or_create_intent", e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage("find_or_create_intent", e.to_string()))?
    }

    async fn commit_transition(
        &self,
        expected_version: u64,
        updated: PaymentIntent,
        effects: CommitEffects,
    ) -> Result<CommitReceipt, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("mutex poisoned");
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| RepositoryError::storage("commit_transition", e.to_string()))?;

            let (charge_id, failure_reason, paid_at) = match &updated.state {
                PaymentState::Completed { charge_id, paid_at } => {
                    (Some(charge_id.0.clone()), None, Some(paid_at.to_rfc3339()))
                }
                PaymentState::Failed { reason } => (None, Some(reason.clone()), None),
                _ => (None, None, None),
            };

            // Version compare-and-swap: the WHERE clause is the optimistic
            // lock. Zero updated rows means a concurrent writer won.
            let changes = tx
                .execute(
                    "UPDATE payment_intents \
                     SET state = ?1, charge_id = ?2, failure_reason = ?3, version = ?4, \
                         updated_at = ?5, paid_at = ?6 \
                     WHERE provider_intent_id = ?7 AND version = ?8",
                    params![
                        updated.state.name(),
                        charge_id,
                        failure_reason,
                        (expected_version + 1) as i64,
                        updated.updated_at.to_rfc3339(),
                        paid_at,
                        updated.provider_intent_id.0,
                        expected_version as i64,
                    ],
                )
                .map_err(|e| RepositoryError::storage("commit_transition", e.to_string()))?;

            if changes == 0 {
                // Dropping the transaction rolls back.
                return Err(RepositoryError::conflict("payment_intent"));
            }

            if let Some(transaction) = &effects.transaction {
                tx.execute(
                    "INSERT OR IGNORE INTO transactions \
                     (id, payment_intent_id, charge_id, amount_minor, status, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        transaction.id.to_string(),
                        transaction.payment_intent_id.to_string(),
                        transaction.charge_id.0,
                        transaction.amount_minor,
                        transaction.status,
                        transaction.created_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| RepositoryError::storage("commit_transition", e.to_string()))?;
            }

            let mut receipt = CommitReceipt::default();
            if let Some((user_id, course_id)) = &effects.enrollment {
                tx.execute(
                    "INSERT OR IGNORE INTO enrollments \
                     (id, user_id, course_id, payment_intent_id, status, created_at) \
                     VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
                    params![
                        Uuid::new_v4().to_string(),
                        user_id.0,
                        course_id.0,
                        updated.id.to_string(),
                        Utc::now().to_rfc3339(),
                    ],
                )
                .map_err(|e| RepositoryError::storage("commit_transition", e.to_string()))?;
                receipt.enrollment = Some(if tx.changes() > 0 {
                    ActivationOutcome::Created
                } else {
                    ActivationOutcome::AlreadyEnrolled
                });
            }

            tx.commit()
                .map_err(|e| RepositoryError::storage("commit_transition", e.to_string()))?;
            Ok(receipt)
        })
        .await
        .map_err(|e| RepositoryError::storage("commit_transition", e.to_string()))?
    }

    async fn activate_enrollment(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
        payment_intent_id: Option<Uuid>,
    ) -> Result<ActivationOutcome, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let user_id = user_id.clone();
        let course_id = course_id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT OR IGNORE INTO enrollments \
                 (id, user_id, course_id, payment_intent_id, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    user_id.0,
                    course_id.0,
                    payment_intent_id.map(|id| id.to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| RepositoryError::storage("activate_enrollment", e.to_string()))?;

            Ok(if conn.changes() > 0 {
                ActivationOutcome::Created
            } else {
                ActivationOutcome::AlreadyEnrolled
            })
        })
        .await
        .map_err(|e| RepositoryError::storage("activate_enrollment", e.to_string()))?
    }

    async fn find_enrollment(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
    ) -> Result<Option<EnrollmentRecord>, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let user_id = user_id.clone();
        let course_id = course_id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.query_row(
                "SELECT id, user_id, course_id, payment_intent_id, status, created_at \
                 FROM enrollments WHERE user_id = ?1 AND course_id = ?2",
                params![user_id.0, course_id.0],
                |row| {
                    let id: String = row.get(0)?;
                    let user_id: String = row.get(1)?;
                    let course_id: String = row.get(2)?;
                    let payment_intent_id: Option<String> = row.get(3)?;
                    let status: String = row.get(4)?;
                    let created_at: String = row.get(5)?;
                    let invalid = |message: String| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            message.into(),
                        )
                    };
                    Ok(EnrollmentRecord {
                        id: Uuid::parse_str(&id).map_err(|e| invalid(e.to_string()))?,
                        user_id: UserId(user_id),
                        course_id: CourseId(course_id),
                        payment_intent_id: match payment_intent_id {
                            Some(s) => {
                                Some(Uuid::parse_str(&s).map_err(|e| invalid(e.to_string()))?)
                            }
                            None => None,
                        },
                        status,
                        created_at: parse_ts(&created_at).map_err(|e| invalid(e.to_string()))?,
                    })
                },
            )
            .optional()
            .map_err(|e| RepositoryError::storage("find_enrollment", e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage("find_enrollment", e.to_string()))?
    }

    async fn transactions_for_intent(
        &self,
        payment_intent_id: Uuid,
    ) -> Result<Vec<TransactionRecord>, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT id, payment_intent_id, charge_id, amount_minor, status, created_at \
                     FROM transactions WHERE payment_intent_id = ?1 ORDER BY created_at",
                )
                .map_err(|e| RepositoryError::storage("transactions_for_intent", e.to_string()))?;
            let rows = stmt
                .query_map(params![payment_intent_id.to_string()], |row| {
                    let id: String = row.get(0)?;
                    let intent_id: String = row.get(1)?;
                    let charge_id: String = row.get(2)?;
                    let amount_minor: i64 = row.get(3)?;
                    let status: String = row.get(4)?;
                    let created_at: String = row.get(5)?;
                    let invalid = |message: String| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            message.into(),
                        )
                    };
                    Ok(TransactionRecord {
                        id: Uuid::parse_str(&id).map_err(|e| invalid(e.to_string()))?,
                        payment_intent_id: Uuid::parse_str(&intent_id)
                            .map_err(|e| invalid(e.to_string()))?,
                        charge_id: ChargeId(charge_id),
                        amount_minor,
                        status,
                        created_at: parse_ts(&created_at).map_err(|e| invalid(e.to_string()))?,
                    })
                })
                .map_err(|e| RepositoryError::storage("transactions_for_intent", e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| RepositoryError::storage("transactions_for_intent", e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage("transactions_for_intent", e.to_string()))?
    }

    async fn push_dead_letter(&self, record: DeadLetterRecord) -> Result<(), RepositoryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT OR REPLACE INTO dead_letters \
                 (provider_event_id, reason, attempts, last_error, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.provider_event_id.0,
                    record.reason,
                    record.attempts,
                    record.last_error,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| RepositoryError::storage("push_dead_letter", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("push_dead_letter", e.to_string()))?
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT provider_event_id, reason, attempts, last_error, created_at \
                     FROM dead_letters ORDER BY created_at DESC",
                )
                .map_err(|e| RepositoryError::storage("list_dead_letters", e.to_string()))?;
            let rows = stmt
                .query_map([], dead_letter_from_row)
                .map_err(|e| RepositoryError::storage("list_dead_letters", e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| RepositoryError::storage("list_dead_letters", e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage("list_dead_letters", e.to_string()))?
    }

    async fn find_dead_letter(
        &self,
        id: &ProviderEventId,
    ) -> Result<Option<DeadLetterRecord>, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.query_row(
                "SELECT provider_event_id, reason, attempts, last_error, created_at \
                 FROM dead_letters WHERE provider_event_id = ?1",
                params![id.0],
                dead_letter_from_row,
            )
            .optional()
            .map_err(|e| RepositoryError::storage("find_dead_letter", e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage("find_dead_letter", e.to_string()))?
    }

    async fn requeue_dead_letter(&self, id: &ProviderEventId) -> Result<bool, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("mutex poisoned");
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| RepositoryError::storage("requeue_dead_letter", e.to_string()))?;

            let deleted = tx
                .execute(
                    "DELETE FROM dead_letters WHERE provider_event_id = ?1",
                    params![id.0],
                )
                .map_err(|e| RepositoryError::storage("requeue_dead_letter", e.to_string()))?;
            if deleted == 0 {
                return Ok(false);
            }

            tx.execute(
                "UPDATE webhook_events SET status = 'received', processed_at = NULL \
                 WHERE provider_event_id = ?1",
                params![id.0],
            )
            .map_err(|e| RepositoryError::storage("requeue_dead_letter", e.to_string()))?;

            tx.commit()
                .map_err(|e| RepositoryError::storage("requeue_dead_letter", e.to_string()))?;
            Ok(true)
        })
        .await
        .map_err(|e| RepositoryError::storage("requeue_dead_letter", e.to_string()))?
    }
}

fn dead_letter_from_row(row: &rusqlite::Row<'_>) -> Result<DeadLetterRecord, rusqlite::Error> {
    let provider_event_id: String = row.get(0)?;
    let reason: String = row.get(1)?;
    let attempts: u32 = row.get(2)?;
    let last_error: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(DeadLetterRecord {
        provider_event_id: ProviderEventId(provider_event_id),
        reason,
        attempts,
        last_error,
        created_at: parse_ts(&created_at).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.to_string().into(),
            )
        })?,
    })
}
