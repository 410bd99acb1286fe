//! Durable, TTL-aware session store.
//!
//! Single source of truth for publish-session records. Backed by SQLite
//! (bundled) behind a mutex; every mutation is a conditional write so that
//! the critical primitive, [`SessionStore::consume_nonce`], is linearizable
//! per session: of N concurrent consume attempts, at most one observes a
//! `pending-runner` row with a matching nonce.
//!
//! Expiry is a read-time classification. The store never writes an "expired"
//! status; [`SessionStore::get`] compares the row against the [`TtlPolicy`]
//! and reports [`SessionError::Expired`] (distinct from not-found) once the
//! window has elapsed. Physical deletion happens later, in
//! [`SessionStore::purge_expired`].

mod rows;
mod schema;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::SessionError;
use crate::session::{PublishSession, SessionStatus, WorkerContext};
use rows::{row_to_session, SESSION_COLUMNS};

/// Retention windows. Two TTLs are configuration, not protocol.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    /// How long a non-terminal session stays readable after its last write.
    pub active: Duration,

    /// How long a terminal session stays readable after completion.
    pub terminal_retention: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            active: Duration::hours(24),
            terminal_retention: Duration::days(7),
        }
    }
}

impl TtlPolicy {
    pub fn with_active(mut self, active: Duration) -> Self {
        self.active = active;
        self
    }

    pub fn with_terminal_retention(mut self, retention: Duration) -> Self {
        self.terminal_retention = retention;
        self
    }

    /// Instant at which the record stops being readable.
    pub fn expiry_of(&self, session: &PublishSession) -> DateTime<Utc> {
        if session.status.is_terminal() {
            session.completed_at.unwrap_or(session.updated_at) + self.terminal_retention
        } else {
            session.updated_at + self.active
        }
    }
}

/// Fields merged by a progress update. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub phase: Option<String>,
    pub message: Option<String>,
    pub progress: Option<u32>,
}

/// SQLite-backed session store.
pub struct SessionStore {
    conn: Mutex<Connection>,
    ttl: TtlPolicy,
}

const TERMINAL_GUARD: &str = "status NOT IN ('completed', 'failed', 'aborted')";

impl SessionStore {
    /// Open (creating if needed) a store at `path`.
    pub fn open(path: &Path, ttl: TtlPolicy) -> Result<Self, SessionError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, ttl)
    }

    /// In-memory store, used by tests and ephemeral dev servers.
    pub fn in_memory(ttl: TtlPolicy) -> Result<Self, SessionError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, ttl)
    }

    fn from_connection(conn: Connection, ttl: TtlPolicy) -> Result<Self, SessionError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        schema::init_schema(&conn).map_err(|e| SessionError::Storage {
            message: format!("schema init failed: {e:#}"),
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SessionError> {
        self.conn.lock().map_err(|_| SessionError::Storage {
            message: "store mutex poisoned".to_string(),
        })
    }

    /// Create a fresh `pending-runner` session with a newly generated id and
    /// single-use nonce.
    pub fn create(&self, user_id: &str) -> Result<PublishSession, SessionError> {
        let mut nonce_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut nonce_bytes);
        let now = Utc::now();

        let session = PublishSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            status: SessionStatus::PendingRunner,
            nonce: Some(hex::encode(nonce_bytes)),
            worker_context: None,
            capability_token: None,
            progress: None,
            phase: None,
            message: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (id, user_id, status, nonce, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.user_id,
                session.status.as_str(),
                session.nonce,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        drop(conn);

        tracing::info!(session_id = %session.id, user_id = %user_id, "publish session created");
        Ok(session)
    }

    /// Fetch a session, classifying aged-out records as expired.
    pub fn get(&self, id: &str) -> Result<PublishSession, SessionError> {
        let conn = self.lock()?;
        let session = Self::select(&conn, id)?;
        drop(conn);
        self.classify(session, id)
    }

    fn select(conn: &Connection, id: &str) -> Result<Option<PublishSession>, SessionError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        let session = conn
            .query_row(&sql, params![id], row_to_session)
            .optional()?;
        Ok(session)
    }

    fn classify(
        &self,
        session: Option<PublishSession>,
        id: &str,
    ) -> Result<PublishSession, SessionError> {
        let session = session.ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        let expired_at = self.ttl.expiry_of(&session);
        if expired_at <= Utc::now() {
            return Err(SessionError::Expired {
                id: id.to_string(),
                expired_at,
            });
        }
        Ok(session)
    }

    /// Atomic consume-if-matches: clear the nonce, record the attested worker
    /// context and the issued capability token, and advance the status to
    /// `runner-attested`; all in one conditional write.
    ///
    /// Of N concurrent calls for the same session, at most one succeeds; the
    /// rest observe the post-consumption state and get
    /// [`SessionError::InvalidSession`] without side effects.
    pub fn consume_nonce(
        &self,
        id: &str,
        nonce: &str,
        ctx: &WorkerContext,
        capability_token: &str,
    ) -> Result<PublishSession, SessionError> {
        let ctx_json = serde_json::to_string(ctx).map_err(|e| SessionError::Storage {
            message: format!("worker context serialization failed: {e}"),
        })?;
        let now = Utc::now();

        let conn = self.lock()?;
        // Classify not-found/expired before attempting the write; an aged-out
        // pending row must not be consumable even though it still exists.
        self.classify(Self::select(&conn, id)?, id)?;

        let changed = conn.execute(
            "UPDATE sessions
             SET nonce = NULL, status = ?3, worker_context = ?4,
                 capability_token = ?5, updated_at = ?6
             WHERE id = ?1 AND status = ?7 AND nonce = ?2",
            params![
                id,
                nonce,
                SessionStatus::RunnerAttested.as_str(),
                ctx_json,
                capability_token,
                now.to_rfc3339(),
                SessionStatus::PendingRunner.as_str(),
            ],
        )?;
        if changed != 1 {
            return Err(SessionError::InvalidSession {
                reason: "nonce mismatch or session not awaiting attestation".to_string(),
            });
        }
        let session = Self::select(&conn, id)?;
        drop(conn);
        self.classify(session, id)
    }

    /// Merge progress fields, bumping the status to `processing` on the first
    /// update. Provided fields overwrite, omitted fields persist; applying
    /// the same patch twice yields the same stored fields.
    pub fn update_progress(
        &self,
        id: &str,
        patch: &ProgressPatch,
    ) -> Result<PublishSession, SessionError> {
        let now = Utc::now();

        let conn = self.lock()?;
        let current = self.classify(Self::select(&conn, id)?, id)?;
        if current.status.is_terminal() {
            return Err(SessionError::InvalidSession {
                reason: format!("session already terminal ({})", current.status),
            });
        }

        let changed = conn.execute(
            &format!(
                "UPDATE sessions
                 SET status = ?2,
                     phase = COALESCE(?3, phase),
                     message = COALESCE(?4, message),
                     progress = COALESCE(?5, progress),
                     updated_at = ?6
                 WHERE id = ?1 AND {TERMINAL_GUARD}"
            ),
            params![
                id,
                SessionStatus::Processing.as_str(),
                patch.phase,
                patch.message,
                patch.progress,
                now.to_rfc3339(),
            ],
        )?;
        if changed != 1 {
            // Lost a race with a concurrent finalize.
            return Err(SessionError::InvalidSession {
                reason: "session already terminal".to_string(),
            });
        }
        let session = Self::select(&conn, id)?;
        drop(conn);
        self.classify(session, id)
    }

    /// Move the session to a terminal status exactly once.
    ///
    /// Returns `(record, newly_finalized)`. If the session is already
    /// terminal the stored record is returned unchanged with `false`: a
    /// repeat finalize is a no-op, never an overwrite.
    pub fn finalize(
        &self,
        id: &str,
        outcome: SessionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&serde_json::Value>,
    ) -> Result<(PublishSession, bool), SessionError> {
        debug_assert!(outcome.is_terminal());
        let now = Utc::now();

        let conn = self.lock()?;
        let current = self.classify(Self::select(&conn, id)?, id)?;
        if current.status.is_terminal() {
            return Ok((current, false));
        }

        let changed = conn.execute(
            &format!(
                "UPDATE sessions
                 SET status = ?2, result_json = ?3, error_json = ?4,
                     completed_at = ?5, updated_at = ?5
                 WHERE id = ?1 AND {TERMINAL_GUARD}"
            ),
            params![
                id,
                outcome.as_str(),
                result.map(serde_json::Value::to_string),
                error.map(serde_json::Value::to_string),
                now.to_rfc3339(),
            ],
        )?;
        let session = self.classify(Self::select(&conn, id)?, id)?;
        drop(conn);

        if changed == 1 {
            tracing::info!(session_id = %id, outcome = %outcome, "publish session finalized");
            Ok((session, true))
        } else {
            // A concurrent finalize won; theirs is the terminal record.
            Ok((session, false))
        }
    }

    /// Physically delete rows whose expiry classification window has fully
    /// elapsed, plus a grace period of one extra retention span so a reader
    /// racing the purge still sees "expired" rather than "not found".
    pub fn purge_expired(&self) -> Result<usize, SessionError> {
        let now = Utc::now();
        let terminal_cutoff = (now - self.ttl.terminal_retention - self.ttl.terminal_retention)
            .to_rfc3339();
        let active_cutoff = (now - self.ttl.active - self.ttl.terminal_retention).to_rfc3339();

        let conn = self.lock()?;
        let purged = conn.execute(
            "DELETE FROM sessions
             WHERE (completed_at IS NOT NULL AND completed_at < ?1)
                OR (completed_at IS NULL AND updated_at < ?2)",
            params![terminal_cutoff, active_cutoff],
        )?;
        drop(conn);

        if purged > 0 {
            tracing::info!(purged, "purged aged-out publish sessions");
        }
        Ok(purged)
    }
}
