//! Row mapping boundary for the session store.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;

use crate::session::{PublishSession, SessionStatus, WorkerContext};

/// Column list shared by every session SELECT; order must match
/// [`row_to_session`].
pub(crate) const SESSION_COLUMNS: &str = "id, user_id, status, nonce, worker_context, \
     capability_token, progress, phase, message, result_json, error_json, \
     created_at, updated_at, completed_at";

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json(idx: usize, s: Option<String>) -> rusqlite::Result<Option<serde_json::Value>> {
    match s {
        None => Ok(None),
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}

pub(crate) fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<PublishSession> {
    let status_str: String = row.get(2)?;
    let status = SessionStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown session status: {status_str}").into(),
        )
    })?;

    let worker_context: Option<WorkerContext> = match row.get::<_, Option<String>>(4)? {
        None => None,
        Some(s) => Some(serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
        })?),
    };

    let created_at = parse_ts(11, &row.get::<_, String>(11)?)?;
    let updated_at = parse_ts(12, &row.get::<_, String>(12)?)?;
    let completed_at = match row.get::<_, Option<String>>(13)? {
        None => None,
        Some(s) => Some(parse_ts(13, &s)?),
    };

    Ok(PublishSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        status,
        nonce: row.get(3)?,
        worker_context,
        capability_token: row.get(5)?,
        progress: row.get(6)?,
        phase: row.get(7)?,
        message: row.get(8)?,
        result: parse_json(9, row.get(9)?)?,
        error: parse_json(10, row.get(10)?)?,
        created_at,
        updated_at,
        completed_at,
    })
}
