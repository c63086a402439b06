//! Durable offline operation queue and dead-letter table

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{fmt_ts, parse_opt_ts, parse_ts};
use crate::error::{Result, SyncError};
use crate::queue::{DeadLetter, OfflineOperation};

const OPERATION_COLUMNS: &str = "id, operation_type, payload, priority, retry_count, created_at, \
                                 last_attempt_at, next_attempt_at, last_error";

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn operation_from_row(row: &Row) -> rusqlite::Result<OfflineOperation> {
    let id: String = row.get("id")?;
    let operation_type: String = row.get("operation_type")?;
    let created_at: String = row.get("created_at")?;
    let last_attempt_at: Option<String> = row.get("last_attempt_at")?;
    let retry_count: i64 = row.get("retry_count")?;

    Ok(OfflineOperation {
        id: id.parse().map_err(|e| conversion_error(0, e))?,
        operation_type: operation_type.parse().map_err(|e| conversion_error(1, e))?,
        payload: row.get("payload")?,
        priority: row.get("priority")?,
        retry_count: retry_count.max(0) as u32,
        created_at: parse_ts(&created_at)?,
        last_attempt_at: parse_opt_ts(last_attempt_at)?,
        next_attempt_at: parse_opt_ts(row.get("next_attempt_at")?)?,
        last_error: row.get("last_error")?,
    })
}

/// Insert a new operation, or update the mutable fields of an existing one
/// while keeping its original position in the queue
pub fn save_operation(conn: &Connection, op: &OfflineOperation) -> Result<()> {
    conn.execute(
        "INSERT INTO offline_operations
            (id, operation_type, payload, priority, retry_count, created_at,
             last_attempt_at, next_attempt_at, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            payload = excluded.payload,
            priority = excluded.priority,
            retry_count = excluded.retry_count,
            last_attempt_at = excluded.last_attempt_at,
            next_attempt_at = excluded.next_attempt_at,
            last_error = excluded.last_error",
        params![
            op.id.to_string(),
            op.operation_type.as_str(),
            op.payload,
            op.priority,
            op.retry_count as i64,
            fmt_ts(&op.created_at),
            op.last_attempt_at.as_ref().map(fmt_ts),
            op.next_attempt_at.as_ref().map(fmt_ts),
            op.last_error,
        ],
    )?;
    Ok(())
}

/// Operations that may run at `now`, by priority then insertion order
pub fn due_operations(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<OfflineOperation>> {
    let sql = format!(
        "SELECT {} FROM offline_operations
         WHERE next_attempt_at IS NULL OR next_attempt_at <= ?
         ORDER BY priority ASC, seq ASC",
        OPERATION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let ops = stmt
        .query_map(params![fmt_ts(&now)], operation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
}

/// Every queued operation, in processing order
pub fn all_operations(conn: &Connection) -> Result<Vec<OfflineOperation>> {
    let sql = format!(
        "SELECT {} FROM offline_operations ORDER BY priority ASC, seq ASC",
        OPERATION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let ops = stmt
        .query_map([], operation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
}

pub fn get_operation(conn: &Connection, id: Uuid) -> Result<Option<OfflineOperation>> {
    let sql = format!(
        "SELECT {} FROM offline_operations WHERE id = ?",
        OPERATION_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![id.to_string()], operation_from_row)
        .optional()?)
}

pub fn delete_operation(conn: &Connection, id: Uuid) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM offline_operations WHERE id = ?",
        params![id.to_string()],
    )?;
    Ok(n > 0)
}

pub fn count_operations(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM offline_operations", [], |row| {
        row.get(0)
    })?;
    Ok(n as usize)
}

pub fn clear_operations(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM offline_operations", [])?)
}

/// Move an operation into the dead-letter table; must run inside a transaction
pub fn dead_letter(conn: &Connection, op: &OfflineOperation, error: &str) -> Result<DeadLetter> {
    let now = Utc::now();
    conn.execute(
        "INSERT OR REPLACE INTO dead_letter_operations
            (id, operation_type, payload, priority, retry_count, created_at,
             last_attempt_at, error, dead_lettered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            op.id.to_string(),
            op.operation_type.as_str(),
            op.payload,
            op.priority,
            op.retry_count as i64,
            fmt_ts(&op.created_at),
            op.last_attempt_at.as_ref().map(fmt_ts),
            error,
            fmt_ts(&now),
        ],
    )?;
    delete_operation(conn, op.id)?;

    Ok(DeadLetter {
        operation: op.clone(),
        error: error.to_string(),
        dead_lettered_at: now,
    })
}

fn dead_letter_from_row(row: &Row) -> rusqlite::Result<DeadLetter> {
    let id: String = row.get("id")?;
    let operation_type: String = row.get("operation_type")?;
    let created_at: String = row.get("created_at")?;
    let dead_lettered_at: String = row.get("dead_lettered_at")?;
    let retry_count: i64 = row.get("retry_count")?;
    let error: String = row.get("error")?;

    Ok(DeadLetter {
        operation: OfflineOperation {
            id: id.parse().map_err(|e| conversion_error(0, e))?,
            operation_type: operation_type.parse().map_err(|e| conversion_error(1, e))?,
            payload: row.get("payload")?,
            priority: row.get("priority")?,
            retry_count: retry_count.max(0) as u32,
            created_at: parse_ts(&created_at)?,
            last_attempt_at: parse_opt_ts(row.get("last_attempt_at")?)?,
            next_attempt_at: None,
            last_error: Some(error.clone()),
        },
        error,
        dead_lettered_at: parse_ts(&dead_lettered_at)?,
    })
}

pub fn dead_letters(conn: &Connection) -> Result<Vec<DeadLetter>> {
    let mut stmt = conn.prepare(
        "SELECT id, operation_type, payload, priority, retry_count, created_at,
                last_attempt_at, error, dead_lettered_at
         FROM dead_letter_operations ORDER BY dead_lettered_at ASC",
    )?;
    let letters = stmt
        .query_map([], dead_letter_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(letters)
}

pub fn count_dead_letters(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letter_operations", [], |row| {
        row.get(0)
    })?;
    Ok(n as usize)
}

/// Put a dead letter back at the end of the queue with a fresh retry budget;
/// must run inside a transaction
pub fn requeue_dead_letter(conn: &Connection, id: Uuid) -> Result<OfflineOperation> {
    let letter = conn
        .query_row(
            "SELECT id, operation_type, payload, priority, retry_count, created_at,
                    last_attempt_at, error, dead_lettered_at
             FROM dead_letter_operations WHERE id = ?",
            params![id.to_string()],
            dead_letter_from_row,
        )
        .optional()?
        .ok_or_else(|| SyncError::NotFound(format!("dead letter {}", id)))?;

    let mut op = letter.operation;
    op.retry_count = 0;
    op.next_attempt_at = None;
    op.last_error = None;

    save_operation(conn, &op)?;
    conn.execute(
        "DELETE FROM dead_letter_operations WHERE id = ?",
        params![id.to_string()],
    )?;
    Ok(op)
}
