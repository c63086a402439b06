//! Record queries and per-channel sync-field writes
//!
//! The backend's delivery state lives in `sync_status`, `remote_id`,
//! `last_synced_at` and `sync_error`; the cloud's in the `cloud_*` columns.
//! Channel-scoped reads alias the channel's columns onto the record's sync
//! fields so callers work with one [`SyncableRecord`] shape.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{fmt_ts, parse_opt_ts, parse_ts};
use crate::error::{Result, SyncError};
use crate::sync::conflict::{self, MergeSummary, RemoteRecord};
use crate::types::{EntityType, LocalId, SyncChannel, SyncStatus, SyncUpdate, SyncableRecord};

/// Columns holding one channel's delivery state
struct ChannelColumns {
    status: &'static str,
    remote_id: &'static str,
    synced_at: &'static str,
    error: &'static str,
}

fn columns(channel: SyncChannel) -> ChannelColumns {
    match channel {
        SyncChannel::Backend => ChannelColumns {
            status: "sync_status",
            remote_id: "remote_id",
            synced_at: "last_synced_at",
            error: "sync_error",
        },
        SyncChannel::Cloud => ChannelColumns {
            status: "cloud_status",
            remote_id: "cloud_record_name",
            synced_at: "cloud_synced_at",
            error: "cloud_error",
        },
    }
}

fn select_list(channel: SyncChannel) -> String {
    let c = columns(channel);
    format!(
        "local_id, entity_type, {} AS remote_id, owner_id, timestamp, payload, \
         {} AS sync_status, {} AS last_synced_at, {} AS sync_error",
        c.remote_id, c.status, c.synced_at, c.error
    )
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// Parse a record from a database row
pub fn record_from_row(row: &Row) -> rusqlite::Result<SyncableRecord> {
    let local_id: String = row.get("local_id")?;
    let entity_type: String = row.get("entity_type")?;
    let remote_id: Option<String> = row.get("remote_id")?;
    let owner_id: Option<String> = row.get("owner_id")?;
    let timestamp: String = row.get("timestamp")?;
    let payload: String = row.get("payload")?;
    let sync_status: String = row.get("sync_status")?;
    let last_synced_at: Option<String> = row.get("last_synced_at")?;
    let sync_error: Option<String> = row.get("sync_error")?;

    Ok(SyncableRecord {
        local_id: local_id.parse().map_err(|e| conversion_error(0, e))?,
        entity_type: entity_type.parse().map_err(|e| conversion_error(1, e))?,
        remote_id,
        owner_id: owner_id
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| conversion_error(3, e))?,
        timestamp: parse_ts(&timestamp)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(5, e))?,
        sync_status: sync_status.parse().map_err(|e| conversion_error(6, e))?,
        last_synced_at: parse_opt_ts(last_synced_at)?,
        sync_error,
    })
}

/// Insert or fully replace a record's content and backend state
///
/// A content change leaves the cloud copy stale, so its delivery state goes
/// back to `pending`.
pub fn upsert_record(conn: &Connection, record: &SyncableRecord) -> Result<()> {
    let previous = get_record(conn, record.local_id)?;

    conn.execute(
        "INSERT INTO records (local_id, entity_type, remote_id, owner_id, timestamp, payload,
                              sync_status, last_synced_at, sync_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(local_id) DO UPDATE SET
            entity_type = excluded.entity_type,
            remote_id = excluded.remote_id,
            owner_id = excluded.owner_id,
            timestamp = excluded.timestamp,
            payload = excluded.payload,
            sync_status = excluded.sync_status,
            last_synced_at = excluded.last_synced_at,
            sync_error = excluded.sync_error",
        params![
            record.local_id.to_string(),
            record.entity_type.as_str(),
            record.remote_id,
            record.owner_id.map(|id| id.to_string()),
            fmt_ts(&record.timestamp),
            serde_json::to_string(&record.payload)?,
            record.sync_status.as_str(),
            record.last_synced_at.as_ref().map(fmt_ts),
            record.sync_error,
        ],
    )?;

    let content_changed = previous.is_some_and(|p| {
        p.payload != record.payload || fmt_ts(&p.timestamp) != fmt_ts(&record.timestamp)
    });
    if content_changed {
        mark_stale(conn, SyncChannel::Cloud, record.local_id)?;
    }
    Ok(())
}

/// Record with its backend delivery state
pub fn get_record(conn: &Connection, local_id: LocalId) -> Result<Option<SyncableRecord>> {
    get_record_on(conn, SyncChannel::Backend, local_id)
}

/// Record with `channel`'s delivery state in its sync fields
pub fn get_record_on(
    conn: &Connection,
    channel: SyncChannel,
    local_id: LocalId,
) -> Result<Option<SyncableRecord>> {
    let sql = format!("SELECT {} FROM records WHERE local_id = ?", select_list(channel));
    Ok(conn
        .query_row(&sql, params![local_id.to_string()], record_from_row)
        .optional()?)
}

pub fn find_by_remote_id(
    conn: &Connection,
    entity_type: EntityType,
    remote_id: &str,
) -> Result<Option<SyncableRecord>> {
    find_by_remote_id_on(conn, SyncChannel::Backend, entity_type, remote_id)
}

pub fn find_by_remote_id_on(
    conn: &Connection,
    channel: SyncChannel,
    entity_type: EntityType,
    remote_id: &str,
) -> Result<Option<SyncableRecord>> {
    let sql = format!(
        "SELECT {} FROM records WHERE entity_type = ? AND {} = ?",
        select_list(channel),
        columns(channel).remote_id
    );
    Ok(conn
        .query_row(&sql, params![entity_type.as_str(), remote_id], record_from_row)
        .optional()?)
}

/// Apply a local edit: new payload, fresh timestamp, back to `pending`
///
/// A channel currently `syncing` keeps its status; the in-flight commit sees
/// the changed timestamp and stores the record as `pending`.
pub fn update_local(
    conn: &Connection,
    local_id: LocalId,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<SyncableRecord> {
    let mut record = get_record(conn, local_id)?
        .ok_or_else(|| SyncError::NotFound(format!("record {}", local_id)))?;

    // Timestamps must strictly advance or the in-flight check cannot see the edit
    record.timestamp = if now > record.timestamp {
        now
    } else {
        record.timestamp + chrono::Duration::microseconds(1)
    };
    record.payload = payload.clone();
    if record.sync_status != SyncStatus::Syncing {
        record.sync_status = SyncStatus::Pending;
        record.sync_error = None;
    }

    upsert_record(conn, &record)?;
    Ok(record)
}

pub fn delete_record(conn: &Connection, local_id: LocalId) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM records WHERE local_id = ?",
        params![local_id.to_string()],
    )?;
    Ok(n > 0)
}

/// Records of `entity_type` in `pending` or `failed` on `channel`, oldest first
pub fn records_needing_sync(
    conn: &Connection,
    channel: SyncChannel,
    entity_type: EntityType,
    limit: Option<usize>,
) -> Result<Vec<SyncableRecord>> {
    let sql = format!(
        "SELECT {} FROM records
         WHERE entity_type = ? AND {} IN ('pending', 'failed')
         ORDER BY timestamp ASC, local_id ASC
         LIMIT ?",
        select_list(channel),
        columns(channel).status
    );
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params![entity_type.as_str(), limit], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Records with `status` on `channel`, optionally restricted to one entity type
pub fn records_with_status(
    conn: &Connection,
    channel: SyncChannel,
    entity_type: Option<EntityType>,
    status: SyncStatus,
) -> Result<Vec<SyncableRecord>> {
    let sql = format!(
        "SELECT {} FROM records
         WHERE {} = ?1 AND (?2 IS NULL OR entity_type = ?2)
         ORDER BY timestamp ASC, local_id ASC",
        select_list(channel),
        columns(channel).status
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(
            params![status.as_str(), entity_type.map(|e| e.as_str())],
            record_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

pub fn count_with_status(
    conn: &Connection,
    channel: SyncChannel,
    entity_type: Option<EntityType>,
    statuses: &[SyncStatus],
) -> Result<usize> {
    let sql = format!(
        "SELECT COUNT(*) FROM records WHERE {} = ?1 AND (?2 IS NULL OR entity_type = ?2)",
        columns(channel).status
    );
    let mut total = 0usize;
    for status in statuses {
        let n: i64 = conn.query_row(
            &sql,
            params![status.as_str(), entity_type.map(|e| e.as_str())],
            |row| row.get(0),
        )?;
        total += n as usize;
    }
    Ok(total)
}

/// Move records to `syncing` on `channel`; must run inside a transaction
///
/// Only records whose path to `syncing` is made of allowed edges are taken
/// (`pending -> syncing`, `failed -> pending -> syncing`). A record already
/// `syncing` is owned by another run and is left alone. Returns the claimed
/// ids in input order.
pub fn claim_for_sync(
    conn: &Connection,
    channel: SyncChannel,
    ids: &[LocalId],
) -> Result<Vec<LocalId>> {
    let c = columns(channel);
    let sql = format!(
        "UPDATE records SET {status} = 'syncing', {error} = NULL
         WHERE local_id = ?1 AND {status} = ?2",
        status = c.status,
        error = c.error
    );

    let mut claimed = Vec::with_capacity(ids.len());
    for &local_id in ids {
        let Some(record) = get_record_on(conn, channel, local_id)? else {
            continue;
        };
        let path = match record.sync_status {
            SyncStatus::Failed => SyncStatus::Failed
                .transition(SyncStatus::Pending)
                .and_then(|s| s.transition(SyncStatus::Syncing)),
            status => status.transition(SyncStatus::Syncing),
        };
        if path.is_err() {
            tracing::debug!(
                %local_id,
                %channel,
                status = %record.sync_status,
                "Record not claimable for sync"
            );
            continue;
        }

        let n = conn.execute(&sql, params![local_id.to_string(), record.sync_status.as_str()])?;
        if n == 1 {
            claimed.push(local_id);
        }
    }
    Ok(claimed)
}

/// Write sync fields for a batch of records; must run inside a transaction
///
/// Each update touches only its own channel's state. Updates whose
/// transition is not an allowed edge are skipped (the record moved on, e.g.
/// into `conflict`, while the sync was in flight); a repeated status is
/// accepted except `syncing`, which only [`claim_for_sync`] may enter. A
/// remote identity is assigned once and never replaced. Returns the number
/// of updates applied.
pub fn commit_sync_updates(conn: &Connection, updates: &[SyncUpdate]) -> Result<usize> {
    let mut applied = 0;

    for update in updates {
        let Some(current) = get_record_on(conn, update.channel, update.local_id)? else {
            tracing::debug!(local_id = %update.local_id, "Record vanished before commit");
            continue;
        };

        let target = update.status;
        let allowed = current.sync_status.can_transition_to(target)
            || (current.sync_status == target && target != SyncStatus::Syncing);
        if !allowed {
            tracing::warn!(
                local_id = %update.local_id,
                channel = %update.channel,
                from = %current.sync_status,
                to = %target,
                "Skipping sync update with invalid transition"
            );
            continue;
        }

        let c = columns(update.channel);
        conn.execute(
            &format!(
                "UPDATE records
                 SET {status} = ?1, {remote} = COALESCE({remote}, ?2),
                     {synced} = COALESCE(?3, {synced}), {error} = ?4
                 WHERE local_id = ?5",
                status = c.status,
                remote = c.remote_id,
                synced = c.synced_at,
                error = c.error
            ),
            params![
                target.as_str(),
                update.remote_id,
                update.last_synced_at.as_ref().map(fmt_ts),
                update.sync_error,
                update.local_id.to_string(),
            ],
        )?;

        // The pushed version is delivered; an edit made while it was in
        // flight still has to go out, so take the synced -> pending edge too
        let edited_in_flight = target == SyncStatus::Synced
            && update
                .expected_timestamp
                .is_some_and(|t| fmt_ts(&t) != fmt_ts(&current.timestamp));
        if edited_in_flight {
            SyncStatus::Synced.transition(SyncStatus::Pending)?;
            conn.execute(
                &format!("UPDATE records SET {} = 'pending' WHERE local_id = ?1", c.status),
                params![update.local_id.to_string()],
            )?;
        }
        applied += 1;
    }

    Ok(applied)
}

/// Merge remote records delivered by `channel` with last-write-wins; must run
/// inside a transaction
///
/// Adopted content marks the other channel's copy stale.
pub fn apply_remote_records(
    conn: &Connection,
    channel: SyncChannel,
    remote: &[RemoteRecord],
    now: DateTime<Utc>,
) -> Result<MergeSummary> {
    let mut summary = MergeSummary::default();

    for incoming in remote {
        let by_local_id = match incoming.local_id {
            Some(id) => get_record_on(conn, channel, id)?,
            None => None,
        };
        let local = match by_local_id {
            Some(record) => Some(record),
            None => find_by_remote_id_on(conn, channel, incoming.entity_type, &incoming.remote_id)?,
        };

        let resolution = conflict::resolve(local.as_ref(), incoming);
        summary.record(resolution);

        if let Some(merged) = conflict::merged_record(local.as_ref(), incoming, resolution, now) {
            store_merged(conn, channel, &merged)?;
        }
    }

    Ok(summary)
}

fn store_merged(conn: &Connection, channel: SyncChannel, merged: &SyncableRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO records (local_id, entity_type, owner_id, timestamp, payload)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(local_id) DO UPDATE SET
            entity_type = excluded.entity_type,
            owner_id = excluded.owner_id,
            timestamp = excluded.timestamp,
            payload = excluded.payload",
        params![
            merged.local_id.to_string(),
            merged.entity_type.as_str(),
            merged.owner_id.map(|id| id.to_string()),
            fmt_ts(&merged.timestamp),
            serde_json::to_string(&merged.payload)?,
        ],
    )?;

    let c = columns(channel);
    conn.execute(
        &format!(
            "UPDATE records
             SET {status} = ?1, {remote} = COALESCE({remote}, ?2), {synced} = ?3, {error} = NULL
             WHERE local_id = ?4",
            status = c.status,
            remote = c.remote_id,
            synced = c.synced_at,
            error = c.error
        ),
        params![
            merged.sync_status.as_str(),
            merged.remote_id,
            merged.last_synced_at.as_ref().map(fmt_ts),
            merged.local_id.to_string(),
        ],
    )?;

    mark_stale(conn, channel.other(), merged.local_id)
}

/// `channel`'s copy no longer matches the local record
///
/// Settled states go back to `pending`; a `pending` record is already due
/// and a `syncing` one is caught by its commit.
fn mark_stale(conn: &Connection, channel: SyncChannel, local_id: LocalId) -> Result<()> {
    let c = columns(channel);
    conn.execute(
        &format!(
            "UPDATE records SET {status} = 'pending', {error} = NULL
             WHERE local_id = ?1 AND {status} IN ('synced', 'failed', 'conflict')",
            status = c.status,
            error = c.error
        ),
        params![local_id.to_string()],
    )?;
    Ok(())
}

/// Move every record with status `from` to `to` on `channel`
pub fn move_status(
    conn: &Connection,
    channel: SyncChannel,
    from: SyncStatus,
    to: SyncStatus,
    error: Option<&str>,
) -> Result<usize> {
    from.transition(to)?;
    let c = columns(channel);
    let n = conn.execute(
        &format!(
            "UPDATE records SET {status} = ?1, {error} = ?2 WHERE {status} = ?3",
            status = c.status,
            error = c.error
        ),
        params![to.as_str(), error, from.as_str()],
    )?;
    Ok(n)
}

/// Settled records back to `pending` on `channel` (full resync)
pub fn reset_pending(conn: &Connection, channel: SyncChannel) -> Result<usize> {
    let c = columns(channel);
    let n = conn.execute(
        &format!(
            "UPDATE records SET {status} = 'pending', {error} = NULL
             WHERE {status} IN ('synced', 'failed', 'conflict')",
            status = c.status,
            error = c.error
        ),
        [],
    )?;
    Ok(n)
}

/// Records settled on at least one channel
pub fn count_resettable(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records
         WHERE sync_status IN ('synced', 'failed', 'conflict')
            OR cloud_status IN ('synced', 'failed', 'conflict')",
        [],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

/// Persisted `last_sync` / `last_error` for one entity type
pub fn get_sync_state(
    conn: &Connection,
    entity_type: EntityType,
) -> Result<(Option<DateTime<Utc>>, Option<String>)> {
    let row: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT last_sync, last_error FROM sync_state WHERE entity_type = ?",
            params![entity_type.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((last_sync, last_error)) => Ok((parse_opt_ts(last_sync)?, last_error)),
        None => Ok((None, None)),
    }
}

/// Record the outcome of a sync run; `last_sync` is only advanced when given
pub fn record_sync_result(
    conn: &Connection,
    entity_type: EntityType,
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<&str>,
) -> Result<()> {
    let now = fmt_ts(&Utc::now());
    conn.execute(
        "INSERT INTO sync_state (entity_type, last_sync, last_error, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(entity_type) DO UPDATE SET
            last_sync = COALESCE(excluded.last_sync, sync_state.last_sync),
            last_error = excluded.last_error,
            updated_at = excluded.updated_at",
        params![
            entity_type.as_str(),
            last_sync.as_ref().map(fmt_ts),
            last_error,
            now
        ],
    )?;
    Ok(())
}
