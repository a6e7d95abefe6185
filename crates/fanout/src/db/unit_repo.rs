//! Task unit repository: upsert, status, lease and query operations for
//! `task_units` and `unit_attachments`.

use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now_ms, now_timestamp, parse_column, DatabaseError};
use crate::job::{UnitCounts, UnitStatus};

/// A task unit row.
#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub id: i64,
    pub job_id: i64,
    pub unit_index: u32,
    pub content: String,
    pub has_content_blocks: bool,
    pub status: UnitStatus,
    pub latest_response_id: Option<i64>,
    pub is_valid: bool,
    pub generation: i64,
    pub locked_by: Option<String>,
    pub locked_until_ms: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl UnitRecord {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            unit_index: row.get("unit_index")?,
            content: row.get("content")?,
            has_content_blocks: row.get("has_content_blocks")?,
            status: parse_column(row, "status")?,
            latest_response_id: row.get("latest_response_id")?,
            is_valid: row.get("is_valid")?,
            generation: row.get("generation")?,
            locked_by: row.get("locked_by")?,
            locked_until_ms: row.get("locked_until_ms")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A binary blob attached to a unit, stored base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub media_type: String,
    pub data_base64: String,
}

/// Content for one unit produced by a dispatch pass.
#[derive(Debug, Clone, Default)]
pub struct UnitDraft {
    pub unit_index: u32,
    pub content: String,
    pub attachments: Vec<AttachmentRecord>,
}

/// Identity of a persisted unit at a specific generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitRef {
    pub id: i64,
    pub generation: i64,
}

/// Creates or resets the unit at `(job_id, draft.unit_index)`.
///
/// A reset unit is PENDING, valid, has no latest response, no lease and a
/// bumped generation. Its attachments are replaced by the draft's.
pub fn upsert(conn: &Connection, job_id: i64, draft: &UnitDraft) -> Result<UnitRef, DatabaseError> {
    let now = now_timestamp();
    let unit = conn.query_row(
        "INSERT INTO task_units
            (job_id, unit_index, content, has_content_blocks, status, is_valid, generation,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, 1, ?6, ?6)
         ON CONFLICT (job_id, unit_index) DO UPDATE SET
            content = excluded.content,
            has_content_blocks = excluded.has_content_blocks,
            status = excluded.status,
            latest_response_id = NULL,
            is_valid = 1,
            generation = task_units.generation + 1,
            locked_by = NULL,
            locked_until_ms = NULL,
            updated_at = excluded.updated_at
         RETURNING id, generation",
        params![
            job_id,
            draft.unit_index,
            draft.content,
            !draft.attachments.is_empty(),
            UnitStatus::Pending.as_str(),
            now
        ],
        |r| {
            Ok(UnitRef {
                id: r.get(0)?,
                generation: r.get(1)?,
            })
        },
    )?;

    conn.execute(
        "DELETE FROM unit_attachments WHERE unit_id = ?1",
        params![unit.id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO unit_attachments (unit_id, position, media_type, data_base64)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (position, attachment) in draft.attachments.iter().enumerate() {
        stmt.execute(params![
            unit.id,
            position as i64,
            attachment.media_type,
            attachment.data_base64
        ])?;
    }

    Ok(unit)
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<UnitRecord>, DatabaseError> {
    let unit = conn
        .query_row(
            "SELECT * FROM task_units WHERE id = ?1",
            params![id],
            UnitRecord::from_row,
        )
        .optional()?;
    Ok(unit)
}

/// Loads a unit and checks it belongs to `job_id`.
pub fn get_for_job(
    conn: &Connection,
    job_id: i64,
    unit_id: i64,
) -> Result<UnitRecord, DatabaseError> {
    conn.query_row(
        "SELECT * FROM task_units WHERE id = ?1 AND job_id = ?2",
        params![unit_id, job_id],
        UnitRecord::from_row,
    )
    .optional()?
    .ok_or(DatabaseError::NotFound {
        entity: "task unit",
        id: unit_id,
    })
}

/// Attachments of a unit in insertion order.
pub fn attachments(conn: &Connection, unit_id: i64) -> Result<Vec<AttachmentRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT media_type, data_base64 FROM unit_attachments
         WHERE unit_id = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt
        .query_map(params![unit_id], |r| {
            Ok(AttachmentRecord {
                media_type: r.get(0)?,
                data_base64: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Marks every valid unit of a job invalid and bumps its generation.
///
/// In-flight executions holding the old generation discard their results.
pub fn invalidate_for_job(conn: &Connection, job_id: i64) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE task_units SET is_valid = 0, generation = generation + 1, updated_at = ?2
         WHERE job_id = ?1 AND is_valid = 1",
        params![job_id, now_timestamp()],
    )?;
    Ok(changed)
}

/// Moves a unit to `target` if the state machine allows it.
pub fn set_status(
    conn: &Connection,
    id: i64,
    target: UnitStatus,
) -> Result<UnitStatus, DatabaseError> {
    let current = find_by_id(conn, id)?
        .ok_or(DatabaseError::NotFound {
            entity: "task unit",
            id,
        })?
        .status;
    let next = current.transition(target)?;
    conn.execute(
        "UPDATE task_units SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, next.as_str(), now_timestamp()],
    )?;
    Ok(next)
}

/// Points the unit at its newest response.
pub fn set_latest_response(
    conn: &Connection,
    id: i64,
    response_id: i64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE task_units SET latest_response_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, response_id, now_timestamp()],
    )?;
    Ok(())
}

/// Whether the unit is still valid and at `generation`.
pub fn is_current(conn: &Connection, id: i64, generation: i64) -> Result<bool, DatabaseError> {
    let current: Option<bool> = conn
        .query_row(
            "SELECT is_valid = 1 AND generation = ?2 FROM task_units WHERE id = ?1",
            params![id, generation],
            |r| r.get(0),
        )
        .optional()?;
    Ok(current.unwrap_or(false))
}

/// Claims the unit lease for `owner` unless another holder's lease is live.
pub fn try_acquire_lease(
    conn: &Connection,
    id: i64,
    owner: &str,
    lease: Duration,
) -> Result<bool, DatabaseError> {
    let now = now_ms();
    let until = now + lease.as_millis() as i64;
    let changed = conn.execute(
        "UPDATE task_units SET locked_by = ?2, locked_until_ms = ?3
         WHERE id = ?1 AND (locked_until_ms IS NULL OR locked_until_ms < ?4)",
        params![id, owner, until, now],
    )?;
    Ok(changed == 1)
}

pub fn release_lease(conn: &Connection, id: i64, owner: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE task_units SET locked_by = NULL, locked_until_ms = NULL
         WHERE id = ?1 AND locked_by = ?2",
        params![id, owner],
    )?;
    Ok(())
}

/// Per-status counts over the job's valid units.
pub fn counts_for_job(conn: &Connection, job_id: i64) -> Result<UnitCounts, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM task_units
         WHERE job_id = ?1 AND is_valid = 1 GROUP BY status",
    )?;
    let rows = stmt
        .query_map(params![job_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = UnitCounts::default();
    for (status, count) in rows {
        let status: UnitStatus = status.parse().map_err(|_| DatabaseError::InvalidValue {
            column: "status",
            value: status.clone(),
        })?;
        counts.add(status, count as u64);
    }
    Ok(counts)
}

/// Valid units of a job in index order, one page at a time.
pub fn list_for_job(
    conn: &Connection,
    job_id: i64,
    limit: u64,
    offset: u64,
) -> Result<Vec<UnitRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM task_units WHERE job_id = ?1 AND is_valid = 1
         ORDER BY unit_index ASC LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt
        .query_map(
            params![
                job_id,
                i64::try_from(limit).unwrap_or(i64::MAX),
                i64::try_from(offset).unwrap_or(i64::MAX)
            ],
            UnitRecord::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Valid PENDING units of running jobs untouched since `updated_before`,
/// oldest first.
pub fn list_pending_before(
    conn: &Connection,
    updated_before: &str,
    limit: u64,
) -> Result<Vec<UnitRef>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, generation FROM task_units
         WHERE status = 'PENDING' AND is_valid = 1 AND updated_at <= ?1
           AND job_id IN (SELECT id FROM jobs WHERE status IN ('PENDING', 'IN_PROGRESS'))
         ORDER BY updated_at ASC, id ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![updated_before, limit as i64], unit_ref_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Valid IN_PROGRESS units whose lease has lapsed and that have not been
/// touched since `updated_before`. These were abandoned mid-execution.
pub fn list_stalled_before(
    conn: &Connection,
    updated_before: &str,
    limit: u64,
) -> Result<Vec<UnitRef>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, generation FROM task_units
         WHERE status = 'IN_PROGRESS' AND is_valid = 1 AND updated_at <= ?1
           AND (locked_until_ms IS NULL OR locked_until_ms < ?2)
           AND job_id IN (SELECT id FROM jobs WHERE status IN ('PENDING', 'IN_PROGRESS'))
         ORDER BY updated_at ASC, id ASC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            params![updated_before, now_ms(), limit as i64],
            unit_ref_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn unit_ref_from_row(row: &Row<'_>) -> Result<UnitRef, rusqlite::Error> {
    Ok(UnitRef {
        id: row.get(0)?,
        generation: row.get(1)?,
    })
}
