//! Task unit response repository. Responses are append-only.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use super::{json_column, now_timestamp, parse_column, DatabaseError};
use crate::job::UnitStatus;

/// One recorded execution attempt of a task unit.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub id: i64,
    pub job_id: i64,
    pub unit_id: Option<i64>,
    pub unit_index: u32,
    pub request_data: Option<Value>,
    pub response_data: Option<Value>,
    pub status: UnitStatus,
    pub error_message: Option<String>,
    /// Wall-clock duration of the attempt in seconds.
    pub processing_time: Option<f64>,
    pub attempt: u32,
    pub created_at: String,
}

impl ResponseRecord {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            unit_id: row.get("unit_id")?,
            unit_index: row.get("unit_index")?,
            request_data: json_column(row, "request_data")?,
            response_data: json_column(row, "response_data")?,
            status: parse_column(row, "status")?,
            error_message: row.get("error_message")?,
            processing_time: row.get("processing_time")?,
            attempt: row.get("attempt")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewResponse {
    pub job_id: i64,
    pub unit_id: i64,
    pub unit_index: u32,
    pub request_data: Option<Value>,
    pub response_data: Option<Value>,
    pub status: UnitStatus,
    pub error_message: Option<String>,
    pub processing_time: Option<f64>,
    pub attempt: u32,
}

pub fn insert(conn: &Connection, response: &NewResponse) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO task_unit_responses
            (job_id, unit_id, unit_index, request_data, response_data, status,
             error_message, processing_time, attempt, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            response.job_id,
            response.unit_id,
            response.unit_index,
            response.request_data.as_ref().map(Value::to_string),
            response.response_data.as_ref().map(Value::to_string),
            response.status.as_str(),
            response.error_message,
            response.processing_time,
            response.attempt,
            now_timestamp(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<ResponseRecord>, DatabaseError> {
    let response = conn
        .query_row(
            "SELECT * FROM task_unit_responses WHERE id = ?1",
            params![id],
            ResponseRecord::from_row,
        )
        .optional()?;
    Ok(response)
}

/// All responses of a unit, oldest first.
pub fn list_for_unit(conn: &Connection, unit_id: i64) -> Result<Vec<ResponseRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM task_unit_responses WHERE unit_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![unit_id], ResponseRecord::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_for_job(conn: &Connection, job_id: i64) -> Result<u64, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM task_unit_responses WHERE job_id = ?1",
        params![job_id],
        |r| r.get(0),
    )?;
    Ok(count as u64)
}
