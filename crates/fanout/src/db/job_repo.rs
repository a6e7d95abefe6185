//! Job repository: CRUD, status and lease operations for the `jobs` table.
//!
//! Functions take a `&Connection` so callers can compose them inside one
//! transaction (`Database::with_tx`) or run them standalone (`with_conn`).

use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{json_column, now_ms, now_timestamp, parse_column, DatabaseError};
use crate::job::{JobConfig, JobStatus};

/// A job row.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub owner: String,
    pub title: String,
    pub description: Option<String>,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub configs: JobConfig,
    pub status: JobStatus,
    pub locked_by: Option<String>,
    pub locked_until_ms: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRecord {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner: row.get("owner")?,
            title: row.get("title")?,
            description: row.get("description")?,
            file_path: row.get("file_path")?,
            file_name: row.get("file_name")?,
            configs: json_column(row, "configs")?.unwrap_or_default(),
            status: parse_column(row, "status")?,
            locked_by: row.get("locked_by")?,
            locked_until_ms: row.get("locked_until_ms")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Fields supplied when a job is created.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub owner: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Inserts a new job in CREATED and returns its id.
pub fn insert(conn: &Connection, job: &NewJob) -> Result<i64, DatabaseError> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO jobs (owner, title, description, status, created_at, updated_at)
         VALUES (?1, COALESCE(?2, 'New BatchJob'), ?3, ?4, ?5, ?5)",
        params![
            job.owner,
            job.title,
            job.description,
            JobStatus::Created.as_str(),
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<JobRecord>, DatabaseError> {
    let job = conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id],
            JobRecord::from_row,
        )
        .optional()?;
    Ok(job)
}

/// Like [`find_by_id`] but a missing row is an error.
pub fn get(conn: &Connection, id: i64) -> Result<JobRecord, DatabaseError> {
    find_by_id(conn, id)?.ok_or(DatabaseError::NotFound { entity: "job", id })
}

/// Moves a job to `target` if the state machine allows it.
///
/// A rejected transition leaves the row untouched. Returns the new status.
pub fn set_status(
    conn: &Connection,
    id: i64,
    target: JobStatus,
) -> Result<JobStatus, DatabaseError> {
    let current = get(conn, id)?.status;
    let next = current.transition(target)?;
    conn.execute(
        "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, next.as_str(), now_timestamp()],
    )?;
    log::debug!("Job {} status {} -> {}", id, current, next);
    Ok(next)
}

/// Replaces the job configuration.
pub fn set_configs(conn: &Connection, id: i64, configs: &JobConfig) -> Result<(), DatabaseError> {
    let json = serde_json::to_string(configs).map_err(|e| DatabaseError::InvalidValue {
        column: "configs",
        value: e.to_string(),
    })?;
    let changed = conn.execute(
        "UPDATE jobs SET configs = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, json, now_timestamp()],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound { entity: "job", id });
    }
    Ok(())
}

/// Records a newly uploaded file. The previous configuration is discarded.
pub fn set_file(
    conn: &Connection,
    id: i64,
    file_path: &str,
    file_name: &str,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET file_path = ?2, file_name = ?3, configs = NULL, updated_at = ?4
         WHERE id = ?1",
        params![id, file_path, file_name, now_timestamp()],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound { entity: "job", id });
    }
    Ok(())
}

/// Deletes a job. Units, responses and attachments cascade.
pub fn delete(conn: &Connection, id: i64) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}

/// Claims the job lease for `owner` unless another holder's lease is live.
///
/// Compare-and-set on the lease columns; returns `false` without blocking
/// when someone else holds the job.
pub fn try_acquire_lease(
    conn: &Connection,
    id: i64,
    owner: &str,
    lease: Duration,
) -> Result<bool, DatabaseError> {
    let now = now_ms();
    let until = now + lease.as_millis() as i64;
    let changed = conn.execute(
        "UPDATE jobs SET locked_by = ?2, locked_until_ms = ?3
         WHERE id = ?1 AND (locked_until_ms IS NULL OR locked_until_ms < ?4)",
        params![id, owner, until, now],
    )?;
    Ok(changed == 1)
}

/// Drops the lease if `owner` still holds it.
pub fn release_lease(conn: &Connection, id: i64, owner: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET locked_by = NULL, locked_until_ms = NULL
         WHERE id = ?1 AND locked_by = ?2",
        params![id, owner],
    )?;
    Ok(())
}

/// Job ids in `status` last updated before `updated_before`, oldest first.
pub fn list_ids_by_status(
    conn: &Connection,
    status: JobStatus,
    updated_before: &str,
    limit: u64,
) -> Result<Vec<i64>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM jobs WHERE status = ?1 AND updated_at <= ?2
         ORDER BY updated_at ASC LIMIT ?3",
    )?;
    let ids = stmt
        .query_map(params![status.as_str(), updated_before, limit as i64], |r| {
            r.get(0)
        })?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// IN_PROGRESS jobs last updated before `updated_before` that have no
/// outstanding valid units: either nothing was dispatched or every unit has
/// finished. Jobs still working through their units are not returned.
pub fn list_settled_running(
    conn: &Connection,
    updated_before: &str,
    limit: u64,
) -> Result<Vec<i64>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM jobs j
         WHERE j.status = 'IN_PROGRESS' AND j.updated_at <= ?1
           AND NOT EXISTS (
               SELECT 1 FROM task_units u
               WHERE u.job_id = j.id AND u.is_valid = 1
                 AND u.status IN ('PENDING', 'IN_PROGRESS'))
         ORDER BY j.updated_at ASC, j.id ASC LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![updated_before, limit as i64], |r| r.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn new_job(db: &Database) -> i64 {
        db.with_conn(|conn| {
            insert(
                conn,
                &NewJob {
                    owner: "user-1".to_string(),
                    ..Default::default()
                },
            )
        })
        .unwrap()
    }

    #[test]
    fn test_insert_and_find() {
        let db = Database::open_in_memory().unwrap();
        let id = new_job(&db);

        let job = db.with_conn(|conn| get(conn, id)).unwrap();
        assert_eq!(job.owner, "user-1");
        assert_eq!(job.title, "New BatchJob");
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.configs, JobConfig::default());
        assert!(job.file_path.is_none());

        let missing = db.with_conn(|conn| find_by_id(conn, 999)).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_set_status_rejects_illegal_transition_without_mutation() {
        let db = Database::open_in_memory().unwrap();
        let id = new_job(&db);

        let result = db.with_conn(|conn| set_status(conn, id, JobStatus::InProgress));
        assert!(matches!(result, Err(DatabaseError::InvalidTransition(_))));

        let job = db.with_conn(|conn| get(conn, id)).unwrap();
        assert_eq!(job.status, JobStatus::Created);

        let status = db
            .with_conn(|conn| set_status(conn, id, JobStatus::Uploaded))
            .unwrap();
        assert_eq!(status, JobStatus::Uploaded);
    }

    #[test]
    fn test_set_status_on_every_illegal_pair_leaves_row_unchanged() {
        let db = Database::open_in_memory().unwrap();
        let id = new_job(&db);

        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                db.with_conn(|conn| {
                    conn.execute(
                        "UPDATE jobs SET status = ?2 WHERE id = ?1",
                        params![id, from.as_str()],
                    )?;
                    Ok(())
                })
                .unwrap();
                assert!(db.with_conn(|conn| set_status(conn, id, to)).is_err());
                let job = db.with_conn(|conn| get(conn, id)).unwrap();
                assert_eq!(job.status, from);
            }
        }
    }

    #[test]
    fn test_set_file_resets_configs() {
        let db = Database::open_in_memory().unwrap();
        let id = new_job(&db);
        let configs = JobConfig {
            prompt: Some("Translate {text}".to_string()),
            ..Default::default()
        };

        db.with_conn(|conn| set_configs(conn, id, &configs)).unwrap();
        let job = db.with_conn(|conn| get(conn, id)).unwrap();
        assert_eq!(job.configs, configs);

        db.with_conn(|conn| set_file(conn, id, "/tmp/a.csv", "a.csv"))
            .unwrap();
        let job = db.with_conn(|conn| get(conn, id)).unwrap();
        assert_eq!(job.configs, JobConfig::default());
        assert_eq!(job.file_name.as_deref(), Some("a.csv"));
    }

    #[test]
    fn test_lease_is_exclusive_until_released() {
        let db = Database::open_in_memory().unwrap();
        let id = new_job(&db);
        let lease = Duration::from_secs(30);

        assert!(db
            .with_conn(|conn| try_acquire_lease(conn, id, "worker-a", lease))
            .unwrap());
        assert!(!db
            .with_conn(|conn| try_acquire_lease(conn, id, "worker-b", lease))
            .unwrap());

        db.with_conn(|conn| release_lease(conn, id, "worker-b"))
            .unwrap();
        assert!(!db
            .with_conn(|conn| try_acquire_lease(conn, id, "worker-b", lease))
            .unwrap());

        db.with_conn(|conn| release_lease(conn, id, "worker-a"))
            .unwrap();
        assert!(db
            .with_conn(|conn| try_acquire_lease(conn, id, "worker-b", lease))
            .unwrap());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let db = Database::open_in_memory().unwrap();
        let id = new_job(&db);

        assert!(db
            .with_conn(|conn| try_acquire_lease(conn, id, "worker-a", Duration::ZERO))
            .unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(db
            .with_conn(|conn| try_acquire_lease(conn, id, "worker-b", Duration::from_secs(30)))
            .unwrap());
    }

    #[test]
    fn test_delete() {
        let db = Database::open_in_memory().unwrap();
        let id = new_job(&db);
        assert!(db.with_conn(|conn| delete(conn, id)).unwrap());
        assert!(!db.with_conn(|conn| delete(conn, id)).unwrap());
    }

    #[test]
    fn test_list_ids_by_status() {
        let db = Database::open_in_memory().unwrap();
        let a = new_job(&db);
        let b = new_job(&db);
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'PENDING', updated_at = '2020-01-01T00:00:00.000Z'
                 WHERE id = ?1",
                params![a],
            )?;
            conn.execute(
                "UPDATE jobs SET status = 'PENDING' WHERE id = ?1",
                params![b],
            )?;
            Ok(())
        })
        .unwrap();

        let ids = db
            .with_conn(|conn| {
                list_ids_by_status(conn, JobStatus::Pending, "2021-01-01T00:00:00.000Z", 10)
            })
            .unwrap();
        assert_eq!(ids, vec![a]);

        let ids = db
            .with_conn(|conn| list_ids_by_status(conn, JobStatus::Pending, &now_timestamp(), 10))
            .unwrap();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_list_settled_running_skips_jobs_with_outstanding_units() {
        let db = Database::open_in_memory().unwrap();
        let busy = new_job(&db);
        let settled = new_job(&db);
        let empty = new_job(&db);
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'IN_PROGRESS', updated_at = '2020-01-01T00:00:00.000Z'",
                [],
            )?;
            conn.execute(
                "UPDATE jobs SET updated_at = '2019-01-01T00:00:00.000Z' WHERE id = ?1",
                params![busy],
            )?;
            for (job_id, status) in [(busy, "PENDING"), (busy, "COMPLETED"), (settled, "COMPLETED")] {
                conn.execute(
                    "INSERT INTO task_units (job_id, unit_index, status, created_at, updated_at)
                     SELECT ?1, COUNT(*) + 1, ?2, '2020-01-01T00:00:00.000Z', '2020-01-01T00:00:00.000Z'
                     FROM task_units WHERE job_id = ?1",
                    params![job_id, status],
                )?;
            }
            Ok(())
        })
        .unwrap();

        let cutoff = "2021-01-01T00:00:00.000Z";
        let ids = db
            .with_conn(|conn| list_settled_running(conn, cutoff, 10))
            .unwrap();
        assert_eq!(ids, vec![settled, empty]);

        // The older busy job does not take the only slot.
        let ids = db.with_conn(|conn| list_settled_running(conn, cutoff, 1)).unwrap();
        assert_eq!(ids, vec![settled]);

        db.with_conn(|conn| {
            conn.execute("UPDATE task_units SET is_valid = 0 WHERE job_id = ?1", params![busy])?;
            Ok(())
        })
        .unwrap();
        let ids = db.with_conn(|conn| list_settled_running(conn, cutoff, 1)).unwrap();
        assert_eq!(ids, vec![busy]);
    }
}
