//! Short-lived cache of job rows for the executor.
//!
//! Every unit execution needs its job's configuration. The cache keeps that
//! from turning into one job read per unit. Entries expire after a TTL and
//! are dropped explicitly whenever the engine changes a job.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::db::job_repo::{self, JobRecord};
use crate::db::{Database, DatabaseError};

const MAX_CACHED_JOBS: u64 = 10_000;

#[derive(Clone)]
pub struct JobCache {
    db: Database,
    jobs: Cache<i64, Arc<JobRecord>>,
}

impl JobCache {
    pub fn new(db: Database, ttl: Duration) -> Self {
        let jobs = Cache::builder()
            .max_capacity(MAX_CACHED_JOBS)
            .time_to_live(ttl)
            .build();
        Self { db, jobs }
    }

    /// Returns the cached job or loads it from the store.
    pub fn get(&self, job_id: i64) -> Result<Arc<JobRecord>, DatabaseError> {
        if let Some(job) = self.jobs.get(&job_id) {
            return Ok(job);
        }

        let job = Arc::new(self.db.with_conn(|conn| job_repo::get(conn, job_id))?);
        self.jobs.insert(job_id, Arc::clone(&job));
        Ok(job)
    }

    pub fn invalidate(&self, job_id: i64) {
        self.jobs.invalidate(&job_id);
    }
}
