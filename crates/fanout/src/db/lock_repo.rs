//! Named, expiring mutual-exclusion flags shared by every process using the
//! same database.

use std::time::Duration;

use rusqlite::{params, Connection};

use super::{now_ms, DatabaseError};

/// Takes the flag `name` for `ttl` unless a live holder exists.
///
/// Never blocks: returns `false` when the flag is held and not yet expired.
pub fn try_acquire(
    conn: &Connection,
    name: &str,
    owner: &str,
    ttl: Duration,
) -> Result<bool, DatabaseError> {
    let now = now_ms();
    let expires = now + ttl.as_millis() as i64;
    let changed = conn.execute(
        "INSERT INTO named_locks (name, owner, expires_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT (name) DO UPDATE SET
            owner = excluded.owner,
            expires_at_ms = excluded.expires_at_ms
         WHERE named_locks.expires_at_ms < ?4",
        params![name, owner, expires, now],
    )?;
    Ok(changed == 1)
}

/// Releases the flag if `owner` still holds it.
pub fn release(conn: &Connection, name: &str, owner: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM named_locks WHERE name = ?1 AND owner = ?2",
        params![name, owner],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_acquire_or_skip() {
        let db = Database::open_in_memory().unwrap();
        let ttl = Duration::from_secs(60);

        assert!(db
            .with_conn(|conn| try_acquire(conn, "sweep", "a", ttl))
            .unwrap());
        assert!(!db
            .with_conn(|conn| try_acquire(conn, "sweep", "b", ttl))
            .unwrap());
        assert!(db
            .with_conn(|conn| try_acquire(conn, "other", "b", ttl))
            .unwrap());

        db.with_conn(|conn| release(conn, "sweep", "b")).unwrap();
        assert!(!db
            .with_conn(|conn| try_acquire(conn, "sweep", "b", ttl))
            .unwrap());

        db.with_conn(|conn| release(conn, "sweep", "a")).unwrap();
        assert!(db
            .with_conn(|conn| try_acquire(conn, "sweep", "b", ttl))
            .unwrap());
    }

    #[test]
    fn test_expired_flag_is_taken_over() {
        let db = Database::open_in_memory().unwrap();
        assert!(db
            .with_conn(|conn| try_acquire(conn, "sweep", "a", Duration::ZERO))
            .unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(db
            .with_conn(|conn| try_acquire(conn, "sweep", "b", Duration::from_secs(60)))
            .unwrap());
    }
}
