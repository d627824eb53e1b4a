//! Cross-run coordination: run lock leases and persisted day quotas

use libsql::{params, Connection};

use crate::error::Result;
use crate::models::{ConnectionId, RunId};

/// libSQL storage for state shared by concurrent runs and processes
pub struct LibSqlCoordinationRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlCoordinationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Take the run lease for a connection unless a live one is held.
    ///
    /// An expired lease is taken over.
    pub async fn try_acquire_lock(
        &self,
        connection_id: &ConnectionId,
        run_id: &RunId,
        now: i64,
        ttl_ms: i64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "INSERT INTO crm_run_locks (connection_id, run_id, acquired_at, expires_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (connection_id) DO UPDATE SET
                    run_id = excluded.run_id,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                 WHERE crm_run_locks.expires_at < excluded.acquired_at",
                params![
                    connection_id.as_str(),
                    run_id.as_str(),
                    now,
                    now.saturating_add(ttl_ms)
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    /// Extend the lease; false when another run has taken it over
    pub async fn renew_lock(
        &self,
        connection_id: &ConnectionId,
        run_id: &RunId,
        now: i64,
        ttl_ms: i64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE crm_run_locks SET expires_at = ?
                 WHERE connection_id = ? AND run_id = ?",
                params![
                    now.saturating_add(ttl_ms),
                    connection_id.as_str(),
                    run_id.as_str()
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    /// Release the lease if this run still holds it
    pub async fn release_lock(&self, connection_id: &ConnectionId, run_id: &RunId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM crm_run_locks WHERE connection_id = ? AND run_id = ?",
                params![connection_id.as_str(), run_id.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Run currently holding the lease, if any
    pub async fn lock_holder(&self, connection_id: &ConnectionId, now: i64) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id FROM crm_run_locks WHERE connection_id = ? AND expires_at >= ?",
                params![connection_id.as_str(), now],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Count one request against the day quota; false when it is spent
    pub async fn consume_daily_quota(
        &self,
        connection_id: &ConnectionId,
        day: &str,
        limit: u32,
    ) -> Result<bool> {
        self.conn
            .execute(
                "INSERT INTO crm_rate_quota (connection_id, day, used) VALUES (?, ?, 0)
                 ON CONFLICT (connection_id, day) DO NOTHING",
                params![connection_id.as_str(), day.to_string()],
            )
            .await?;
        let rows = self
            .conn
            .execute(
                "UPDATE crm_rate_quota SET used = used + 1
                 WHERE connection_id = ? AND day = ? AND used < ?",
                params![connection_id.as_str(), day.to_string(), i64::from(limit)],
            )
            .await?;
        Ok(rows == 1)
    }

    /// Drop quota rows for days other than `keep_day`
    pub async fn prune_quota(&self, keep_day: &str) -> Result<u64> {
        let rows = self
            .conn
            .execute("DELETE FROM crm_rate_quota WHERE day != ?", [keep_day])
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lock_is_exclusive_until_released_or_expired() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlCoordinationRepository::new(db.connection());
        let connection_id = ConnectionId::new();
        let first = RunId::new();
        let second = RunId::new();

        assert!(repo.try_acquire_lock(&connection_id, &first, 100, 50).await.unwrap());
        assert!(!repo.try_acquire_lock(&connection_id, &second, 120, 50).await.unwrap());
        assert_eq!(
            repo.lock_holder(&connection_id, 120).await.unwrap(),
            Some(first.as_str())
        );

        // a stale release from another run does nothing
        repo.release_lock(&connection_id, &second).await.unwrap();
        assert!(!repo.try_acquire_lock(&connection_id, &second, 130, 50).await.unwrap());

        // expired lease is taken over
        assert!(repo.try_acquire_lock(&connection_id, &second, 151, 50).await.unwrap());

        repo.release_lock(&connection_id, &second).await.unwrap();
        assert!(repo.lock_holder(&connection_id, 152).await.unwrap().is_none());
        assert!(repo.try_acquire_lock(&connection_id, &first, 152, 50).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_renewed_lease_is_not_taken_over() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlCoordinationRepository::new(db.connection());
        let connection_id = ConnectionId::new();
        let first = RunId::new();
        let second = RunId::new();

        assert!(repo.try_acquire_lock(&connection_id, &first, 100, 50).await.unwrap());
        assert!(repo.renew_lock(&connection_id, &first, 140, 50).await.unwrap());
        // would have expired at 150 without the renewal
        assert!(!repo.try_acquire_lock(&connection_id, &second, 160, 50).await.unwrap());

        assert!(repo.try_acquire_lock(&connection_id, &second, 191, 50).await.unwrap());
        assert!(!repo.renew_lock(&connection_id, &first, 195, 50).await.unwrap());
        assert_eq!(
            repo.lock_holder(&connection_id, 195).await.unwrap(),
            Some(second.as_str())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_daily_quota_stops_at_limit() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlCoordinationRepository::new(db.connection());
        let connection_id = ConnectionId::new();

        assert!(repo.consume_daily_quota(&connection_id, "2024-05-01", 2).await.unwrap());
        assert!(repo.consume_daily_quota(&connection_id, "2024-05-01", 2).await.unwrap());
        assert!(!repo.consume_daily_quota(&connection_id, "2024-05-01", 2).await.unwrap());
        assert!(repo.consume_daily_quota(&connection_id, "2024-05-02", 2).await.unwrap());

        assert_eq!(repo.prune_quota("2024-05-02").await.unwrap(), 1);
    }
}
