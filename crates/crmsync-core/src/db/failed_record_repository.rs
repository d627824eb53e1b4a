//! Failed record (retry queue) repository

use libsql::{params, Connection, Row};

use super::{limit_param, parse_column, parse_optional_column, u32_column};
use crate::error::Result;
use crate::models::{record_key, ConnectionId, ContactId, FailedRecord, FailedRecordStatus};

const FAILED_COLUMNS: &str = "connection_id, local_id, external_id, attempts, first_failed_at, \
     last_failed_at, last_error, status";

/// libSQL storage for records awaiting the retry sweep
pub struct LibSqlFailedRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlFailedRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_record(row: &Row) -> Result<FailedRecord> {
        let connection_id: String = row.get(0)?;
        let local_id: Option<String> = row.get(1)?;
        let status: String = row.get(7)?;
        Ok(FailedRecord {
            connection_id: parse_column(&connection_id, "connection id")?,
            local_id: parse_optional_column(local_id, "local id")?,
            external_id: row.get(2)?,
            attempts: u32_column(row.get(3)?),
            first_failed_at: row.get(4)?,
            last_failed_at: row.get(5)?,
            last_error: row.get(6)?,
            status: parse_column(&status, "failed record status")?,
        })
    }

    /// Record one more failed attempt; a permanent record stays permanent
    pub async fn record_failure(
        &self,
        connection_id: &ConnectionId,
        local_id: Option<ContactId>,
        external_id: Option<&str>,
        error: &str,
        now: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO crm_failed_records (
                    connection_id, record_key, local_id, external_id, attempts,
                    first_failed_at, last_failed_at, last_error, status
                 ) VALUES (?, ?, ?, ?, 1, ?, ?, ?, 'pending')
                 ON CONFLICT (connection_id, record_key) DO UPDATE SET
                    attempts = attempts + 1,
                    external_id = COALESCE(excluded.external_id, external_id),
                    last_failed_at = excluded.last_failed_at,
                    last_error = excluded.last_error",
                params![
                    connection_id.as_str(),
                    record_key(local_id, external_id),
                    local_id.map(|id| id.as_str()),
                    external_id.map(str::to_string),
                    now,
                    now,
                    error.to_string()
                ],
            )
            .await?;
        Ok(())
    }

    /// Drop a record from the queue after it synced
    pub async fn clear(
        &self,
        connection_id: &ConnectionId,
        local_id: Option<ContactId>,
        external_id: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM crm_failed_records WHERE connection_id = ? AND record_key = ?",
                params![connection_id.as_str(), record_key(local_id, external_id)],
            )
            .await?;
        Ok(())
    }

    /// Pending records, oldest failure first
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedRecord>> {
        let sql = format!(
            "SELECT {FAILED_COLUMNS} FROM crm_failed_records
             WHERE status = 'pending'
             ORDER BY last_failed_at ASC LIMIT ?"
        );
        let mut rows = self.conn.query(&sql, [limit_param(limit)]).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    /// Records of a connection, any status
    pub async fn list_for_connection(&self, connection_id: &ConnectionId) -> Result<Vec<FailedRecord>> {
        let sql = format!(
            "SELECT {FAILED_COLUMNS} FROM crm_failed_records
             WHERE connection_id = ? ORDER BY last_failed_at DESC"
        );
        let mut rows = self.conn.query(&sql, [connection_id.as_str()]).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    /// Give up on pending records first seen before `cutoff`
    pub async fn mark_permanent_before(&self, cutoff: i64) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "UPDATE crm_failed_records SET status = ?
                 WHERE status = 'pending' AND first_failed_at < ?",
                params![FailedRecordStatus::Permanent.as_str(), cutoff],
            )
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failures_accumulate_and_clear() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlFailedRecordRepository::new(db.connection());
        let connection_id = ConnectionId::new();
        let local_id = ContactId::new();

        repo.record_failure(&connection_id, Some(local_id), None, "timeout", 10)
            .await
            .unwrap();
        repo.record_failure(&connection_id, Some(local_id), Some("44"), "502", 20)
            .await
            .unwrap();

        let pending = repo.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].first_failed_at, 10);
        assert_eq!(pending[0].external_id.as_deref(), Some("44"));
        assert_eq!(pending[0].last_error, "502");

        repo.clear(&connection_id, Some(local_id), None).await.unwrap();
        assert!(repo.list_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unbounded_limit_lists_everything() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlFailedRecordRepository::new(db.connection());
        let connection_id = ConnectionId::new();
        for external_id in ["a", "b", "c"] {
            repo.record_failure(&connection_id, None, Some(external_id), "x", 1)
                .await
                .unwrap();
        }

        assert_eq!(repo.list_pending(usize::MAX).await.unwrap().len(), 3);
        assert_eq!(repo.list_pending(2).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_old_failures_become_permanent() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlFailedRecordRepository::new(db.connection());
        let connection_id = ConnectionId::new();

        repo.record_failure(&connection_id, None, Some("old"), "x", 5)
            .await
            .unwrap();
        repo.record_failure(&connection_id, None, Some("new"), "x", 50)
            .await
            .unwrap();

        assert_eq!(repo.mark_permanent_before(10).await.unwrap(), 1);
        let pending = repo.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].external_id.as_deref(), Some("new"));

        let all = repo.list_for_connection(&connection_id).await.unwrap();
        assert!(all
            .iter()
            .any(|record| record.status == FailedRecordStatus::Permanent));
    }
}
