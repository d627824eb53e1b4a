//! Sync run log repository

use libsql::{params, Connection, Row};

use super::{json_column, limit_param, parse_column, parse_optional_column, u32_column};
use crate::error::{Error, Result};
use crate::models::{ConnectionId, ContactId, RunCounts, RunId, RunMode, RunStatus, SyncRun};

const RUN_COLUMNS: &str = "id, connection_id, trigger, mode, local_id, status, started_at, \
     finished_at, scanned, upserted_local, upserted_remote, skipped, failed, conflicts, \
     abort_reason, errors";

/// libSQL storage for sync run logs
pub struct LibSqlSyncLogRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncLogRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_run(row: &Row) -> Result<SyncRun> {
        let id: String = row.get(0)?;
        let connection_id: String = row.get(1)?;
        let trigger: String = row.get(2)?;
        let mode: String = row.get(3)?;
        let local_id: Option<String> = row.get(4)?;
        let status: String = row.get(5)?;
        let errors: String = row.get(15)?;

        let mode = match mode.as_str() {
            "full" => RunMode::Full,
            "delta" => RunMode::Delta,
            "single_record" => RunMode::SingleRecord(
                parse_optional_column::<ContactId>(local_id, "local id")?
                    .ok_or_else(|| Error::Database("single record run without local id".into()))?,
            ),
            other => return Err(Error::Database(format!("invalid run mode '{other}'"))),
        };

        Ok(SyncRun {
            id: parse_column(&id, "run id")?,
            connection_id: parse_column(&connection_id, "connection id")?,
            trigger: parse_column(&trigger, "trigger")?,
            mode,
            status: parse_column(&status, "run status")?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            counts: RunCounts {
                scanned: u32_column(row.get(8)?),
                upserted_local: u32_column(row.get(9)?),
                upserted_remote: u32_column(row.get(10)?),
                skipped: u32_column(row.get(11)?),
                failed: u32_column(row.get(12)?),
                conflicts: u32_column(row.get(13)?),
            },
            abort_reason: row.get(14)?,
            errors: json_column(&errors)?,
        })
    }

    /// Insert a run row in whatever state it is in
    pub async fn insert(&self, run: &SyncRun) -> Result<()> {
        let local_id = match run.mode {
            RunMode::SingleRecord(local_id) => Some(local_id.as_str()),
            RunMode::Full | RunMode::Delta => None,
        };
        let sql = format!(
            "INSERT INTO crm_sync_logs ({RUN_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        self.conn
            .execute(
                &sql,
                params![
                    run.id.as_str(),
                    run.connection_id.as_str(),
                    run.trigger.as_str(),
                    run.mode.as_str(),
                    local_id,
                    run.status.as_str(),
                    run.started_at,
                    run.finished_at,
                    i64::from(run.counts.scanned),
                    i64::from(run.counts.upserted_local),
                    i64::from(run.counts.upserted_remote),
                    i64::from(run.counts.skipped),
                    i64::from(run.counts.failed),
                    i64::from(run.counts.conflicts),
                    run.abort_reason.clone(),
                    serde_json::to_string(&run.errors)?
                ],
            )
            .await?;
        Ok(())
    }

    /// Write the final state of a running row.
    ///
    /// Closed rows are never modified; returns false when the row was not running.
    pub async fn close(&self, run: &SyncRun) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE crm_sync_logs SET
                    status = ?, finished_at = ?, scanned = ?, upserted_local = ?,
                    upserted_remote = ?, skipped = ?, failed = ?, conflicts = ?,
                    abort_reason = ?, errors = ?
                 WHERE id = ? AND status = 'running'",
                params![
                    run.status.as_str(),
                    run.finished_at,
                    i64::from(run.counts.scanned),
                    i64::from(run.counts.upserted_local),
                    i64::from(run.counts.upserted_remote),
                    i64::from(run.counts.skipped),
                    i64::from(run.counts.failed),
                    i64::from(run.counts.conflicts),
                    run.abort_reason.clone(),
                    serde_json::to_string(&run.errors)?,
                    run.id.as_str()
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    pub async fn get(&self, id: &RunId) -> Result<Option<SyncRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM crm_sync_logs WHERE id = ?");
        let mut rows = self.conn.query(&sql, [id.as_str()]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_run(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent runs of a connection, newest first
    pub async fn list_recent(&self, connection_id: &ConnectionId, limit: usize) -> Result<Vec<SyncRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM crm_sync_logs
             WHERE connection_id = ?
             ORDER BY started_at DESC, id DESC LIMIT ?"
        );
        let mut rows = self
            .conn
            .query(&sql, params![connection_id.as_str(), limit_param(limit)])
            .await?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next().await? {
            runs.push(Self::parse_run(&row)?);
        }
        Ok(runs)
    }

    /// Latest run of a connection with the given status
    pub async fn latest_with_status(
        &self,
        connection_id: &ConnectionId,
        status: RunStatus,
    ) -> Result<Option<SyncRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM crm_sync_logs
             WHERE connection_id = ? AND status = ?
             ORDER BY started_at DESC, id DESC LIMIT 1"
        );
        let mut rows = self
            .conn
            .query(&sql, params![connection_id.as_str(), status.as_str()])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_run(&row)?)),
            None => Ok(None),
        }
    }

    /// Delete closed rows that finished before `cutoff`
    pub async fn delete_closed_before(&self, cutoff: i64) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM crm_sync_logs WHERE status != 'running' AND finished_at < ?",
                [cutoff],
            )
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{RecordErrorKind, RunErrorEntry, RunTrigger};
    use pretty_assertions::assert_eq;

    fn running(connection_id: ConnectionId, mode: RunMode, started_at: i64) -> SyncRun {
        SyncRun {
            id: RunId::new(),
            connection_id,
            trigger: RunTrigger::Manual,
            mode,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            counts: RunCounts::default(),
            abort_reason: None,
            errors: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_is_applied_once() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncLogRepository::new(db.connection());
        let mut run = running(ConnectionId::new(), RunMode::SingleRecord(ContactId::new()), 1);
        repo.insert(&run).await.unwrap();

        run.status = RunStatus::Completed;
        run.finished_at = Some(5);
        run.counts.scanned = 3;
        run.errors.push(RunErrorEntry {
            kind: RecordErrorKind::Validation,
            local_id: None,
            external_id: Some("7".into()),
            field: Some("birthday".into()),
            message: "bad date".into(),
            at: 4,
        });
        assert!(repo.close(&run).await.unwrap());
        assert_eq!(repo.get(&run.id).await.unwrap(), Some(run.clone()));

        let mut tampered = run.clone();
        tampered.status = RunStatus::Aborted;
        assert!(!repo.close(&tampered).await.unwrap());
        assert_eq!(repo.get(&run.id).await.unwrap().unwrap().status, RunStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_recent_and_cleanup() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncLogRepository::new(db.connection());
        let connection_id = ConnectionId::new();

        for started_at in [10, 20, 30] {
            let mut run = running(connection_id, RunMode::Delta, started_at);
            run.status = RunStatus::Completed;
            run.finished_at = Some(started_at + 1);
            repo.insert(&run).await.unwrap();
        }
        repo.insert(&running(connection_id, RunMode::Full, 40)).await.unwrap();

        let recent = repo.list_recent(&connection_id, 2).await.unwrap();
        assert_eq!(recent.iter().map(|run| run.started_at).collect::<Vec<_>>(), vec![40, 30]);
        assert_eq!(
            repo.latest_with_status(&connection_id, RunStatus::Completed)
                .await
                .unwrap()
                .map(|run| run.started_at),
            Some(30)
        );

        assert_eq!(repo.delete_closed_before(25).await.unwrap(), 2);
        assert_eq!(repo.list_recent(&connection_id, 10).await.unwrap().len(), 2);
    }
}
