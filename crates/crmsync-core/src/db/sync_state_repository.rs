//! Sync state repository

use libsql::{params, Connection, Row};

use super::{json_column, parse_column, parse_optional_column};
use crate::error::Result;
use crate::models::{ConnectionId, ContactId, SyncState};

const STATE_COLUMNS: &str = "connection_id, local_id, external_id, local_version, remote_version, \
     last_synced_at, unlinked_at, baseline, open_conflict_id";

/// libSQL storage for per-record sync state
pub struct LibSqlSyncStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncStateRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_state(row: &Row) -> Result<SyncState> {
        let connection_id: String = row.get(0)?;
        let local_id: String = row.get(1)?;
        let baseline: String = row.get(7)?;
        let open_conflict_id: Option<String> = row.get(8)?;

        Ok(SyncState {
            connection_id: parse_column(&connection_id, "connection id")?,
            local_id: parse_column(&local_id, "local id")?,
            external_id: row.get(2)?,
            local_version: row.get(3)?,
            remote_version: row.get(4)?,
            last_synced_at: row.get(5)?,
            unlinked_at: row.get(6)?,
            baseline: json_column(&baseline)?,
            open_conflict_id: parse_optional_column(open_conflict_id, "conflict id")?,
        })
    }

    async fn query_one(&self, sql: &str, params: Vec<libsql::Value>) -> Result<Option<SyncState>> {
        let mut rows = self.conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_state(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get(
        &self,
        connection_id: &ConnectionId,
        local_id: &ContactId,
    ) -> Result<Option<SyncState>> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM crm_sync_state WHERE connection_id = ? AND local_id = ?"
        );
        self.query_one(
            &sql,
            vec![connection_id.as_str().into(), local_id.as_str().into()],
        )
        .await
    }

    pub async fn get_by_external(
        &self,
        connection_id: &ConnectionId,
        external_id: &str,
    ) -> Result<Option<SyncState>> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM crm_sync_state WHERE connection_id = ? AND external_id = ?"
        );
        self.query_one(
            &sql,
            vec![connection_id.as_str().into(), external_id.to_string().into()],
        )
        .await
    }

    /// Insert or fully overwrite a state row
    pub async fn upsert(&self, state: &SyncState) -> Result<()> {
        let sql = format!(
            "INSERT INTO crm_sync_state ({STATE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (connection_id, local_id) DO UPDATE SET
                external_id = excluded.external_id,
                local_version = excluded.local_version,
                remote_version = excluded.remote_version,
                last_synced_at = excluded.last_synced_at,
                unlinked_at = excluded.unlinked_at,
                baseline = excluded.baseline,
                open_conflict_id = excluded.open_conflict_id"
        );
        self.conn
            .execute(
                &sql,
                params![
                    state.connection_id.as_str(),
                    state.local_id.as_str(),
                    state.external_id.clone(),
                    state.local_version,
                    state.remote_version,
                    state.last_synced_at,
                    state.unlinked_at,
                    serde_json::to_string(&state.baseline)?,
                    state.open_conflict_id.map(|id| id.as_str())
                ],
            )
            .await?;
        Ok(())
    }

    /// Clear the external id, keeping the row
    pub async fn mark_unlinked(
        &self,
        connection_id: &ConnectionId,
        local_id: &ContactId,
        at: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE crm_sync_state SET external_id = NULL, unlinked_at = ?
                 WHERE connection_id = ? AND local_id = ?",
                params![at, connection_id.as_str(), local_id.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Remove the row for a local record that was deleted
    pub async fn delete(&self, connection_id: &ConnectionId, local_id: &ContactId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM crm_sync_state WHERE connection_id = ? AND local_id = ?",
                params![connection_id.as_str(), local_id.as_str()],
            )
            .await?;
        Ok(())
    }

    pub async fn count(&self, connection_id: &ConnectionId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM crm_sync_state WHERE connection_id = ? AND external_id IS NOT NULL",
                [connection_id.as_str()],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionRepository, Database, LibSqlConnectionRepository};
    use crate::models::{
        CanonicalContact, ConflictId, Connection as CrmConnection, FieldValue, Provider, TenantId,
    };
    use pretty_assertions::assert_eq;

    async fn setup() -> (Database, ConnectionId) {
        let db = Database::open_in_memory().await.unwrap();
        let connection = CrmConnection::new(TenantId::new(), Provider::HubSpot, "cred");
        LibSqlConnectionRepository::new(db.connection())
            .insert(&connection)
            .await
            .unwrap();
        (db, connection.id)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_and_lookup_both_ways() {
        let (db, connection_id) = setup().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());

        let mut state = SyncState::new(connection_id, ContactId::new());
        state.external_id = Some("501".into());
        state.local_version = 10;
        state.remote_version = Some(20);
        state.baseline = CanonicalContact::new().with("email", FieldValue::Text("a@b.co".into()));
        state.open_conflict_id = Some(ConflictId::new());
        repo.upsert(&state).await.unwrap();

        assert_eq!(repo.get(&connection_id, &state.local_id).await.unwrap(), Some(state.clone()));
        assert_eq!(repo.get_by_external(&connection_id, "501").await.unwrap(), Some(state.clone()));

        state.local_version = 11;
        repo.upsert(&state).await.unwrap();
        let loaded = repo.get(&connection_id, &state.local_id).await.unwrap().unwrap();
        assert_eq!(loaded.local_version, 11);
        assert_eq!(repo.count(&connection_id).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unlink_keeps_row() {
        let (db, connection_id) = setup().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        let mut state = SyncState::new(connection_id, ContactId::new());
        state.external_id = Some("9".into());
        repo.upsert(&state).await.unwrap();

        repo.mark_unlinked(&connection_id, &state.local_id, 77).await.unwrap();
        let loaded = repo.get(&connection_id, &state.local_id).await.unwrap().unwrap();
        assert_eq!(loaded.external_id, None);
        assert_eq!(loaded.unlinked_at, Some(77));
        assert!(repo.get_by_external(&connection_id, "9").await.unwrap().is_none());

        repo.delete(&connection_id, &state.local_id).await.unwrap();
        assert!(repo.get(&connection_id, &state.local_id).await.unwrap().is_none());
    }
}
