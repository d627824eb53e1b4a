//! Conflict repository

use libsql::{params, Connection, Row};

use super::{json_column, limit_param, parse_column};
use crate::error::Result;
use crate::models::{Conflict, ConflictId, ConflictStatus, ConnectionId, ContactId, FieldValue};

const CONFLICT_COLUMNS: &str = "id, connection_id, local_id, field_path, local_value, \
     local_modified_at, remote_value, remote_modified_at, status, created_at, updated_at, resolved_at";

/// Values observed on both sides when a conflict is (re)detected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictObservation<'a> {
    pub field_path: &'a str,
    pub local_value: &'a FieldValue,
    pub local_modified_at: i64,
    pub remote_value: &'a FieldValue,
    pub remote_modified_at: Option<i64>,
}

/// libSQL storage for field conflicts
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &Row) -> Result<Conflict> {
        let id: String = row.get(0)?;
        let connection_id: String = row.get(1)?;
        let local_id: String = row.get(2)?;
        let local_value: String = row.get(4)?;
        let remote_value: String = row.get(6)?;
        let status: String = row.get(8)?;

        Ok(Conflict {
            id: parse_column(&id, "conflict id")?,
            connection_id: parse_column(&connection_id, "connection id")?,
            local_id: parse_column(&local_id, "local id")?,
            field_path: row.get(3)?,
            local_value: json_column(&local_value)?,
            local_modified_at: row.get(5)?,
            remote_value: json_column(&remote_value)?,
            remote_modified_at: row.get(7)?,
            status: parse_column(&status, "conflict status")?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            resolved_at: row.get(11)?,
        })
    }

    async fn query_conflicts(&self, sql: &str, params: Vec<libsql::Value>) -> Result<Vec<Conflict>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    pub async fn get(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        let sql = format!("SELECT {CONFLICT_COLUMNS} FROM crm_conflicts WHERE id = ?");
        Ok(self
            .query_conflicts(&sql, vec![id.as_str().into()])
            .await?
            .pop())
    }

    /// Record a divergence, refreshing the open row for the same field if any
    pub async fn upsert_open(
        &self,
        connection_id: &ConnectionId,
        local_id: &ContactId,
        observation: &ConflictObservation<'_>,
        now: i64,
    ) -> Result<ConflictId> {
        let local_value = serde_json::to_string(observation.local_value)?;
        let remote_value = serde_json::to_string(observation.remote_value)?;

        let mut rows = self
            .conn
            .query(
                "SELECT id FROM crm_conflicts
                 WHERE connection_id = ? AND local_id = ? AND field_path = ? AND status = 'open'",
                params![
                    connection_id.as_str(),
                    local_id.as_str(),
                    observation.field_path
                ],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            self.conn
                .execute(
                    "UPDATE crm_conflicts SET
                        local_value = ?, local_modified_at = ?, remote_value = ?,
                        remote_modified_at = ?, updated_at = ?
                     WHERE id = ?",
                    params![
                        local_value,
                        observation.local_modified_at,
                        remote_value,
                        observation.remote_modified_at,
                        now,
                        id.clone()
                    ],
                )
                .await?;
            return parse_column(&id, "conflict id");
        }

        let id = ConflictId::new();
        let sql = format!(
            "INSERT INTO crm_conflicts ({CONFLICT_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open', ?, ?, NULL)"
        );
        self.conn
            .execute(
                &sql,
                params![
                    id.as_str(),
                    connection_id.as_str(),
                    local_id.as_str(),
                    observation.field_path,
                    local_value,
                    observation.local_modified_at,
                    remote_value,
                    observation.remote_modified_at,
                    now,
                    now
                ],
            )
            .await?;
        Ok(id)
    }

    /// Open conflicts of one record
    pub async fn list_open_for_record(
        &self,
        connection_id: &ConnectionId,
        local_id: &ContactId,
    ) -> Result<Vec<Conflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM crm_conflicts
             WHERE connection_id = ? AND local_id = ? AND status = 'open'
             ORDER BY field_path ASC"
        );
        self.query_conflicts(
            &sql,
            vec![connection_id.as_str().into(), local_id.as_str().into()],
        )
        .await
    }

    /// Conflicts of a connection, newest first
    pub async fn list(
        &self,
        connection_id: &ConnectionId,
        status: Option<ConflictStatus>,
        limit: usize,
    ) -> Result<Vec<Conflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM crm_conflicts
             WHERE connection_id = ? AND (? IS NULL OR status = ?)
             ORDER BY created_at DESC LIMIT ?"
        );
        let status = status.map(ConflictStatus::as_str);
        self.query_conflicts(
            &sql,
            vec![
                connection_id.as_str().into(),
                status.into(),
                status.into(),
                limit_param(limit).into(),
            ],
        )
        .await
    }

    /// Open conflicts across all connections created before `cutoff`
    pub async fn list_open_older_than(&self, cutoff: i64, limit: usize) -> Result<Vec<Conflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM crm_conflicts
             WHERE status = 'open' AND created_at < ?
             ORDER BY created_at ASC LIMIT ?"
        );
        self.query_conflicts(&sql, vec![cutoff.into(), limit_param(limit).into()])
            .await
    }

    /// Close an open conflict; returns false when it was not open
    pub async fn resolve(&self, id: &ConflictId, status: ConflictStatus, at: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE crm_conflicts SET status = ?, resolved_at = ?, updated_at = ?
                 WHERE id = ? AND status = 'open'",
                params![status.as_str(), at, at, id.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }

    pub async fn count_open(&self, connection_id: &ConnectionId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM crm_conflicts WHERE connection_id = ? AND status = 'open'",
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
    use crate::db::Database;

    fn observation<'a>(local: &'a FieldValue, remote: &'a FieldValue) -> ConflictObservation<'a> {
        ConflictObservation {
            field_path: "email",
            local_value: local,
            local_modified_at: 100,
            remote_value: remote,
            remote_modified_at: Some(200),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_redetection_refreshes_open_conflict() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());
        let connection_id = ConnectionId::new();
        let local_id = ContactId::new();

        let a = FieldValue::Text("a@x.io".into());
        let b = FieldValue::Text("b@x.io".into());
        let c = FieldValue::Text("c@x.io".into());

        let first = repo
            .upsert_open(&connection_id, &local_id, &observation(&a, &b), 1)
            .await
            .unwrap();
        let second = repo
            .upsert_open(&connection_id, &local_id, &observation(&a, &c), 2)
            .await
            .unwrap();
        assert_eq!(first, second);

        let open = repo
            .list_open_for_record(&connection_id, &local_id)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].remote_value, c);
        assert_eq!(open[0].updated_at, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolve_closes_once() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());
        let connection_id = ConnectionId::new();
        let local = FieldValue::Null;
        let remote = FieldValue::Text("x".into());

        let id = repo
            .upsert_open(&connection_id, &ContactId::new(), &observation(&local, &remote), 5)
            .await
            .unwrap();
        assert_eq!(repo.count_open(&connection_id).await.unwrap(), 1);
        assert_eq!(repo.list_open_older_than(6, 10).await.unwrap().len(), 1);

        assert!(repo.resolve(&id, ConflictStatus::ResolvedRemote, 9).await.unwrap());
        assert!(!repo.resolve(&id, ConflictStatus::ResolvedLocal, 10).await.unwrap());

        let conflict = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(conflict.status, ConflictStatus::ResolvedRemote);
        assert_eq!(conflict.resolved_at, Some(9));
        assert_eq!(
            repo.list(&connection_id, Some(ConflictStatus::Open), 10)
                .await
                .unwrap()
                .len(),
            0
        );
        assert_eq!(repo.list(&connection_id, None, 10).await.unwrap().len(), 1);
    }
}
