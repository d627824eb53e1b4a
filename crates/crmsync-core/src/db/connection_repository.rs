//! CRM connection repository

use libsql::{params, Connection, Row};

use super::{json_column, parse_column, u32_column};
use crate::error::{Error, Result};
use crate::models::{
    Checkpoint, Connection as CrmConnection, ConnectionId, ConnectionStatus, TenantId,
};

const CONNECTION_COLUMNS: &str = "id, tenant_id, provider, credential_ref, status, rate_limit, \
     conflict_policy, natural_key, remote_checkpoint, local_checkpoint, health_failures, \
     last_error, created_at, updated_at";

/// Trait for connection storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ConnectionRepository {
    /// Insert a new connection
    async fn insert(&self, connection: &CrmConnection) -> Result<()>;

    /// Get a connection by ID
    async fn get(&self, id: &ConnectionId) -> Result<Option<CrmConnection>>;

    /// List connections, optionally restricted to one tenant
    async fn list(&self, tenant: Option<&TenantId>) -> Result<Vec<CrmConnection>>;

    /// List connections in the `active` status
    async fn list_active(&self) -> Result<Vec<CrmConnection>>;

    /// Persist configuration fields (status, limits, policy, natural key)
    async fn update(&self, connection: &CrmConnection) -> Result<()>;

    /// Change status and last error
    async fn set_status(
        &self,
        id: &ConnectionId,
        status: ConnectionStatus,
        last_error: Option<&str>,
    ) -> Result<()>;

    /// Record a health probe outcome
    async fn set_health(
        &self,
        id: &ConnectionId,
        failures: u32,
        last_error: Option<&str>,
    ) -> Result<()>;

    /// Persist both checkpoints after a completed run
    async fn save_checkpoints(
        &self,
        id: &ConnectionId,
        remote: Option<&Checkpoint>,
        local: Option<i64>,
    ) -> Result<()>;
}

/// libSQL implementation of `ConnectionRepository`
pub struct LibSqlConnectionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConnectionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a connection from a database row
    fn parse_connection(row: &Row) -> Result<CrmConnection> {
        let id: String = row.get(0)?;
        let tenant_id: String = row.get(1)?;
        let provider: String = row.get(2)?;
        let status: String = row.get(4)?;
        let rate_limit: String = row.get(5)?;
        let conflict_policy: String = row.get(6)?;
        let natural_key: String = row.get(7)?;
        let remote_checkpoint: Option<String> = row.get(8)?;

        Ok(CrmConnection {
            id: parse_column(&id, "connection id")?,
            tenant_id: parse_column(&tenant_id, "tenant id")?,
            provider: parse_column(&provider, "provider")?,
            credential_ref: row.get(3)?,
            status: parse_column(&status, "status")?,
            rate_limit: json_column(&rate_limit)?,
            conflict_policy: parse_column(&conflict_policy, "conflict policy")?,
            natural_key: parse_column(&natural_key, "natural key")?,
            remote_checkpoint: remote_checkpoint.map(Checkpoint::new),
            local_checkpoint: row.get(9)?,
            health_failures: u32_column(row.get(10)?),
            last_error: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    async fn query_connections(
        &self,
        sql: &str,
        params: Vec<libsql::Value>,
    ) -> Result<Vec<CrmConnection>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut connections = Vec::new();
        while let Some(row) = rows.next().await? {
            connections.push(Self::parse_connection(&row)?);
        }
        Ok(connections)
    }

    fn ensure_updated(rows: u64, id: &ConnectionId) -> Result<()> {
        if rows == 0 {
            return Err(Error::NotFound(format!("connection {id}")));
        }
        Ok(())
    }
}

impl ConnectionRepository for LibSqlConnectionRepository<'_> {
    async fn insert(&self, connection: &CrmConnection) -> Result<()> {
        let sql = format!(
            "INSERT INTO crm_connections ({CONNECTION_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        let result = self
            .conn
            .execute(
                &sql,
                params![
                    connection.id.as_str(),
                    connection.tenant_id.as_str(),
                    connection.provider.as_str(),
                    connection.credential_ref.clone(),
                    connection.status.as_str(),
                    serde_json::to_string(&connection.rate_limit)?,
                    connection.conflict_policy.as_str(),
                    connection.natural_key.as_str(),
                    connection
                        .remote_checkpoint
                        .as_ref()
                        .map(|checkpoint| checkpoint.as_str().to_string()),
                    connection.local_checkpoint,
                    i64::from(connection.health_failures),
                    connection.last_error.clone(),
                    connection.created_at,
                    connection.updated_at
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if error.to_string().contains("UNIQUE") => Err(Error::InvalidInput(format!(
                "tenant {} already has a live {} connection",
                connection.tenant_id, connection.provider
            ))),
            Err(error) => Err(error.into()),
        }
    }

    async fn get(&self, id: &ConnectionId) -> Result<Option<CrmConnection>> {
        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM crm_connections WHERE id = ?");
        let mut connections = self
            .query_connections(&sql, vec![id.as_str().into()])
            .await?;
        Ok(connections.pop())
    }

    async fn list(&self, tenant: Option<&TenantId>) -> Result<Vec<CrmConnection>> {
        match tenant {
            Some(tenant) => {
                let sql = format!(
                    "SELECT {CONNECTION_COLUMNS} FROM crm_connections
                     WHERE tenant_id = ? ORDER BY created_at ASC"
                );
                self.query_connections(&sql, vec![tenant.as_str().into()])
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {CONNECTION_COLUMNS} FROM crm_connections ORDER BY created_at ASC"
                );
                self.query_connections(&sql, Vec::new()).await
            }
        }
    }

    async fn list_active(&self) -> Result<Vec<CrmConnection>> {
        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM crm_connections
             WHERE status = 'active' ORDER BY created_at ASC"
        );
        self.query_connections(&sql, Vec::new()).await
    }

    async fn update(&self, connection: &CrmConnection) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .conn
            .execute(
                "UPDATE crm_connections SET
                    credential_ref = ?, status = ?, rate_limit = ?, conflict_policy = ?,
                    natural_key = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    connection.credential_ref.clone(),
                    connection.status.as_str(),
                    serde_json::to_string(&connection.rate_limit)?,
                    connection.conflict_policy.as_str(),
                    connection.natural_key.as_str(),
                    now,
                    connection.id.as_str()
                ],
            )
            .await?;
        Self::ensure_updated(rows, &connection.id)
    }

    async fn set_status(
        &self,
        id: &ConnectionId,
        status: ConnectionStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .conn
            .execute(
                "UPDATE crm_connections SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
                params![
                    status.as_str(),
                    last_error.map(str::to_string),
                    now,
                    id.as_str()
                ],
            )
            .await?;
        Self::ensure_updated(rows, id)
    }

    async fn set_health(
        &self,
        id: &ConnectionId,
        failures: u32,
        last_error: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .conn
            .execute(
                "UPDATE crm_connections SET health_failures = ?, last_error = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    i64::from(failures),
                    last_error.map(str::to_string),
                    now,
                    id.as_str()
                ],
            )
            .await?;
        Self::ensure_updated(rows, id)
    }

    async fn save_checkpoints(
        &self,
        id: &ConnectionId,
        remote: Option<&Checkpoint>,
        local: Option<i64>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .conn
            .execute(
                "UPDATE crm_connections SET remote_checkpoint = ?, local_checkpoint = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    remote.map(|checkpoint| checkpoint.as_str().to_string()),
                    local,
                    now,
                    id.as_str()
                ],
            )
            .await?;
        Self::ensure_updated(rows, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ConflictPolicy, Provider};
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_get_and_list_active() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConnectionRepository::new(db.connection());

        let mut connection = CrmConnection::new(TenantId::new(), Provider::HubSpot, "cred-1");
        connection.conflict_policy = ConflictPolicy::Manual;
        repo.insert(&connection).await.unwrap();

        let loaded = repo.get(&connection.id).await.unwrap().unwrap();
        assert_eq!(loaded, connection);

        repo.set_status(&connection.id, ConnectionStatus::Paused, None)
            .await
            .unwrap();
        assert!(repo.list_active().await.unwrap().is_empty());
        assert_eq!(repo.list(Some(&connection.tenant_id)).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_live_connection_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConnectionRepository::new(db.connection());
        let tenant = TenantId::new();

        let first = CrmConnection::new(tenant, Provider::Pipedrive, "a");
        repo.insert(&first).await.unwrap();
        let second = CrmConnection::new(tenant, Provider::Pipedrive, "b");
        assert!(matches!(
            repo.insert(&second).await,
            Err(Error::InvalidInput(_))
        ));

        repo.set_status(&first.id, ConnectionStatus::Disconnected, None)
            .await
            .unwrap();
        repo.insert(&second).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_save_checkpoints() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConnectionRepository::new(db.connection());
        let connection = CrmConnection::new(TenantId::new(), Provider::Salesforce, "cred");
        repo.insert(&connection).await.unwrap();

        let checkpoint = Checkpoint::new("2024-05-01T00:00:00.000Z");
        repo.save_checkpoints(&connection.id, Some(&checkpoint), Some(42))
            .await
            .unwrap();

        let loaded = repo.get(&connection.id).await.unwrap().unwrap();
        assert_eq!(loaded.remote_checkpoint, Some(checkpoint));
        assert_eq!(loaded.local_checkpoint, Some(42));
    }
}
