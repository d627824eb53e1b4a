//! Field mapping repository

use libsql::{params, Connection};

use super::parse_column;
use crate::error::Result;
use crate::mapping::{FieldMapping, MappingSet, Transform};
use crate::models::ConnectionId;

/// libSQL storage for a connection's field mapping rows
pub struct LibSqlMappingRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMappingRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Load the stored rows for a connection
    pub async fn load(&self, connection_id: &ConnectionId) -> Result<MappingSet> {
        let mut rows = self
            .conn
            .query(
                "SELECT local_path, remote_key, direction, transform, origin, enabled
                 FROM crm_field_mappings WHERE connection_id = ? ORDER BY id ASC",
                [connection_id.as_str()],
            )
            .await?;

        let mut mappings = Vec::new();
        while let Some(row) = rows.next().await? {
            let direction: String = row.get(2)?;
            let transform: Option<String> = row.get(3)?;
            let origin: String = row.get(4)?;
            mappings.push(FieldMapping {
                local_path: row.get(0)?,
                remote_key: row.get(1)?,
                direction: parse_column(&direction, "direction")?,
                transform: transform
                    .map(|identifier| identifier.parse::<Transform>())
                    .transpose()?,
                origin: parse_column(&origin, "origin")?,
                enabled: row.get::<i32>(5)? != 0,
            });
        }

        Ok(MappingSet::from_stored(mappings))
    }

    /// Replace every row of a connection with an already validated set.
    ///
    /// Must run inside the caller's transaction.
    pub async fn replace(&self, connection_id: &ConnectionId, set: &MappingSet) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM crm_field_mappings WHERE connection_id = ?",
                [connection_id.as_str()],
            )
            .await?;

        for mapping in set.rows() {
            self.conn
                .execute(
                    "INSERT INTO crm_field_mappings
                        (connection_id, local_path, remote_key, direction, transform, origin, enabled)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        connection_id.as_str(),
                        mapping.local_path.clone(),
                        mapping.remote_key.clone(),
                        mapping.direction.as_str(),
                        mapping.transform.map(|transform| transform.as_str()),
                        mapping.origin.as_str(),
                        i32::from(mapping.enabled)
                    ],
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionRepository, Database, LibSqlConnectionRepository};
    use crate::mapping::{default_mappings, Direction};
    use crate::models::{Connection as CrmConnection, Provider, TenantId};
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replace_and_load() {
        let db = Database::open_in_memory().await.unwrap();
        let connection = CrmConnection::new(TenantId::new(), Provider::HubSpot, "cred");
        LibSqlConnectionRepository::new(db.connection())
            .insert(&connection)
            .await
            .unwrap();
        let repo = LibSqlMappingRepository::new(db.connection());

        let mut rows = default_mappings(Provider::HubSpot);
        rows.push(FieldMapping::new("custom.tier", "tier", Direction::Pull).disabled());
        let set = MappingSet::validate(rows).unwrap();

        repo.replace(&connection.id, &set).await.unwrap();
        let loaded = repo.load(&connection.id).await.unwrap();
        assert_eq!(loaded, set);

        repo.replace(&connection.id, &MappingSet::default())
            .await
            .unwrap();
        assert!(repo.load(&connection.id).await.unwrap().rows().is_empty());
    }
}
