//! Inbound webhook event repository

use chrono::{DateTime, Utc};
use libsql::{params, Connection};

use super::limit_param;
use crate::error::Result;
use crate::models::{ConnectionId, RemoteChangeEvent, RemoteRecord};

/// A queued change event with its row id
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWebhookEvent {
    pub id: i64,
    pub event: RemoteChangeEvent,
}

/// libSQL storage for normalized webhook events
pub struct LibSqlWebhookRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlWebhookRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Queue events for the next run of a connection
    pub async fn enqueue(
        &self,
        connection_id: &ConnectionId,
        events: &[RemoteChangeEvent],
        now: i64,
    ) -> Result<()> {
        for event in events {
            let record = event
                .record
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            self.conn
                .execute(
                    "INSERT INTO crm_webhook_events
                        (connection_id, external_id, record, occurred_at, received_at)
                     VALUES (?, ?, ?, ?, ?)",
                    params![
                        connection_id.as_str(),
                        event.external_id.clone(),
                        record,
                        event.occurred_at.map(|at| at.timestamp_millis()),
                        now
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Unprocessed events of a connection, oldest first
    pub async fn list_pending(
        &self,
        connection_id: &ConnectionId,
        limit: usize,
    ) -> Result<Vec<StoredWebhookEvent>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, external_id, record, occurred_at FROM crm_webhook_events
                 WHERE connection_id = ? AND processed_at IS NULL
                 ORDER BY id ASC LIMIT ?",
                params![connection_id.as_str(), limit_param(limit)],
            )
            .await?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            let record: Option<String> = row.get(2)?;
            let occurred_at: Option<i64> = row.get(3)?;
            events.push(StoredWebhookEvent {
                id: row.get(0)?,
                event: RemoteChangeEvent {
                    external_id: row.get(1)?,
                    record: record
                        .map(|json| serde_json::from_str::<RemoteRecord>(&json))
                        .transpose()?,
                    occurred_at: occurred_at.and_then(DateTime::<Utc>::from_timestamp_millis),
                },
            });
        }
        Ok(events)
    }

    /// Mark the given events as consumed by a completed run
    pub async fn mark_processed(&self, ids: &[i64], now: i64) -> Result<()> {
        for id in ids {
            self.conn
                .execute(
                    "UPDATE crm_webhook_events SET processed_at = ? WHERE id = ?",
                    params![now, *id],
                )
                .await?;
        }
        Ok(())
    }

    /// Delete processed events older than `cutoff`
    pub async fn delete_processed_before(&self, cutoff: i64) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM crm_webhook_events WHERE processed_at IS NOT NULL AND processed_at < ?",
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
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_list_and_mark() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlWebhookRepository::new(db.connection());
        let connection_id = ConnectionId::new();

        let events = vec![
            RemoteChangeEvent {
                external_id: "1".into(),
                record: None,
                occurred_at: DateTime::<Utc>::from_timestamp_millis(1_000),
            },
            RemoteChangeEvent {
                external_id: "2".into(),
                record: Some(
                    RemoteRecord::new(Some("2".into())).with_property("first_name", json!("Bo")),
                ),
                occurred_at: None,
            },
        ];
        repo.enqueue(&connection_id, &events, 5).await.unwrap();

        let pending = repo.list_pending(&connection_id, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].event, events[0]);
        assert_eq!(pending[1].event, events[1]);

        repo.mark_processed(&[pending[0].id], 6).await.unwrap();
        assert_eq!(repo.list_pending(&connection_id, 10).await.unwrap().len(), 1);
        assert_eq!(repo.delete_processed_before(7).await.unwrap(), 1);
    }
}
