//! Host platform contact repository

use std::collections::BTreeMap;

use chrono::NaiveDate;
use libsql::{params, Connection, Row};

use super::{json_column, parse_column, parse_optional_column};
use crate::error::{Error, Result};
use crate::models::{Contact, ContactId, NaturalKey, TenantId};
use crate::util::{normalize_email, normalize_phone};

const CONTACT_COLUMNS: &str = "id, tenant_id, first_name, last_name, email, phones, company, \
     job_title, lifecycle_stage, birthday, custom_fields, created_at, updated_at, is_deleted";

/// Trait for host contact storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ContactRepository {
    /// Get a contact by ID, including soft-deleted rows
    async fn get(&self, id: &ContactId) -> Result<Option<Contact>>;

    /// Contacts of a tenant updated at or after `since`; all contacts when `since` is `None`
    async fn list_changed_since(&self, tenant: &TenantId, since: Option<i64>)
        -> Result<Vec<Contact>>;

    /// Live contacts whose natural key matches the given (already normalized) value
    async fn find_by_natural_key(
        &self,
        tenant: &TenantId,
        key: NaturalKey,
        value: &str,
    ) -> Result<Vec<Contact>>;

    /// Insert a new contact
    async fn insert(&self, contact: &Contact) -> Result<()>;

    /// Overwrite a contact's fields, including `updated_at`
    async fn update(&self, contact: &Contact) -> Result<()>;

    /// Soft delete a contact
    async fn delete(&self, id: &ContactId) -> Result<()>;
}

/// libSQL implementation of `ContactRepository`
pub struct LibSqlContactRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlContactRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a contact from a database row
    fn parse_contact(row: &Row) -> Result<Contact> {
        let id: String = row.get(0)?;
        let tenant_id: String = row.get(1)?;
        let phones: String = row.get(5)?;
        let birthday: Option<String> = row.get(9)?;
        let custom_fields: String = row.get(10)?;

        Ok(Contact {
            id: parse_column(&id, "contact id")?,
            tenant_id: parse_column(&tenant_id, "tenant id")?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            email: row.get(4)?,
            phones: json_column(&phones)?,
            company: row.get(6)?,
            job_title: row.get(7)?,
            lifecycle_stage: row.get(8)?,
            birthday: parse_optional_column::<NaiveDate>(birthday, "birthday")?,
            custom_fields: json_column::<BTreeMap<String, String>>(&custom_fields)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            is_deleted: row.get::<i32>(13)? != 0,
        })
    }

    async fn query_contacts(&self, sql: &str, params: Vec<libsql::Value>) -> Result<Vec<Contact>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut contacts = Vec::new();
        while let Some(row) = rows.next().await? {
            contacts.push(Self::parse_contact(&row)?);
        }
        Ok(contacts)
    }
}

impl ContactRepository for LibSqlContactRepository<'_> {
    async fn get(&self, id: &ContactId) -> Result<Option<Contact>> {
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?");
        let mut rows = self.conn.query(&sql, [id.as_str()]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_contact(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_changed_since(
        &self,
        tenant: &TenantId,
        since: Option<i64>,
    ) -> Result<Vec<Contact>> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE tenant_id = ? AND updated_at >= ?
             ORDER BY updated_at ASC, id ASC"
        );
        self.query_contacts(
            &sql,
            vec![tenant.as_str().into(), since.unwrap_or(i64::MIN).into()],
        )
        .await
    }

    async fn find_by_natural_key(
        &self,
        tenant: &TenantId,
        key: NaturalKey,
        value: &str,
    ) -> Result<Vec<Contact>> {
        match key {
            NaturalKey::Email => {
                let Some(email) = normalize_email(value) else {
                    return Ok(Vec::new());
                };
                let sql = format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts
                     WHERE tenant_id = ? AND is_deleted = 0 AND lower(trim(email)) = ?
                     ORDER BY created_at ASC"
                );
                self.query_contacts(&sql, vec![tenant.as_str().into(), email.into()])
                    .await
            }
            NaturalKey::Phone => {
                let Some(digits) = normalize_phone(value) else {
                    return Ok(Vec::new());
                };
                // Phones are stored as entered, so compare on normalized digits
                let sql = format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts
                     WHERE tenant_id = ? AND is_deleted = 0 AND phones != '[]'
                     ORDER BY created_at ASC"
                );
                let candidates = self
                    .query_contacts(&sql, vec![tenant.as_str().into()])
                    .await?;
                Ok(candidates
                    .into_iter()
                    .filter(|contact| {
                        contact
                            .natural_keys(NaturalKey::Phone)
                            .iter()
                            .any(|phone| *phone == digits)
                    })
                    .collect())
            }
        }
    }

    async fn insert(&self, contact: &Contact) -> Result<()> {
        let sql = format!(
            "INSERT INTO contacts ({CONTACT_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        self.conn
            .execute(
                &sql,
                params![
                    contact.id.as_str(),
                    contact.tenant_id.as_str(),
                    contact.first_name.clone(),
                    contact.last_name.clone(),
                    contact.email.clone(),
                    serde_json::to_string(&contact.phones)?,
                    contact.company.clone(),
                    contact.job_title.clone(),
                    contact.lifecycle_stage.clone(),
                    contact.birthday.map(|date| date.to_string()),
                    serde_json::to_string(&contact.custom_fields)?,
                    contact.created_at,
                    contact.updated_at,
                    i32::from(contact.is_deleted)
                ],
            )
            .await?;
        Ok(())
    }

    async fn update(&self, contact: &Contact) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE contacts SET
                    first_name = ?, last_name = ?, email = ?, phones = ?, company = ?,
                    job_title = ?, lifecycle_stage = ?, birthday = ?, custom_fields = ?,
                    updated_at = ?, is_deleted = ?
                 WHERE id = ?",
                params![
                    contact.first_name.clone(),
                    contact.last_name.clone(),
                    contact.email.clone(),
                    serde_json::to_string(&contact.phones)?,
                    contact.company.clone(),
                    contact.job_title.clone(),
                    contact.lifecycle_stage.clone(),
                    contact.birthday.map(|date| date.to_string()),
                    serde_json::to_string(&contact.custom_fields)?,
                    contact.updated_at,
                    i32::from(contact.is_deleted),
                    contact.id.as_str()
                ],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(contact.id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &ContactId) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .conn
            .execute(
                "UPDATE contacts SET is_deleted = 1, updated_at = ? WHERE id = ? AND is_deleted = 0",
                params![now, id.as_str()],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    fn sample(tenant: TenantId, email: &str, updated_at: i64) -> Contact {
        let mut contact = Contact::new(tenant);
        contact.first_name = Some("Ada".into());
        contact.email = Some(email.into());
        contact.phones = vec!["+1 555 010 9999".into()];
        contact.birthday = NaiveDate::from_ymd_opt(1990, 4, 2);
        contact.custom_fields.insert("tier".into(), "gold".into());
        contact.updated_at = updated_at;
        contact
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get_roundtrip() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlContactRepository::new(db.connection());
        let contact = sample(TenantId::new(), "ada@example.com", 10);

        repo.insert(&contact).await.unwrap();
        let loaded = repo.get(&contact.id).await.unwrap().unwrap();
        assert_eq!(loaded, contact);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_changed_since_filters_by_tenant_and_time() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlContactRepository::new(db.connection());
        let tenant = TenantId::new();

        let old = sample(tenant, "old@example.com", 100);
        let new = sample(tenant, "new@example.com", 200);
        let other = sample(TenantId::new(), "other@example.com", 300);
        for contact in [&old, &new, &other] {
            repo.insert(contact).await.unwrap();
        }

        let changed = repo.list_changed_since(&tenant, Some(200)).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, new.id);

        let all = repo.list_changed_since(&tenant, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_find_by_natural_key() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlContactRepository::new(db.connection());
        let tenant = TenantId::new();
        let contact = sample(tenant, "Ada@Example.com", 1);
        repo.insert(&contact).await.unwrap();

        let by_email = repo
            .find_by_natural_key(&tenant, NaturalKey::Email, " ada@example.COM")
            .await
            .unwrap();
        assert_eq!(by_email.len(), 1);

        let by_phone = repo
            .find_by_natural_key(&tenant, NaturalKey::Phone, "(555) 010-9999")
            .await
            .unwrap();
        assert!(by_phone.is_empty());

        let by_phone = repo
            .find_by_natural_key(&tenant, NaturalKey::Phone, "+15550109999")
            .await
            .unwrap();
        assert_eq!(by_phone.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deleted_contacts_do_not_match() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlContactRepository::new(db.connection());
        let tenant = TenantId::new();
        let contact = sample(tenant, "gone@example.com", 1);
        repo.insert(&contact).await.unwrap();
        repo.delete(&contact.id).await.unwrap();

        let found = repo
            .find_by_natural_key(&tenant, NaturalKey::Email, "gone@example.com")
            .await
            .unwrap();
        assert!(found.is_empty());
        assert!(repo.get(&contact.id).await.unwrap().unwrap().is_deleted);
        assert!(repo.delete(&contact.id).await.is_err());
    }
}
