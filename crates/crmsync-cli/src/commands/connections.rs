use crmsync_core::models::{
    ConflictPolicy, Connection, ConnectionStatus, NaturalKey, Provider, TenantId,
};
use crmsync_core::providers::{Credential, CredentialVault, FileCredentialVault};

use crate::commands::common::{
    format_connection_line, parse_connection_id, parse_tenant_id, print_json, Context,
};
use crate::error::CliError;

/// Credential material collected from `connections add` flags
pub struct CredentialArgs {
    pub token: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub instance_url: Option<String>,
}

impl CredentialArgs {
    pub fn into_credential(self) -> Result<Credential, CliError> {
        let access_token = self
            .token
            .or(self.access_token)
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or(CliError::MissingCredential)?;

        Ok(Credential {
            access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_at,
            instance_url: self.instance_url,
        })
    }
}

pub fn credential_ref(connection: &Connection) -> String {
    format!("{}/{}", connection.provider, connection.id)
}

pub async fn run_add(
    ctx: &Context,
    provider: Provider,
    tenant: Option<&str>,
    credential: CredentialArgs,
    policy: ConflictPolicy,
    natural_key: NaturalKey,
    as_json: bool,
) -> Result<(), CliError> {
    let tenant_id = tenant.map(parse_tenant_id).transpose()?.unwrap_or_default();
    let credential = credential.into_credential()?;

    let mut connection = Connection::new(tenant_id, provider, "");
    connection.credential_ref = credential_ref(&connection);
    connection.conflict_policy = policy;
    connection.natural_key = natural_key;

    FileCredentialVault::new(ctx.config.credentials_path.clone())
        .store(&connection.credential_ref, &credential)
        .await?;
    ctx.store().add_connection(&connection).await?;
    tracing::info!(
        connection_id = %connection.id,
        provider = %provider,
        "Connection added"
    );

    if as_json {
        print_json(&connection)
    } else {
        println!("{}", connection.id);
        Ok(())
    }
}

pub async fn run_list(ctx: &Context, tenant: Option<&str>, as_json: bool) -> Result<(), CliError> {
    let tenant_id: Option<TenantId> = tenant.map(parse_tenant_id).transpose()?;
    let connections = ctx.store().list_connections(tenant_id.as_ref()).await?;

    if as_json {
        return print_json(&connections);
    }
    if connections.is_empty() {
        println!("No connections configured.");
        return Ok(());
    }
    for connection in &connections {
        println!("{}", format_connection_line(connection));
    }
    Ok(())
}

pub async fn run_configure(
    ctx: &Context,
    id: &str,
    policy: Option<ConflictPolicy>,
    natural_key: Option<NaturalKey>,
) -> Result<(), CliError> {
    let connection_id = parse_connection_id(id)?;
    let mut connection = ctx.store().require_connection(&connection_id).await?;
    if let Some(policy) = policy {
        connection.conflict_policy = policy;
    }
    if let Some(natural_key) = natural_key {
        connection.natural_key = natural_key;
    }
    ctx.store().update_connection(&connection).await?;
    println!("{}", format_connection_line(&connection));
    Ok(())
}

pub async fn run_set_status(
    ctx: &Context,
    id: &str,
    status: ConnectionStatus,
) -> Result<(), CliError> {
    let connection_id = parse_connection_id(id)?;
    let store = ctx.store();
    store.require_connection(&connection_id).await?;
    if status == ConnectionStatus::Active {
        store.set_connection_health(&connection_id, 0, None).await?;
    }
    store.set_connection_status(&connection_id, status, None).await?;
    tracing::info!(connection_id = %connection_id, status = status.as_str(), "Connection status changed");

    println!("{connection_id}  {}", status.as_str());
    Ok(())
}
