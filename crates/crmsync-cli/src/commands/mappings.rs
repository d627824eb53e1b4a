use std::path::Path;

use crmsync_core::mapping::{default_mappings, FieldMapping};
use crmsync_core::models::Provider;

use crate::commands::common::{parse_connection_id, print_json, Context};
use crate::error::CliError;

pub fn format_mapping_line(mapping: &FieldMapping) -> String {
    let transform = mapping.transform.map_or("-", |transform| transform.as_str());
    let mut line = format!(
        "{:<24} {:<28} {:<13} {:<24} {}",
        mapping.local_path,
        mapping.remote_key,
        mapping.direction.as_str(),
        transform,
        mapping.origin.as_str()
    );
    if !mapping.enabled {
        line.push_str("  (disabled)");
    }
    line
}

pub async fn run_show(ctx: &Context, connection: &str, as_json: bool) -> Result<(), CliError> {
    let connection_id = parse_connection_id(connection)?;
    ctx.store().require_connection(&connection_id).await?;
    let mappings = ctx.store().load_mappings(&connection_id).await?;

    if as_json {
        return print_json(mappings.rows());
    }
    for mapping in mappings.rows() {
        println!("{}", format_mapping_line(mapping));
    }
    Ok(())
}

pub fn parse_mapping_file(contents: &str) -> Result<Vec<FieldMapping>, CliError> {
    serde_json::from_str(contents).map_err(|error| CliError::InvalidMappingFile(error.to_string()))
}

pub async fn run_import(ctx: &Context, connection: &str, file: &Path) -> Result<(), CliError> {
    let connection_id = parse_connection_id(connection)?;
    ctx.store().require_connection(&connection_id).await?;
    let rows = parse_mapping_file(&std::fs::read_to_string(file)?)?;

    let saved = ctx.store().replace_mappings(&connection_id, rows).await?;
    tracing::info!(
        connection_id = %connection_id,
        rows = saved.rows().len(),
        "Mappings replaced"
    );
    println!("{} mapping rows saved", saved.rows().len());
    Ok(())
}

pub fn run_defaults(provider: Provider) -> Result<(), CliError> {
    print_json(&default_mappings(provider))
}
