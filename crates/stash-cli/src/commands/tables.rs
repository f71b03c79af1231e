use std::path::Path;

use serde_json::json;

pub fn tables(config: &Path, format: &str) -> anyhow::Result<()> {
    let (_, resolved) = super::load_config(config)?;

    match format {
        "json" => {
            let tables: Vec<_> = resolved
                .tables
                .iter()
                .map(|table| {
                    json!({
                        "id": table.id.to_string(),
                        "resourceId": format!("0x{}", hex::encode(table.id.resource_id())),
                        "schema": table.schema,
                        "key": table.key,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&tables)?);
        }
        "text" => {
            for table in &resolved.tables {
                println!("{}  0x{}", table.id, hex::encode(table.id.resource_id()));
                for field in &table.schema {
                    let marker = if table.is_key(&field.name) { " (key)" } else { "" };
                    println!("    {}: {}{marker}", field.name, field.kind);
                }
            }
            println!("{} table(s)", resolved.tables.len());
        }
        other => anyhow::bail!("unknown format: {other} (expected text or json)"),
    }
    Ok(())
}
