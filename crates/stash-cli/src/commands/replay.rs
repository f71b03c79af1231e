use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use stash_core::{RawLogEntry, StashConfig, TableDef};
use stash_store::Stash;
use stash_sync::{HydrationPipeline, MemoryLogSource, ProgressTracker, Snapshot, SyncOptions};
use tracing::info;

pub struct ReplayArgs {
    pub config: PathBuf,
    pub log: PathBuf,
    pub snapshot: Option<PathBuf>,
    pub head: Option<u64>,
    pub save_snapshot: Option<PathBuf>,
}

pub async fn replay(args: ReplayArgs) -> anyhow::Result<()> {
    let (config, resolved) = super::load_config(&args.config)?;

    let stash = build_stash(&config, resolved.tables)?;

    let logs: Vec<RawLogEntry> = read_json(&args.log)?;
    info!(entries = logs.len(), "fixture log loaded");
    let source = MemoryLogSource::with_logs(logs);
    if let Some(head) = args.head {
        source.set_head(head);
    }

    let mut options = SyncOptions::from(&config.sync);
    if let Some(path) = &args.snapshot {
        let snapshot: Snapshot = read_json(path)?;
        info!(block = snapshot.block_number, records = snapshot.records.len(), "snapshot loaded");
        options.initial_state = Some(snapshot);
    }

    let tracker = ProgressTracker::new(stash.clone())?;
    let mut pipeline = HydrationPipeline::new(stash.clone(), source, options).with_progress_tracker(tracker);

    let mut progress = pipeline.progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = progress.borrow_and_update().clone();
            info!(
                step = %current.step,
                percentage = current.percentage,
                block = ?current.last_block_number_processed,
                "{}",
                current.message
            );
        }
    });

    let last = pipeline.hydrate().await?;
    stash.flush();
    drop(pipeline);
    // the sender is gone, so the reporter drains and exits
    reporter.await?;

    let mut out: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for tables in stash.get_tables().into_values() {
        for table in tables.into_values() {
            out.insert(table.id.to_string(), serde_json::to_value(stash.get_records(&table.id))?);
        }
    }
    println!("{}", serde_json::to_string_pretty(&out)?);

    if let Some(path) = &args.save_snapshot {
        let snapshot = Snapshot::capture(&stash, last.unwrap_or(0));
        fs::write(path, serde_json::to_string_pretty(&snapshot)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), block = snapshot.block_number, "snapshot written");
    }
    Ok(())
}

/// A store in the configured flush mode with every resolved table registered.
fn build_stash(config: &StashConfig, tables: Vec<TableDef>) -> anyhow::Result<Stash> {
    let stash = Stash::new(config.store.flush_mode);
    for table in tables {
        stash.register_table(table)?;
    }
    info!(flush_mode = ?config.store.flush_mode, tables = stash.get_tables().len(), "store ready");
    Ok(stash)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> anyhow::Result<T> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}
