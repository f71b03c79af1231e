pub mod replay;
pub mod tables;

use std::path::Path;

use anyhow::Context;
use stash_core::{ConfigPipeline, MergeTables, ResolvedConfig, StashConfig};
use stash_sync::progress::progress_table;

/// Load a config file and resolve it with the internal progress table merged in.
pub fn load_config(path: &Path) -> anyhow::Result<(StashConfig, ResolvedConfig)> {
    let config = StashConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let resolved = ConfigPipeline::new()
        .with_stage(MergeTables::new("sync-progress", vec![progress_table()]))
        .resolve(config.store_config())?;
    Ok((config, resolved))
}
