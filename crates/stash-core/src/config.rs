//! stash.toml configuration and the config stage pipeline.

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, SchemaError};
use crate::kind::PrimitiveKind;
use crate::table::{FieldSpec, TableDef, TableId};

/// When buffered store notifications are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Flush on the ambient tokio runtime: after the writing task yields on a
    /// current-thread runtime, at `end_tick` on a multi-threaded one.
    #[default]
    Runtime,
    /// Flush only on an explicit `flush()` call.
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StashConfig {
    pub store: StoreSection,
    pub sync: SyncSection,
    pub namespaces: Vec<NamespaceConfig>,
    /// Free-form tables consumed by config stages.
    pub extensions: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub flush_mode: FlushMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub start_block: u64,
    pub max_block_range: u64,
    pub enable_chunking: bool,
    /// Maximum range fetches in flight during catch-up.
    pub prefetch: usize,
    pub retry: RetrySection,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            start_block: 0,
            max_block_range: 1000,
            enable_chunking: true,
            prefetch: 4,
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default)]
    pub tables: IndexMap<String, TableConfig>,
}

/// One table as written in the config file. Field order is declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub schema: IndexMap<String, String>,
    #[serde(default)]
    pub key: Vec<String>,
}

impl TableConfig {
    pub fn to_table_def(&self, namespace: &str, name: &str) -> Result<TableDef, SchemaError> {
        let schema = self
            .schema
            .iter()
            .map(|(field, kind)| {
                Ok(FieldSpec {
                    name: field.clone(),
                    kind: kind.parse::<PrimitiveKind>()?,
                })
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;
        TableDef::new(TableId::new(namespace, name), schema, self.key.clone())
    }

    pub fn from_table_def(table: &TableDef) -> Self {
        Self {
            schema: table
                .schema
                .iter()
                .map(|f| (f.name.clone(), f.kind.to_string()))
                .collect(),
            key: table.key.clone(),
        }
    }
}

impl StashConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: StashConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The part of the config that flows through the stage pipeline.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            namespaces: self.namespaces.clone(),
            extensions: self.extensions.clone(),
        }
    }
}

// ── Stage pipeline ─────────────────────────────────────────────

/// The record passed between config stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreConfig {
    pub namespaces: Vec<NamespaceConfig>,
    pub extensions: BTreeMap<String, toml::Value>,
}

impl StoreConfig {
    /// Every configured table, validated.
    pub fn tables(&self) -> Result<Vec<TableDef>, SchemaError> {
        let mut tables = Vec::new();
        for ns in &self.namespaces {
            for (name, table) in &ns.tables {
                tables.push(table.to_table_def(&ns.name, name)?);
            }
        }
        Ok(tables)
    }

    /// Add a table, merging into an existing namespace entry when present.
    pub fn insert_table(&mut self, table: &TableDef) {
        let config = TableConfig::from_table_def(table);
        match self
            .namespaces
            .iter_mut()
            .find(|ns| ns.name == table.id.namespace)
        {
            Some(ns) => {
                ns.tables.insert(table.id.name.clone(), config);
            }
            None => {
                let mut tables = IndexMap::new();
                tables.insert(table.id.name.clone(), config);
                self.namespaces.push(NamespaceConfig {
                    name: table.id.namespace.clone(),
                    tables,
                });
            }
        }
    }
}

/// One step of config extension: receives the store config and returns it, extended.
pub trait ConfigStage {
    fn name(&self) -> &str;
    fn apply(&self, config: StoreConfig) -> Result<StoreConfig, ConfigError>;
}

/// Output of a resolved pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub tables: Vec<TableDef>,
    pub extensions: BTreeMap<String, toml::Value>,
}

/// Ordered list of config stages, validated at every boundary.
#[derive(Default)]
pub struct ConfigPipeline {
    stages: Vec<Box<dyn ConfigStage + Send + Sync>>,
}

impl ConfigPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl ConfigStage + Send + Sync + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order.
    ///
    /// The input is validated first; after each stage the output is
    /// validated again and a failure names the stage that produced it.
    pub fn resolve(&self, config: StoreConfig) -> Result<ResolvedConfig, ConfigError> {
        check_tables(&config)?;
        let mut config = config;
        for stage in &self.stages {
            config = stage.apply(config)?;
            check_tables(&config).map_err(|source| ConfigError::StageOutput {
                stage: stage.name().to_string(),
                source,
            })?;
            debug!(stage = stage.name(), "config stage applied");
        }
        Ok(ResolvedConfig {
            tables: check_tables(&config)?,
            extensions: config.extensions,
        })
    }
}

impl std::fmt::Debug for ConfigPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("ConfigPipeline").field("stages", &names).finish()
    }
}

fn check_tables(config: &StoreConfig) -> Result<Vec<TableDef>, SchemaError> {
    let tables = config.tables()?;
    for (i, table) in tables.iter().enumerate() {
        if tables[..i].iter().any(|t| t.id == table.id) {
            return Err(SchemaError::Mismatch {
                table: table.id.clone(),
            });
        }
    }
    Ok(tables)
}

/// Stage that adds a fixed set of tables.
#[derive(Debug, Clone)]
pub struct MergeTables {
    name: String,
    tables: Vec<TableDef>,
}

impl MergeTables {
    pub fn new(name: impl Into<String>, tables: Vec<TableDef>) -> Self {
        Self {
            name: name.into(),
            tables,
        }
    }
}

impl ConfigStage for MergeTables {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, mut config: StoreConfig) -> Result<StoreConfig, ConfigError> {
        for table in &self.tables {
            config.insert_table(table);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[store]
flush_mode = "manual"

[sync]
start_block = 100
max_block_range = 50
prefetch = 2

[sync.retry]
max_attempts = 3

[[namespaces]]
name = "namespace1"

[namespaces.tables.table1]
schema = { field2 = "uint32", field1 = "string" }
key = ["field2"]

[namespaces.tables.counter]
schema = { value = "uint64" }
"#;

    #[test]
    fn parse_sample_config() {
        let config = StashConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.store.flush_mode, FlushMode::Manual);
        assert_eq!(config.sync.start_block, 100);
        assert_eq!(config.sync.max_block_range, 50);
        assert!(config.sync.enable_chunking);
        assert_eq!(config.sync.retry.max_attempts, 3);
        assert_eq!(config.sync.retry.initial_backoff_ms, 250);

        let tables = config.store_config().tables().unwrap();
        assert_eq!(tables.len(), 2);
        let names: Vec<_> = tables[0].schema.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["field2", "field1"]);
        assert_eq!(tables[0].key, ["field2"]);
        assert!(tables[1].key.is_empty());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = StashConfig::from_toml_str("").unwrap();
        assert_eq!(config.store.flush_mode, FlushMode::Runtime);
        assert_eq!(config.sync, SyncSection::default());
        assert!(config.namespaces.is_empty());
    }

    #[test]
    fn unknown_kind_is_a_schema_error() {
        let config = StashConfig::from_toml_str(
            r#"
[[namespaces]]
name = "ns"
[namespaces.tables.t]
schema = { a = "float" }
"#,
        )
        .unwrap();
        let err = ConfigPipeline::new().resolve(config.store_config()).unwrap_err();
        assert!(matches!(err, ConfigError::Schema(SchemaError::InvalidKind(_))));
    }

    #[test]
    fn pipeline_applies_stages_in_order() {
        let extra = TableDef::from_abi("sync", "SyncProgress", &[("step", "string")], &[]).unwrap();
        let pipeline = ConfigPipeline::new().with_stage(MergeTables::new("internal", vec![extra]));
        let config = StashConfig::from_toml_str(SAMPLE).unwrap();
        let resolved = pipeline.resolve(config.store_config()).unwrap();
        assert_eq!(resolved.tables.len(), 3);
        assert_eq!(resolved.tables[2].id, TableId::new("sync", "SyncProgress"));
    }

    struct Breaks;

    impl ConfigStage for Breaks {
        fn name(&self) -> &str {
            "breaks"
        }

        fn apply(&self, mut config: StoreConfig) -> Result<StoreConfig, ConfigError> {
            config.namespaces.push(NamespaceConfig {
                name: "ns".into(),
                tables: IndexMap::from([(
                    "bad".to_string(),
                    TableConfig {
                        schema: IndexMap::from([("a".to_string(), "string".to_string())]),
                        key: vec!["a".into()],
                    },
                )]),
            });
            Ok(config)
        }
    }

    #[test]
    fn pipeline_names_the_stage_that_broke_the_config() {
        let pipeline = ConfigPipeline::new().with_stage(Breaks);
        let err = pipeline.resolve(StoreConfig::default()).unwrap_err();
        match err {
            ConfigError::StageOutput { stage, source } => {
                assert_eq!(stage, "breaks");
                assert!(matches!(source, SchemaError::DynamicKeyField { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
