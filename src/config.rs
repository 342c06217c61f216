use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Which label-property index backend the storage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    InMemory,
    OnDisk,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DurabilityConfig {
    /// Where snapshots live; `<data_directory>/snapshots` when unset.
    pub snapshot_directory: Option<PathBuf>,
    /// Elements per batch recorded in the snapshot batch tables.
    pub items_per_batch: u64,
    /// How many snapshots to keep after a successful snapshot.
    pub snapshot_retention_count: usize,
    pub recovery_thread_count: usize,
    pub recover_on_startup: bool,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            snapshot_directory: None,
            items_per_batch: 1_000_000,
            snapshot_retention_count: 3,
            recovery_thread_count: num_cpus::get(),
            recover_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ItemsConfig {
    pub properties_on_edges: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub interval_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Called whenever the index or constraint catalog changes so an external
/// plan cache can drop plans built against the old catalog.
#[derive(Clone)]
pub struct PlanCacheInvalidator(Arc<dyn Fn() + Send + Sync>);

impl PlanCacheInvalidator {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn invalidate(&self) {
        (self.0)()
    }
}

impl fmt::Debug for PlanCacheInvalidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PlanCacheInvalidator")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_directory: PathBuf,
    pub storage_mode: StorageMode,
    pub durability: DurabilityConfig,
    pub items: ItemsConfig,
    pub gc: GcConfig,
    #[serde(skip)]
    pub plan_cache_invalidator: Option<PlanCacheInvalidator>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("./lpg_data"),
            storage_mode: StorageMode::default(),
            durability: DurabilityConfig::default(),
            items: ItemsConfig::default(),
            gc: GcConfig::default(),
            plan_cache_invalidator: None,
        }
    }
}

impl Config {
    /// A default configuration rooted at `data_directory`.
    pub fn with_data_directory(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            ..Self::default()
        }
    }

    pub fn snapshot_directory(&self) -> PathBuf {
        self.durability
            .snapshot_directory
            .clone()
            .unwrap_or_else(|| self.data_directory.join("snapshots"))
    }

    /// Directory of the RocksDB instance backing the on-disk index.
    pub fn index_directory(&self) -> PathBuf {
        self.data_directory.join("label_property_index")
    }

    pub(crate) fn invalidate_plan_cache(&self) {
        if let Some(invalidator) = &self.plan_cache_invalidator {
            invalidator.invalidate();
        }
    }
}
