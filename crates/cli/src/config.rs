//! Server configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use coursetrack_progress::ProgressConfig;
use coursetrack_storage::{CourseStore, LedgerStore, MemoryStorage};
use serde::{Deserialize, Serialize};

/// Ledger backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Nothing survives a restart
    Memory,
    /// One JSON file per event under the data dir
    Json,
    /// SQLite database in the data dir (feature `sqlite`)
    Sqlite,
}

/// Everything `coursetrack serve` needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,

    /// Where the ledger, snapshots and imported courses live
    pub data_dir: PathBuf,

    /// Course structure files imported at startup
    pub course_dir: Option<PathBuf>,

    /// Ledger backend
    pub storage: StorageBackend,

    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,

    /// Progress engine settings
    pub progress: ProgressConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("coursetrack-data"),
            course_dir: None,
            storage: StorageBackend::Json,
            log_level: "info".to_string(),
            progress: ProgressConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Opened storage, split by concern.
pub struct Backend {
    /// Event ledger and snapshot cache
    pub ledger: Arc<dyn LedgerStore>,
    /// Imported courses
    pub courses: Arc<dyn CourseStore>,
}

/// Open the configured backend.
pub async fn open_backend(config: &ServerConfig) -> Result<Backend> {
    match config.storage {
        StorageBackend::Memory => {
            let storage = Arc::new(MemoryStorage::new());
            Ok(Backend {
                ledger: storage.clone(),
                courses: storage,
            })
        }
        StorageBackend::Json => open_json(config).await,
        StorageBackend::Sqlite => open_sqlite(config).await,
    }
}

#[cfg(feature = "json")]
async fn open_json(config: &ServerConfig) -> Result<Backend> {
    let storage = Arc::new(
        coursetrack_storage::JsonStorage::new(&config.data_dir)
            .await
            .with_context(|| format!("opening {}", config.data_dir.display()))?,
    );
    Ok(Backend {
        ledger: storage.clone(),
        courses: storage,
    })
}

#[cfg(not(feature = "json"))]
async fn open_json(_config: &ServerConfig) -> Result<Backend> {
    anyhow::bail!("this build has no JSON storage; rebuild with --features json")
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(config: &ServerConfig) -> Result<Backend> {
    std::fs::create_dir_all(&config.data_dir)?;
    let path = config.data_dir.join("coursetrack.db");
    let storage = Arc::new(
        coursetrack_storage::SqliteStorage::new_from_path(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?,
    );
    Ok(Backend {
        ledger: storage.clone(),
        courses: storage,
    })
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_config: &ServerConfig) -> Result<Backend> {
    anyhow::bail!("this build has no SQLite support; rebuild with --features sqlite")
}
