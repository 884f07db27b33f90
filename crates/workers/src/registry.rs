//! Hot-reloadable registry over the worker catalog.
//!
//! The registry keeps the current [`WorkerSet`] behind an `Arc` and swaps it
//! atomically on reload, so in-flight dispatches keep the snapshot they
//! started with and new dispatches see the fresh catalog immediately.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::profile::{WorkerProfile, WorkerSet};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read worker profiles at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse worker profiles: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no worker available for capability '{capability}' (language: {language:?})")]
    NoWorker {
        capability: String,
        language: Option<String>,
    },
}

pub struct WorkerRegistry {
    path: PathBuf,
    snapshot: RwLock<Arc<WorkerSet>>,
}

impl WorkerRegistry {
    /// Load the catalog from `path`, seeding the default one when absent.
    pub async fn load(path: PathBuf) -> Result<Self, RegistryError> {
        let set = Self::read_or_seed(&path).await?;
        tracing::info!(
            "Loaded {} worker profile(s) from {}",
            set.workers.len(),
            path.display()
        );
        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(set)),
        })
    }

    /// Registry over an in-memory catalog, not backed by a file.
    pub fn from_set(set: WorkerSet) -> Self {
        Self {
            path: PathBuf::new(),
            snapshot: RwLock::new(Arc::new(set)),
        }
    }

    async fn read_or_seed(path: &Path) -> Result<WorkerSet, RegistryError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let seed = WorkerSet::seed();
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|source| {
                        RegistryError::Io {
                            path: parent.to_path_buf(),
                            source,
                        }
                    })?;
                }
                let pretty = serde_json::to_string_pretty(&seed)?;
                tokio::fs::write(path, pretty)
                    .await
                    .map_err(|source| RegistryError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                tracing::info!("Seeded default worker profiles at {}", path.display());
                Ok(seed)
            }
            Err(source) => Err(RegistryError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Re-read the catalog from disk and swap the snapshot.
    pub async fn reload(&self) -> Result<Arc<WorkerSet>, RegistryError> {
        let set = Arc::new(Self::read_or_seed(&self.path).await?);
        *self.snapshot.write().await = set.clone();
        tracing::info!("Worker registry reloaded ({} profile(s))", set.workers.len());
        Ok(set)
    }

    /// Replace the snapshot without touching disk.
    pub async fn replace(&self, set: WorkerSet) {
        *self.snapshot.write().await = Arc::new(set);
    }

    pub async fn snapshot(&self) -> Arc<WorkerSet> {
        self.snapshot.read().await.clone()
    }

    /// Select a worker for a dispatch. Runs against the current snapshot
    /// every time, so retries observe registry changes.
    pub async fn select(
        &self,
        capability: &str,
        language: Option<&str>,
    ) -> Result<WorkerProfile, RegistryError> {
        self.snapshot()
            .await
            .select(capability, language)
            .cloned()
            .ok_or_else(|| RegistryError::NoWorker {
                capability: capability.to_string(),
                language: language.map(|l| l.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_seeds_missing_catalog_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        let registry = WorkerRegistry::load(path.clone()).await.unwrap();

        assert!(path.exists());
        let picked = registry.select("coding", Some("csharp")).await.unwrap();
        assert_eq!(picked.id, "csharp-coding");
    }

    #[tokio::test]
    async fn reload_swaps_snapshot_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        let registry = WorkerRegistry::load(path.clone()).await.unwrap();

        let replacement = serde_json::json!({
            "workers": [{
                "id": "solo",
                "name": "Solo",
                "capabilities": ["coding"],
                "languages": [],
                "priority": 1
            }]
        });
        tokio::fs::write(&path, replacement.to_string()).await.unwrap();
        registry.reload().await.unwrap();

        let picked = registry.select("coding", Some("csharp")).await.unwrap();
        assert_eq!(picked.id, "solo");
        assert!(registry.select("testing", None).await.is_err());
    }

    #[tokio::test]
    async fn select_reports_missing_capability() {
        let registry = WorkerRegistry::from_set(WorkerSet::seed());
        let err = registry.select("deploying", None).await.unwrap_err();
        match err {
            RegistryError::NoWorker { capability, language } => {
                assert_eq!(capability, "deploying");
                assert_eq!(language, None);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
