//! Persisted manager state.
//!
//! The snapshot is written after every convergence pass so that a restart
//! resumes with the images and ports chosen in the previous run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::descriptor::ServiceDescriptor;
use crate::error::StateError;

/// Serialized form of the manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// ID of the private network.
    #[serde(default)]
    pub network: String,
    /// Directory holding per-service log files.
    #[serde(default)]
    pub logdir: PathBuf,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDescriptor>,
}

/// JSON state file on disk.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. `Ok(None)` when no state has been written yet.
    pub async fn load(&self) -> Result<Option<StateSnapshot>, StateError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: StateSnapshot = serde_json::from_slice(&data)?;
        debug!(path = %self.path.display(), services = snapshot.services.len(), "Loaded state");
        Ok(Some(snapshot))
    }

    /// Write the snapshot via a temporary file and rename, so a crash never
    /// leaves a truncated state file behind.
    pub async fn store(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        let data = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), "Stored state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Mount, PortBinding, PortBindings};

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("data").join("state.json"));

        let postgres = ServiceDescriptor::new("postgres", "postgres:16")
            .with_env(["POSTGRES_USER=postgres"])
            .with_mounts(vec![Mount::bind("/srv/pg", "/var/lib/postgresql/data")])
            .with_port_bindings(PortBindings::from([(
                "5432/tcp".to_string(),
                vec![PortBinding::loopback(8432)],
            )]));
        let hash = postgres.content_hash().to_string();

        let snapshot = StateSnapshot {
            network: "net123".to_string(),
            logdir: PathBuf::from("/var/log/node-isp"),
            services: BTreeMap::from([("postgres".to_string(), postgres)]),
        };
        store.store(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.network, "net123");
        assert_eq!(loaded.logdir, PathBuf::from("/var/log/node-isp"));
        let pg = &loaded.services["postgres"];
        assert_eq!(pg.image(), "postgres:16");
        assert_eq!(pg.host_port("5432/tcp"), Some(8432));
        assert_eq!(pg.content_hash(), hash);
        assert!(!dir.path().join("data").join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let err = StateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StateError::Json(_)));
    }
}
