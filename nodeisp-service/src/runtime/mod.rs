//! Container runtime gateway.
//!
//! The manager talks to the container runtime only through the
//! [`ContainerRuntime`] trait. [`DockerRuntime`] implements it on top of the
//! Docker Engine API; tests inject an in-memory fake.

pub mod docker;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::descriptor::{Mount, PortBindings};
use crate::error::RuntimeError;
use crate::labels::{ContainerQuery, HASH_LABEL};

pub use docker::DockerRuntime;

/// Raw combined stdout/stderr of a container or exec session.
pub type OutputStream = BoxStream<'static, Result<Vec<u8>, RuntimeError>>;

/// Lifecycle state of a runtime container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

impl ContainerState {
    pub fn parse(state: &str) -> Self {
        match state {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            other => ContainerState::Unknown(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// A container as reported by the runtime.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub state: ContainerState,
    pub created: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    pub fn hash(&self) -> Option<&str> {
        self.labels.get(HASH_LABEL).map(String::as_str)
    }
}

/// Everything needed to create a service container. Containers are always
/// created with the `unless-stopped` restart policy.
#[derive(Debug, Clone)]
pub struct CreateContainer {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub entrypoint: Vec<String>,
    pub exposed_ports: BTreeSet<String>,
    pub labels: HashMap<String, String>,
    pub network: String,
    pub mounts: Vec<Mount>,
    pub port_bindings: PortBindings,
    pub platform: Option<String>,
}

/// Narrow interface to the container runtime.
///
/// Implementations must be safe for concurrent use by several convergence
/// passes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// ID of the first network carrying `label` (`key=value`).
    async fn find_network(&self, label: &str) -> Result<Option<String>, RuntimeError>;

    /// Create a network and return its ID.
    async fn create_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<String, RuntimeError>;

    /// All containers matching `query`, including stopped ones.
    async fn list_containers(
        &self,
        query: &ContainerQuery,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Pull an image, optionally pinned to an `os/arch` platform. Resolves
    /// once the pull has completed.
    async fn pull_image(&self, image: &str, platform: Option<&str>) -> Result<(), RuntimeError>;

    /// Create a container and return its ID.
    async fn create_container(&self, spec: &CreateContainer) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Remove a container, killing it if still running.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Attach to the combined stdout/stderr, including past output.
    async fn attach_output(&self, id: &str) -> Result<OutputStream, RuntimeError>;

    /// Resolves with the exit code once the container is no longer running.
    /// The returned future owns everything it needs so it can be spawned.
    fn wait_not_running(&self, id: &str) -> BoxFuture<'static, Result<i64, RuntimeError>>;

    /// Create and attach an exec session running `cmd` in `container`
    /// (ID or name).
    async fn exec(&self, container: &str, cmd: &[String]) -> Result<OutputStream, RuntimeError>;
}
