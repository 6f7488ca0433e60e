//! Service manager - converges runtime containers to service descriptors.
//!
//! For every service the manager lists the containers carrying the
//! service's labels, keeps the one whose hash label matches the descriptor,
//! removes all others and creates/starts the target if needed. Stale
//! containers are replaced outright; there is no rolling replacement.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::descriptor::ServiceDescriptor;
use crate::error::{Result, ServiceError};
use crate::exec::{self, CommandHandle};
use crate::labels::{self, ContainerQuery, NETWORK_NAME};
use crate::logfile::LogFile;
use crate::runtime::{ContainerRuntime, ContainerSummary, CreateContainer};
use crate::state::StateSnapshot;
use crate::streamer::{self, StreamerHandle, StreamerState};

/// Upper bound for a single convergence pass.
pub const RECONCILE_TIMEOUT: Duration = Duration::from_secs(180);

/// Last known exit state of a service's target container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    Running,
    Exited(i64),
    /// The wait itself failed, so the exit went unobserved.
    WaitFailed(String),
}

/// Point-in-time view of one managed service.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: String,
    pub image: String,
    pub runtime_name: String,
    pub container_id: Option<String>,
    pub exit: Option<ExitState>,
    pub output: Option<StreamerState>,
}

struct Attachment {
    streamer: StreamerHandle,
    exit: watch::Receiver<ExitState>,
    exit_task: JoinHandle<()>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.exit_task.abort();
    }
}

struct ManagedService {
    descriptor: ServiceDescriptor,
    log: Option<Arc<LogFile>>,
    attachment: Option<Attachment>,
}

impl ManagedService {
    fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            log: None,
            attachment: None,
        }
    }
}

/// Owns the private network and the set of managed services.
pub struct Manager {
    runtime: Arc<dyn ContainerRuntime>,
    log_dir: PathBuf,
    network_id: String,
    reconcile_timeout: Duration,
    services: Mutex<HashMap<String, ManagedService>>,
}

impl Manager {
    /// Create a manager, adopting the labelled network or creating it.
    pub async fn new(runtime: Arc<dyn ContainerRuntime>, log_dir: impl Into<PathBuf>) -> Result<Self> {
        let network_id = match runtime.find_network(&labels::group_filter()).await? {
            Some(id) => {
                info!(network = %id, "Using network");
                id
            }
            None => {
                let id = runtime
                    .create_network(NETWORK_NAME, labels::network_labels())
                    .await?;
                info!(network = %id, "Created network");
                id
            }
        };

        Ok(Self {
            runtime,
            log_dir: log_dir.into(),
            network_id,
            reconcile_timeout: RECONCILE_TIMEOUT,
            services: Mutex::new(HashMap::new()),
        })
    }

    /// Override the deadline of a convergence pass.
    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn log_path(&self, service: &str) -> PathBuf {
        self.log_dir.join(format!("{service}.log"))
    }

    /// Populate services from a persisted snapshot. Services already known
    /// to the manager are left alone. The live network always wins over the
    /// recorded one.
    pub async fn restore(&self, snapshot: StateSnapshot) {
        if !snapshot.network.is_empty() && snapshot.network != self.network_id {
            warn!(
                recorded = %snapshot.network,
                live = %self.network_id,
                "Recorded network differs from live network"
            );
        }

        let mut services = self.services.lock().await;
        for (name, descriptor) in snapshot.services {
            if descriptor.name() != name {
                warn!(key = %name, name = %descriptor.name(), "Skipping mismatched service in state");
                continue;
            }
            services
                .entry(name)
                .or_insert_with(|| ManagedService::new(descriptor));
        }
        info!(services = services.len(), "Restored services from state");
    }

    /// Current descriptor registered under `name`.
    pub async fn service(&self, name: &str) -> Option<ServiceDescriptor> {
        let services = self.services.lock().await;
        services.get(name).map(|s| s.descriptor.clone())
    }

    /// Snapshot of the network, log directory and all descriptors.
    pub async fn snapshot(&self) -> StateSnapshot {
        let services = self.services.lock().await;
        StateSnapshot {
            network: self.network_id.clone(),
            logdir: self.log_dir.clone(),
            services: services
                .iter()
                .map(|(name, s)| (name.clone(), s.descriptor.clone()))
                .collect(),
        }
    }

    /// Register `descriptor` and converge its container.
    ///
    /// Returns once the target container is running and its output
    /// attachment has been attempted. The pass is bounded by the reconcile
    /// timeout; on expiry whatever the runtime already did is left in place
    /// for the next pass to pick up.
    pub async fn ensure_service(&self, descriptor: ServiceDescriptor) -> Result<()> {
        let name = descriptor.name().to_string();
        // Hash before anything reaches the runtime.
        let hash = descriptor.content_hash().to_string();

        let log = {
            let mut services = self.services.lock().await;
            let existing = services.get(&name).and_then(|s| s.log.clone());
            let log = match existing {
                Some(log) => log,
                None => {
                    let path = self.log_path(&name);
                    let file = LogFile::open(&path)
                        .await
                        .map_err(|source| ServiceError::LogFile { path, source })?;
                    Arc::new(file)
                }
            };

            let entry = services
                .entry(name.clone())
                .or_insert_with(|| ManagedService::new(descriptor.clone()));
            entry.descriptor = descriptor.clone();
            entry.log = Some(Arc::clone(&log));
            log
        };

        debug!(service = %name, hash = %hash, "Ensuring service");

        match tokio::time::timeout(self.reconcile_timeout, self.reconcile(&descriptor, log)).await
        {
            Ok(result) => result,
            Err(_) => {
                error!(service = %name, "Reconcile timed out");
                Err(ServiceError::Timeout {
                    service: name,
                    timeout: self.reconcile_timeout,
                })
            }
        }
    }

    async fn reconcile(&self, descriptor: &ServiceDescriptor, log: Arc<LogFile>) -> Result<()> {
        let name = descriptor.name();
        let hash = descriptor.content_hash();

        let containers = self
            .runtime
            .list_containers(&ContainerQuery::service(name))
            .await?;

        let target = containers.iter().find(|c| c.hash() == Some(hash)).cloned();
        if let Some(t) = &target {
            info!(service = %name, container = %t.id, state = %t.state, "Found existing container");
        }

        for stale in containers
            .iter()
            .filter(|c| target.as_ref().is_none_or(|t| t.id != c.id))
        {
            self.remove_stale(name, stale).await;
        }

        let (id, running) = match target {
            Some(t) => (t.id, t.state.is_running()),
            None => (self.create(descriptor).await?, false),
        };

        if !running {
            info!(service = %name, container = %id, "Starting container");
            self.runtime.start_container(&id).await?;
        }

        self.observe(name, &id, log).await;
        Ok(())
    }

    /// Stop (if running) and force-remove a stale container. Failures are
    /// logged and never abort the pass.
    async fn remove_stale(&self, service: &str, container: &ContainerSummary) {
        if container.state.is_running() {
            if let Err(e) = self.runtime.stop_container(&container.id).await {
                error!(service = %service, container = %container.id, error = %e, "Failed to stop container");
            }
        }

        match self.runtime.remove_container(&container.id).await {
            Ok(()) => info!(service = %service, container = %container.id, "Removed old container"),
            Err(e) => {
                error!(service = %service, container = %container.id, error = %e, "Failed to remove container")
            }
        }
    }

    async fn create(&self, descriptor: &ServiceDescriptor) -> Result<String> {
        let name = descriptor.name();

        info!(service = %name, image = %descriptor.image(), platform = ?descriptor.platform(), "Pulling image");
        self.runtime
            .pull_image(descriptor.image(), descriptor.platform())
            .await?;

        let spec = CreateContainer {
            name: descriptor.runtime_name(),
            image: descriptor.image().to_string(),
            env: descriptor.env().to_vec(),
            entrypoint: descriptor.entrypoint().to_vec(),
            exposed_ports: descriptor.exposed_ports().clone(),
            labels: labels::container_labels(name, descriptor.content_hash()),
            network: self.network_id.clone(),
            mounts: descriptor.mounts().to_vec(),
            port_bindings: descriptor.port_bindings().clone(),
            platform: descriptor.platform().map(str::to_string),
        };

        info!(service = %name, container = %spec.name, "Creating container");
        let id = self.runtime.create_container(&spec).await?;
        Ok(id)
    }

    /// Register the exit watcher and attach the log streamer, unless the
    /// target already has a live streamer from an earlier pass.
    async fn observe(&self, service: &str, container_id: &str, log: Arc<LogFile>) {
        {
            let services = self.services.lock().await;
            let live = services
                .get(service)
                .and_then(|s| s.attachment.as_ref())
                .is_some_and(|a| {
                    a.streamer.container_id() == container_id && a.streamer.state().is_running()
                });
            if live {
                debug!(service = %service, container = %container_id, "Output already attached");
                return;
            }
        }

        let (exit, exit_task) = self.watch_exit(service, container_id);

        let streamer = match self.runtime.attach_output(container_id).await {
            Ok(output) => streamer::spawn(service, container_id, output, log),
            Err(e) => {
                warn!(service = %service, container = %container_id, error = %e, "Failed to attach to container output");
                StreamerHandle::failed(container_id, format!("attach: {e}"))
            }
        };

        let mut services = self.services.lock().await;
        if let Some(s) = services.get_mut(service) {
            // Replacing the attachment aborts the previous reader and exit watcher.
            s.attachment = Some(Attachment {
                streamer,
                exit,
                exit_task,
            });
        }
    }

    fn watch_exit(
        &self,
        service: &str,
        container_id: &str,
    ) -> (watch::Receiver<ExitState>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(ExitState::Running);
        let wait = self.runtime.wait_not_running(container_id);
        let service = service.to_string();
        let container_id = container_id.to_string();

        let task = tokio::spawn(async move {
            let state = match wait.await {
                Ok(code) => {
                    warn!(service = %service, container = %container_id, code, "Container stopped running");
                    ExitState::Exited(code)
                }
                Err(e) => {
                    debug!(service = %service, container = %container_id, error = %e, "Wait for container failed");
                    ExitState::WaitFailed(e.to_string())
                }
            };
            let _ = tx.send(state);
        });

        (rx, task)
    }

    /// Run `cmd` inside the service's container without waiting for it.
    ///
    /// Errors cover only exec creation and attachment; the command's exit
    /// status is not inspected.
    pub async fn run_command(&self, service: &str, cmd: &[String]) -> Result<CommandHandle> {
        let container = {
            let services = self.services.lock().await;
            services
                .get(service)
                .map(|s| s.descriptor.runtime_name())
                .ok_or_else(|| ServiceError::NotFound(service.to_string()))?
        };

        info!(service = %service, command = ?cmd, "Running command");
        let output = self.runtime.exec(&container, cmd).await?;
        Ok(exec::spawn_drain(service, cmd, output))
    }

    /// All containers owned by nodeisp, in any state.
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self.runtime.list_containers(&ContainerQuery::all()).await?)
    }

    /// Status of every managed service, sorted by name.
    pub async fn status(&self) -> Vec<ServiceStatus> {
        let services = self.services.lock().await;
        let mut status: Vec<ServiceStatus> = services
            .iter()
            .map(|(name, s)| ServiceStatus {
                name: name.clone(),
                image: s.descriptor.image().to_string(),
                runtime_name: s.descriptor.runtime_name(),
                container_id: s
                    .attachment
                    .as_ref()
                    .map(|a| a.streamer.container_id().to_string()),
                exit: s.attachment.as_ref().map(|a| a.exit.borrow().clone()),
                output: s.attachment.as_ref().map(|a| a.streamer.state()),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    /// Reopen every service log file, e.g. after logrotate moved them.
    pub async fn reopen_logs(&self) {
        let logs: Vec<Arc<LogFile>> = {
            let services = self.services.lock().await;
            services.values().filter_map(|s| s.log.clone()).collect()
        };

        for log in logs {
            if let Err(e) = log.reopen().await {
                error!(path = %log.path().display(), error = %e, "Failed to reopen log file");
            }
        }
    }
}
