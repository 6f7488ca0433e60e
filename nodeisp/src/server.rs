//! Daemon main loop: bring the stack up, then keep it ticking.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nodeisp_service::{
    ContainerRuntime, DockerRuntime, Manager, ServiceDescriptor, StateSnapshot, StateStore,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::proxy::ProxyTarget;
use crate::stack::{self, DataPaths, Dependencies};

/// Interval of the scheduler tick.
const TICK: Duration = Duration::from_secs(60);

pub struct Server {
    config: Config,
    data_dir: PathBuf,
    logs_dir: PathBuf,
    manager: Manager,
    state: StateStore,
    proxy: ProxyTarget,
}

impl Server {
    /// Connect to the container runtime and restore the previous snapshot.
    pub async fn new(config: Config, proxy: ProxyTarget) -> Result<Self> {
        let data_dir = absolute(&config.storage.data)?;
        let logs_dir = absolute(&config.storage.logs)?;

        let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
        runtime.ping().await.context("Docker is not reachable")?;
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);

        let manager = Manager::new(runtime, logs_dir.clone())
            .await
            .context("Failed to set up the service manager")?;

        let state = StateStore::new(data_dir.join("state.json"));
        match state.load().await {
            Ok(Some(snapshot)) => manager.restore(snapshot).await,
            Ok(None) => info!(path = %state.path().display(), "No previous state"),
            Err(e) => warn!(path = %state.path().display(), error = %e, "Ignoring unreadable state"),
        }

        Ok(Self {
            config,
            data_dir,
            logs_dir,
            manager,
            state,
            proxy,
        })
    }

    /// Converge every service, then tick until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let previous = self.manager.snapshot().await;
        self.start_services(&previous).await?;

        let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        let mut ticker = tokio::time::interval(TICK);
        ticker.tick().await;

        info!("nodeisp is running");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = hangup.recv() => {
                    info!("SIGHUP received, reopening log files");
                    self.manager.reopen_logs().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    self.store_state().await;
                    return Ok(());
                }
            }
        }
    }

    async fn start_services(&self, previous: &StateSnapshot) -> Result<()> {
        let paths = DataPaths::new(&self.data_dir);
        paths
            .create_all()
            .with_context(|| format!("Failed to create data directories under {}", self.data_dir.display()))?;

        let recorded = |name: &str| previous.services.get(name);

        let redis = stack::redis(&self.config, &paths, recorded("redis"));
        self.ensure(&redis).await?;

        let postgres_port = stack::reuse_or_pick_port(recorded("postgres"), stack::POSTGRES_PORT);
        let postgres = stack::postgres(&self.config, &paths, recorded("postgres"), postgres_port);
        self.ensure(&postgres).await?;

        let gotenberg = stack::gotenberg(recorded("gotenberg"));
        self.ensure(&gotenberg).await?;

        let deps = Dependencies {
            redis_host: redis.runtime_name(),
            postgres_host: postgres.runtime_name(),
            gotenberg_host: gotenberg.runtime_name(),
        };
        let app_port = stack::reuse_or_pick_port(recorded("app"), stack::APP_PORT);
        let app = stack::app(&self.config, &paths, recorded("app"), app_port, &deps);
        self.ensure(&app).await?;

        let horizon = stack::horizon(&app);
        self.ensure(&horizon).await?;

        self.proxy.set_local_port(app_port);
        info!(
            domain = %self.config.primary_domain(),
            tls_email = %self.config.http.tls.email,
            upstream = ?self.proxy.get(),
            logs = %self.logs_dir.display(),
            "Stack is up"
        );
        Ok(())
    }

    async fn ensure(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        info!(service = %descriptor.name(), image = %descriptor.image(), "Starting service");
        self.manager
            .ensure_service(descriptor.clone())
            .await
            .with_context(|| format!("Failed to start {}", descriptor.name()))?;
        self.store_state().await;
        Ok(())
    }

    async fn tick(&self) {
        self.store_state().await;

        let cmd: Vec<String> = ["php", "artisan", "schedule:run"]
            .into_iter()
            .map(String::from)
            .collect();
        if let Err(e) = self.manager.run_command("app", &cmd).await {
            error!(error = %e, "Failed to run scheduler");
        }

        for status in self.manager.status().await {
            debug!(
                service = %status.name,
                container = ?status.container_id,
                exit = ?status.exit,
                output = ?status.output,
                "Service status"
            );
        }
        match self.manager.list_containers().await {
            Ok(containers) => {
                for c in containers {
                    debug!(container = %c.id, names = ?c.names, state = %c.state, "Container");
                }
            }
            Err(e) => warn!(error = %e, "Failed to list containers"),
        }
    }

    async fn store_state(&self) {
        let snapshot = self.manager.snapshot().await;
        if let Err(e) = self.state.store(&snapshot).await {
            error!(path = %self.state.path().display(), error = %e, "Failed to store state");
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Invalid path {}", path.display()))
}
