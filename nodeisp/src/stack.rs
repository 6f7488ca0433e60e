//! Descriptors for the services making up the nodeisp stack.
//!
//! Images (and host ports) recorded in a previous run are kept so that an
//! upgrade applied earlier is not reverted to the baked-in default; env and
//! mounts are always rebuilt from the configuration.

use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use nodeisp_service::{Mount, PortBinding, PortBindings, ServiceDescriptor};
use rand::Rng;

use crate::config::Config;

pub const APP_REPO: &str = "ghcr.io/node-isp/node-isp";
pub const APP_VERSION: &str = "v0.11.8";

pub const REDIS_IMAGE: &str = "redis:7";
pub const POSTGRES_IMAGE: &str = "postgres:16";
pub const GOTENBERG_IMAGE: &str = "getlago/lago-gotenberg:7";

pub const POSTGRES_PORT: &str = "5432/tcp";
pub const APP_PORT: &str = "8080/tcp";
pub const APP_PLATFORM: &str = "linux/amd64";

/// Host directories mounted into the stack.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub redis: PathBuf,
    pub postgres: PathBuf,
    pub licence: PathBuf,
    pub app_storage: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            redis: data_dir.join("redis"),
            postgres: data_dir.join("postgres"),
            licence: data_dir.join("nodeisp").join("licence"),
            app_storage: data_dir.join("nodeisp").join("storage"),
        }
    }

    pub fn create_all(&self) -> io::Result<()> {
        for dir in [&self.redis, &self.postgres, &self.licence, &self.app_storage] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Container names the app uses to reach its dependencies on the private
/// network.
#[derive(Debug, Clone)]
pub struct Dependencies {
    pub redis_host: String,
    pub postgres_host: String,
    pub gotenberg_host: String,
}

fn image_or(previous: Option<&ServiceDescriptor>, default: &str) -> String {
    previous
        .map(|p| p.image().to_string())
        .unwrap_or_else(|| default.to_string())
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn loopback_binding(container_port: &str, host_port: u16) -> PortBindings {
    PortBindings::from([(
        container_port.to_string(),
        vec![PortBinding::loopback(host_port)],
    )])
}

/// Host port recorded for `container_port`, or a fresh free one.
pub fn reuse_or_pick_port(previous: Option<&ServiceDescriptor>, container_port: &str) -> u16 {
    previous
        .and_then(|p| p.host_port(container_port))
        .unwrap_or_else(pick_free_port)
}

/// Random free TCP port in 8000..18000, probing upwards from a random start.
pub fn pick_free_port() -> u16 {
    let mut port: u16 = rand::thread_rng().gen_range(8000..18000);
    loop {
        if TcpListener::bind(("0.0.0.0", port)).is_ok() {
            return port;
        }
        port = if port == u16::MAX { 8000 } else { port + 1 };
    }
}

pub fn redis(config: &Config, paths: &DataPaths, previous: Option<&ServiceDescriptor>) -> ServiceDescriptor {
    ServiceDescriptor::new("redis", image_or(previous, REDIS_IMAGE))
        .with_mounts(vec![Mount::bind(path_str(&paths.redis), "/data")])
        .with_env([
            "REDIS_PORT=6379".to_string(),
            format!("REDIS_PASSWORD={}", config.redis.password),
        ])
}

pub fn postgres(
    config: &Config,
    paths: &DataPaths,
    previous: Option<&ServiceDescriptor>,
    host_port: u16,
) -> ServiceDescriptor {
    ServiceDescriptor::new("postgres", image_or(previous, POSTGRES_IMAGE))
        .with_mounts(vec![Mount::bind(
            path_str(&paths.postgres),
            "/var/lib/postgresql/data",
        )])
        .with_port_bindings(loopback_binding(POSTGRES_PORT, host_port))
        .with_env([
            "POSTGRES_USER=postgres".to_string(),
            format!("POSTGRES_PASSWORD={}", config.database.password),
            format!("POSTGRES_DB={}", config.database.name),
        ])
}

/// Gotenberg carries no configuration of its own, so a recorded
/// descriptor is reused as-is.
pub fn gotenberg(previous: Option<&ServiceDescriptor>) -> ServiceDescriptor {
    previous
        .cloned()
        .unwrap_or_else(|| ServiceDescriptor::new("gotenberg", GOTENBERG_IMAGE))
}

/// Version tag of an app image from our repository.
pub fn app_version(image: &str) -> &str {
    image
        .strip_prefix(APP_REPO)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(image)
}

pub fn app(
    config: &Config,
    paths: &DataPaths,
    previous: Option<&ServiceDescriptor>,
    host_port: u16,
    deps: &Dependencies,
) -> ServiceDescriptor {
    let image = image_or(previous, &format!("{APP_REPO}:{APP_VERSION}"));
    let domain = config.primary_domain();
    let storage = path_str(&paths.app_storage);

    let env = vec![
        format!("APP_VERSION={}", app_version(&image)),
        "SERVER_NAME=:8080".to_string(),
        "APP_ENV=production".to_string(),
        format!("APP_NAME={}", config.app.name),
        format!("APP_KEY={}", config.app.key),
        format!("APP_URL=https://{domain}"),
        format!("NODEISP_LICENCE_KEY_ID={}", config.licence.id),
        format!("NODEISP_LICENCE_KEY_CODE={}", config.licence.key),
        format!("NODEISP_DOMAIN={domain}"),
        "DB_CONNECTION=pgsql".to_string(),
        format!("DB_HOST={}", deps.postgres_host),
        "DB_PORT=5432".to_string(),
        "DB_USERNAME=postgres".to_string(),
        format!("DB_PASSWORD={}", config.database.password),
        format!("DB_DATABASE={}", config.database.name),
        format!("REDIS_HOST={}", deps.redis_host),
        "REDIS_PORT=6379".to_string(),
        "CACHE_DRIVER=file".to_string(),
        "QUEUE_CONNECTION=redis".to_string(),
        "TELESCOPE_PATH=admin/telescope".to_string(),
        "HORIZON_PATH=admin/horizon".to_string(),
        "FILESYSTEM_DISK=local".to_string(),
        format!("SERVICES_GOTENBERG_URL=http://{}:3000", deps.gotenberg_host),
        format!(
            "SERVICES_GOOGLE_MAPS_API_KEY={}",
            config.services.google_maps_api_key
        ),
    ];

    ServiceDescriptor::new("app", image)
        .with_env(env)
        .with_mounts(vec![
            Mount::bind(path_str(&paths.licence), "/etc/nodeisp/"),
            Mount::bind(storage.clone(), "/app/storage/app/public"),
            Mount::bind(storage, "/app/public/storage"),
        ])
        .with_port_bindings(loopback_binding(APP_PORT, host_port))
        .with_exposed_ports([APP_PORT])
        .with_entrypoint([
            "php",
            "artisan",
            "octane:start",
            "--host=0.0.0.0",
            "--port=8080",
        ])
        .with_platform(APP_PLATFORM)
}

/// Queue worker running the app image with the app's env and mounts.
pub fn horizon(app: &ServiceDescriptor) -> ServiceDescriptor {
    let mut worker = ServiceDescriptor::new("horizon", app.image())
        .with_env(app.env().iter().cloned())
        .with_mounts(app.mounts().to_vec())
        .with_entrypoint(["/entrypoint-worker.sh"]);
    if let Some(platform) = app.platform() {
        worker = worker.with_platform(platform);
    }
    worker
}
