//! Service descriptors and their content hash.
//!
//! A [`ServiceDescriptor`] is the desired configuration of one container
//! workload. Its content hash doubles as the change-detection key: the hash
//! is written to the container as a label and embedded in the container
//! name, so a container whose hash differs from the descriptor is stale.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix of every container name created by the manager.
pub const NAME_PREFIX: &str = "nodeisp";

/// Kind of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountKind::Bind => write!(f, "bind"),
            MountKind::Volume => write!(f, "volume"),
            MountKind::Tmpfs => write!(f, "tmpfs"),
        }
    }
}

/// A host path (or named volume) mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: MountKind,
    pub source: String,
    pub target: String,
}

impl Mount {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Host side of a published container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

impl PortBinding {
    pub fn loopback(port: u16) -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            host_port: port.to_string(),
        }
    }
}

/// Container port (e.g. `5432/tcp`) to host bindings. Sorted so the hash
/// does not depend on insertion order.
pub type PortBindings = BTreeMap<String, Vec<PortBinding>>;

/// Declarative description of one service container.
///
/// Fields are only changed through the consuming `with_*` methods, each of
/// which discards the memoized hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    name: String,
    image: String,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    mounts: Vec<Mount>,
    #[serde(default)]
    port_bindings: PortBindings,
    #[serde(default)]
    exposed_ports: BTreeSet<String>,
    #[serde(default)]
    entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    platform: Option<String>,

    #[serde(skip)]
    hash: OnceLock<String>,
}

/// The fields covered by the content hash.
#[derive(Serialize)]
struct HashInput<'a> {
    image: &'a str,
    env: &'a [String],
    mounts: &'a [Mount],
    port_bindings: &'a PortBindings,
    entrypoint: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    platform: Option<&'a str>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: Vec::new(),
            mounts: Vec::new(),
            port_bindings: PortBindings::new(),
            exposed_ports: BTreeSet::new(),
            entrypoint: Vec::new(),
            platform: None,
            hash: OnceLock::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self.invalidate()
    }

    pub fn with_env<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env = env.into_iter().map(Into::into).collect();
        self.invalidate()
    }

    pub fn with_mounts(mut self, mounts: Vec<Mount>) -> Self {
        self.mounts = mounts;
        self.invalidate()
    }

    pub fn with_port_bindings(mut self, port_bindings: PortBindings) -> Self {
        self.port_bindings = port_bindings;
        self.invalidate()
    }

    /// Exposed ports are declared on the container but are not hashed.
    pub fn with_exposed_ports<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exposed_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = entrypoint.into_iter().map(Into::into).collect();
        self.invalidate()
    }

    /// Pin pulls and container creation to an `os/arch` platform.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self.invalidate()
    }

    fn invalidate(mut self) -> Self {
        self.hash = OnceLock::new();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn env(&self) -> &[String] {
        &self.env
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn port_bindings(&self) -> &PortBindings {
        &self.port_bindings
    }

    pub fn exposed_ports(&self) -> &BTreeSet<String> {
        &self.exposed_ports
    }

    pub fn entrypoint(&self) -> &[String] {
        &self.entrypoint
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    /// First host port bound to `container_port`, if any.
    pub fn host_port(&self, container_port: &str) -> Option<u16> {
        self.port_bindings
            .get(container_port)?
            .first()?
            .host_port
            .parse()
            .ok()
    }

    /// Hex SHA-256 over image, env, mounts, port bindings, entrypoint and
    /// platform. Computed once, then served from the cache.
    pub fn content_hash(&self) -> &str {
        self.hash.get_or_init(|| {
            let input = HashInput {
                image: &self.image,
                env: &self.env,
                mounts: &self.mounts,
                port_bindings: &self.port_bindings,
                entrypoint: &self.entrypoint,
                platform: self.platform.as_deref(),
            };
            // Serializing plain strings, vecs and BTreeMaps cannot fail.
            let encoded = serde_json::to_vec(&input).unwrap_or_default();
            hex::encode(Sha256::digest(&encoded))
        })
    }

    /// Container name: `nodeisp_<name>_<hash[..8]>`.
    pub fn runtime_name(&self) -> String {
        format!("{}_{}_{}", NAME_PREFIX, self.name, &self.content_hash()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis() -> ServiceDescriptor {
        ServiceDescriptor::new("redis", "redis:7").with_env(["REDIS_PORT=6379"])
    }

    #[test]
    fn hash_is_stable() {
        let d = redis();
        let first = d.content_hash().to_string();
        assert_eq!(d.content_hash(), first);
        assert_eq!(redis().content_hash(), first);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn hash_changes_with_each_hashed_field() {
        let base = redis();
        let h = base.content_hash().to_string();

        let variants = [
            redis().with_image("redis:8"),
            redis().with_env(["REDIS_PORT=6380"]),
            redis().with_mounts(vec![Mount::bind("/srv/redis", "/data")]),
            redis().with_port_bindings(PortBindings::from([(
                "6379/tcp".to_string(),
                vec![PortBinding::loopback(6379)],
            )])),
            redis().with_entrypoint(["redis-server"]),
            redis().with_platform("linux/amd64"),
        ];

        for v in &variants {
            assert_ne!(v.content_hash(), h, "variant {:?}", v);
        }
    }

    #[test]
    fn env_order_is_significant() {
        let a = ServiceDescriptor::new("x", "img").with_env(["A=1", "B=2"]);
        let b = ServiceDescriptor::new("x", "img").with_env(["B=2", "A=1"]);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn name_and_exposed_ports_are_not_hashed() {
        let h = redis().content_hash().to_string();
        assert_eq!(redis().with_name("cache").content_hash(), h);
        assert_eq!(redis().with_exposed_ports(["6379/tcp"]).content_hash(), h);
    }

    #[test]
    fn builder_resets_memoized_hash() {
        let d = redis();
        let before = d.content_hash().to_string();
        let d = d.with_env(["REDIS_PORT=6379", "REDIS_PASSWORD=x"]);
        assert_ne!(d.content_hash(), before);
    }

    #[test]
    fn runtime_name_embeds_hash_prefix() {
        let d = redis();
        let name = d.runtime_name();
        assert_eq!(name, format!("nodeisp_redis_{}", &d.content_hash()[..8]));
        assert_eq!(name, redis().runtime_name());
        assert_ne!(name, redis().with_image("redis:8").runtime_name());
    }

    #[test]
    fn hash_survives_serde_roundtrip() {
        let d = redis().with_mounts(vec![Mount::bind("/srv/redis", "/data")]);
        let json = serde_json::to_string(&d).unwrap();
        assert!(!json.contains("hash"));
        let back: ServiceDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content_hash(), d.content_hash());
    }

    #[test]
    fn concurrent_hash_access_agrees() {
        let d = std::sync::Arc::new(redis());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let d = d.clone();
                std::thread::spawn(move || d.content_hash().to_string())
            })
            .collect();
        let hashes: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn host_port_reads_first_binding() {
        let d = redis().with_port_bindings(PortBindings::from([(
            "5432/tcp".to_string(),
            vec![PortBinding::loopback(8123)],
        )]));
        assert_eq!(d.host_port("5432/tcp"), Some(8123));
        assert_eq!(d.host_port("8080/tcp"), None);
    }
}
