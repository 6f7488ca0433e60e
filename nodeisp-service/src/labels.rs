//! Label schema used to find containers and networks owned by nodeisp.
//!
//! Labels are the only index the runtime keeps for us, so all label strings
//! are built here.

use std::collections::HashMap;

/// Ownership label key, present on every container and network we create.
pub const GROUP_LABEL: &str = "app";
/// Ownership label value.
pub const GROUP_VALUE: &str = "nodeisp";
/// Label carrying the service name.
pub const SERVICE_LABEL: &str = "service";
/// Label carrying the descriptor content hash.
pub const HASH_LABEL: &str = "hash";

/// Name of the private network created on first start.
pub const NETWORK_NAME: &str = "nodeisp";

/// Typed label query for containers owned by nodeisp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerQuery {
    service: Option<String>,
}

impl ContainerQuery {
    /// Every container owned by nodeisp.
    pub fn all() -> Self {
        Self::default()
    }

    /// Containers of one service, in any state and with any hash.
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
        }
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// `key=value` label filters, ANDed by the runtime.
    pub fn label_filters(&self) -> Vec<String> {
        let mut filters = vec![group_filter()];
        if let Some(service) = &self.service {
            filters.push(format!("{SERVICE_LABEL}={service}"));
        }
        filters
    }

    /// Whether a label set satisfies this query.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        if labels.get(GROUP_LABEL).map(String::as_str) != Some(GROUP_VALUE) {
            return false;
        }
        match &self.service {
            Some(service) => labels.get(SERVICE_LABEL) == Some(service),
            None => true,
        }
    }
}

/// The `app=nodeisp` filter used for networks and containers.
pub fn group_filter() -> String {
    format!("{GROUP_LABEL}={GROUP_VALUE}")
}

/// Labels identifying the private network.
pub fn network_labels() -> HashMap<String, String> {
    HashMap::from([(GROUP_LABEL.to_string(), GROUP_VALUE.to_string())])
}

/// Labels written to a container created for `service` at `hash`.
pub fn container_labels(service: &str, hash: &str) -> HashMap<String, String> {
    HashMap::from([
        (GROUP_LABEL.to_string(), GROUP_VALUE.to_string()),
        (SERVICE_LABEL.to_string(), service.to_string()),
        (HASH_LABEL.to_string(), hash.to_string()),
    ])
}
