//! Upstream target of the reverse proxy.
//!
//! The proxy itself lives outside this crate; it receives a clone of
//! [`ProxyTarget`] and reads the current upstream on every request.

use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Default)]
pub struct ProxyTarget {
    upstream: Arc<RwLock<Option<String>>>,
}

impl ProxyTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the proxy at the app server listening on `127.0.0.1:port`.
    pub fn set_local_port(&self, port: u16) {
        self.set(format!("http://127.0.0.1:{port}"));
    }

    pub fn set(&self, upstream: String) {
        let mut guard = self.upstream.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(upstream);
    }

    pub fn get(&self) -> Option<String> {
        self.upstream
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
