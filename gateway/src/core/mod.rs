//! Backend host abstraction.
//!
//! Hosts are supplied by the proxy host runtime; the core never creates or
//! mutates cluster membership, it only reads it through [`HostProvider`].

use std::{collections::HashMap, fmt, sync::Arc};

/// A single backend endpoint within a cluster.
pub trait Host: Send + Sync + fmt::Debug {
    fn ip(&self) -> &str;

    fn port(&self) -> u16;

    /// `ip:port` form used for upstream pinning.
    fn address(&self) -> String {
        format!("{}:{}", self.ip(), self.port())
    }

    /// Labels used for subset routing.
    fn labels(&self) -> &HashMap<String, String>;
}

/// Resolved cluster membership, provided by the surrounding proxy.
pub trait HostProvider: Send + Sync + fmt::Debug {
    fn cluster_hosts(&self, cluster: &str) -> Vec<Arc<dyn Host>>;
}

/// Plain in-memory host, used by the proxy glue and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticHost {
    ip: String,
    port: u16,
    labels: HashMap<String, String>,
}

impl StaticHost {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            labels: HashMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl Host for StaticHost {
    fn ip(&self) -> &str {
        &self.ip
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }
}

/// Fixed cluster → hosts mapping.
#[derive(Debug, Clone, Default)]
pub struct StaticHostProvider {
    clusters: HashMap<String, Vec<Arc<dyn Host>>>,
}

impl StaticHostProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(
        mut self,
        cluster: impl Into<String>,
        hosts: Vec<Arc<dyn Host>>,
    ) -> Self {
        self.clusters.insert(cluster.into(), hosts);
        self
    }
}

impl HostProvider for StaticHostProvider {
    fn cluster_hosts(&self, cluster: &str) -> Vec<Arc<dyn Host>> {
        self.clusters.get(cluster).cloned().unwrap_or_default()
    }
}
