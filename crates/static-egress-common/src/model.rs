//! Desired-state model shared between the config source and the reconciler.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use ipnet::IpNet;

/// Identity of the configuration object a set of destinations came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource {
    pub name: String,
    pub namespace: String,
    /// Set when the object was observed in a cluster other than the local one.
    pub cluster: Option<String>,
}

impl Resource {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            cluster: None,
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cluster {
            Some(cluster) => write!(f, "{}/{}/{}", cluster, self.namespace, self.name),
            None => write!(f, "{}/{}", self.namespace, self.name),
        }
    }
}

/// Destinations declared by a single resource.
///
/// An empty `ip_addresses` set means the resource no longer contributes any
/// destination (it was deleted or emptied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressConfig {
    pub resource: Resource,
    pub ip_addresses: BTreeSet<IpNet>,
}

impl EgressConfig {
    pub fn new(resource: Resource, ip_addresses: impl IntoIterator<Item = IpNet>) -> Self {
        Self {
            resource,
            ip_addresses: ip_addresses.into_iter().collect(),
        }
    }

    /// Config signalling that `resource` contributes nothing anymore.
    pub fn removed(resource: Resource) -> Self {
        Self {
            resource,
            ip_addresses: BTreeSet::new(),
        }
    }

    pub fn is_removal(&self) -> bool {
        self.ip_addresses.is_empty()
    }
}

/// Desired destinations keyed by the resource that declared them.
pub type DesiredState = HashMap<Resource, BTreeSet<IpNet>>;
