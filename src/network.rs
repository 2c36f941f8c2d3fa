//! Port proxying interface.
//!
//! A node routes external TCP ports to applications hosted on peer nodes
//! through a set of kernel-level proxies. Controllers are scoped by a
//! namespace tag so that several of them (peer agents, tests) can share
//! one kernel without touching each other's rules. Used ports, in
//! contrast, are global: a port claimed by any namespace is unavailable
//! to all.
//!
//! [`HostNetwork`](crate::iptables::HostNetwork) is the production
//! implementation. [`MemoryNetwork`] simulates the kernel in memory and
//! can share its store between controllers, which is what tests use.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Proxy;

/// Namespace used when none is chosen explicitly.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Controller for a node's host-to-peer TCP proxies.
#[async_trait]
pub trait Network: Send + Sync {
    /// The namespace tag scoping proxies owned by this controller.
    fn namespace(&self) -> &str;

    /// Install a proxy routing inbound TCP connections on `port` to
    /// `ip:port`, tagged with this controller's namespace.
    async fn create_proxy_to(&self, ip: &str, port: u16) -> Result<Proxy>;

    /// Remove a previously installed proxy. A rule that is already gone
    /// is not an error.
    async fn delete_proxy(&self, proxy: &Proxy) -> Result<()>;

    /// List the proxies installed by this controller's namespace.
    async fn enumerate_proxies(&self) -> Result<Vec<Proxy>>;

    /// List every TCP port in use on the node: listening or established
    /// endpoints plus the ports of proxies in any namespace.
    async fn enumerate_used_ports(&self) -> Result<BTreeSet<u16>>;
}

#[derive(Debug, Default)]
struct MemoryStore {
    proxies: Vec<Proxy>,
    used_ports: BTreeSet<u16>,
}

/// An in-memory [`Network`] with no kernel behind it.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    store: Arc<Mutex<MemoryStore>>,
    namespace: String,
}

impl MemoryNetwork {
    /// Pre-populate the set of used ports, simulating servers already
    /// listening on the node.
    pub fn with_used_ports(self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.store.lock().unwrap().used_ports.extend(ports);
        self
    }

    /// A second controller over the same simulated kernel, owning a
    /// different namespace.
    pub fn shared_with_namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_proxy_to(&self, ip: &str, port: u16) -> Result<Proxy> {
        let proxy = Proxy::new(ip, port, self.namespace.clone());
        self.store.lock().unwrap().proxies.push(proxy.clone());
        Ok(proxy)
    }

    async fn delete_proxy(&self, proxy: &Proxy) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(index) = store.proxies.iter().position(|p| p == proxy) {
            store.proxies.remove(index);
        }
        Ok(())
    }

    async fn enumerate_proxies(&self) -> Result<Vec<Proxy>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .proxies
            .iter()
            .filter(|proxy| proxy.namespace == self.namespace)
            .cloned()
            .collect())
    }

    async fn enumerate_used_ports(&self) -> Result<BTreeSet<u16>> {
        let store = self.store.lock().unwrap();
        let mut ports = store.used_ports.clone();
        ports.extend(store.proxies.iter().map(|proxy| proxy.target_port));
        Ok(ports)
    }
}

/// Create an in-memory network controller in the default namespace.
pub fn make_memory_network() -> MemoryNetwork {
    make_memory_network_in(DEFAULT_NAMESPACE)
}

/// Create an in-memory network controller in a chosen namespace.
pub fn make_memory_network_in(namespace: impl Into<String>) -> MemoryNetwork {
    MemoryNetwork {
        store: Arc::new(Mutex::new(MemoryStore::default())),
        namespace: namespace.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_namespace() {
        let network = make_memory_network();
        network.create_proxy_to("10.2.3.4", 4321).await.unwrap();
        let expected = Proxy::new("10.2.3.4", 4321, DEFAULT_NAMESPACE);
        assert_eq!(network.enumerate_proxies().await.unwrap(), vec![expected]);
    }

    #[tokio::test]
    async fn test_proxy_has_namespace() {
        let network = make_memory_network_in("my_namespace");
        network.create_proxy_to("10.1.2.3", 1234).await.unwrap();
        let proxies = network.enumerate_proxies().await.unwrap();
        assert_eq!(proxies[0].namespace, "my_namespace");
    }

    #[tokio::test]
    async fn test_custom_used_ports() {
        let network = make_memory_network().with_used_ports([50, 100, 15000]);
        network.create_proxy_to("10.0.0.1", 20001).await.unwrap();
        let expected: BTreeSet<u16> = [50, 100, 15000, 20001].into();
        assert_eq!(network.enumerate_used_ports().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let ours = make_memory_network_in("a");
        let theirs = ours.shared_with_namespace("b");
        ours.create_proxy_to("10.0.0.1", 8080).await.unwrap();

        assert!(theirs.enumerate_proxies().await.unwrap().is_empty());
        assert_eq!(ours.enumerate_proxies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_used_ports_are_global() {
        let ours = make_memory_network_in("a");
        let theirs = ours.shared_with_namespace("b");
        ours.create_proxy_to("10.0.0.1", 8080).await.unwrap();

        let used = theirs.enumerate_used_ports().await.unwrap();
        assert!(used.contains(&8080));
    }

    #[tokio::test]
    async fn test_delete_missing_proxy_is_not_fatal() {
        let network = make_memory_network();
        let ghost = Proxy::new("10.0.0.9", 9999, DEFAULT_NAMESPACE);
        network.delete_proxy(&ghost).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_proxy() {
        let network = make_memory_network();
        let proxy = network.create_proxy_to("10.0.0.1", 8080).await.unwrap();
        network.delete_proxy(&proxy).await.unwrap();
        assert!(network.enumerate_proxies().await.unwrap().is_empty());
    }
}
