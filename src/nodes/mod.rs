//! Connected-node bookkeeping and the transport seam.
//!
//! The kernel never speaks the wire protocol itself: a `NodeTransport`
//! receives already-decoded frames and returns decoded responses. Everything
//! security-relevant happens in [`front`] before a frame is forwarded.

pub mod budget;
pub mod front;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Delivers a command to a connected node and returns its response.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn forward(
        &self,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> anyhow::Result<Value>;
}

/// How the gateway is reachable. Dangerous commands require a safe exposure
/// unless the operator explicitly overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    /// Bound to loopback only.
    Loopback,
    /// Served over an authenticated tailnet.
    TailnetServe,
    /// Reachable from untrusted networks.
    Exposed,
}

impl Exposure {
    pub fn is_safe(&self) -> bool {
        matches!(self, Exposure::Loopback | Exposure::TailnetServe)
    }
}

/// One live node connection.
pub struct NodeSession {
    pub node_id: String,
    pub transport: Arc<dyn NodeTransport>,
    pub connected_at: DateTime<Utc>,
}

/// Registry of connected nodes.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<NodeSession>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: impl Into<String>, transport: Arc<dyn NodeTransport>) {
        let node_id = node_id.into();
        let session = Arc::new(NodeSession {
            node_id: node_id.clone(),
            transport,
            connected_at: Utc::now(),
        });
        self.nodes
            .write()
            .expect("node registry lock poisoned")
            .insert(node_id, session);
    }

    pub fn remove(&self, node_id: &str) -> bool {
        self.nodes
            .write()
            .expect("node registry lock poisoned")
            .remove(node_id)
            .is_some()
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<NodeSession>> {
        self.nodes
            .read()
            .expect("node registry lock poisoned")
            .get(node_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .read()
            .expect("node registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.read().expect("node registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTransport;

    #[async_trait]
    impl NodeTransport for EchoTransport {
        async fn forward(
            &self,
            _command: &str,
            params: Value,
            _timeout: Duration,
        ) -> anyhow::Result<Value> {
            Ok(params)
        }
    }

    #[test]
    fn register_lookup_remove() {
        let reg = NodeRegistry::new();
        assert!(reg.is_empty());
        reg.register("mac-mini", Arc::new(EchoTransport));
        assert_eq!(reg.list(), vec!["mac-mini"]);
        assert!(reg.get("mac-mini").is_some());
        assert!(reg.get("unknown").is_none());
        assert!(reg.remove("mac-mini"));
        assert!(!reg.remove("mac-mini"));
    }

    #[test]
    fn exposure_safety() {
        assert!(Exposure::Loopback.is_safe());
        assert!(Exposure::TailnetServe.is_safe());
        assert!(!Exposure::Exposed.is_safe());
    }
}
