use std::collections::HashMap;

use tokio::sync::RwLock;
use unblink_protocol::ServiceDescriptor;

/// A service as the relay currently knows it: the announced descriptor plus
/// the node connection that owns it.
#[derive(Debug, Clone)]
pub struct RegisteredService {
    pub descriptor: ServiceDescriptor,
    pub node_id: String,
}

/// Relay-wide map of service id → (descriptor, owning node).
///
/// Mutated only from node connections (announce, disconnect) and the
/// service API (delete); everyone else reads.
pub struct ServiceRegistry {
    inner: RwLock<HashMap<String, RegisteredService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or update a service announced by `node_id`.
    ///
    /// An announcement only takes effect when the descriptor names the
    /// announcing node AND any existing entry is owned by that same node.
    /// Returns false when the announcement was ignored.
    pub async fn upsert(&self, node_id: &str, descriptor: ServiceDescriptor) -> bool {
        if descriptor.node_id != node_id {
            tracing::warn!(
                service_id = %descriptor.id,
                claimed = %descriptor.node_id,
                announcer = %node_id,
                "Ignoring announce for a service claiming a different node"
            );
            return false;
        }
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.get(&descriptor.id)
            && existing.node_id != node_id
        {
            tracing::warn!(
                service_id = %descriptor.id,
                owner = %existing.node_id,
                announcer = %node_id,
                "Ignoring announce for a service owned by another node"
            );
            return false;
        }
        inner.insert(
            descriptor.id.clone(),
            RegisteredService {
                descriptor,
                node_id: node_id.to_string(),
            },
        );
        true
    }

    pub async fn get(&self, service_id: &str) -> Option<RegisteredService> {
        self.inner.read().await.get(service_id).cloned()
    }

    pub async fn remove(&self, service_id: &str) -> Option<RegisteredService> {
        self.inner.write().await.remove(service_id)
    }

    /// Drop every service owned by a node; returns what was removed so the
    /// caller can tear down dependents.
    pub async fn remove_node(&self, node_id: &str) -> Vec<RegisteredService> {
        let mut inner = self.inner.write().await;
        let ids: Vec<String> = inner
            .iter()
            .filter(|(_, s)| s.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter().filter_map(|id| inner.remove(&id)).collect()
    }

    pub async fn list_for_node(&self, node_id: &str) -> Vec<ServiceDescriptor> {
        let mut services: Vec<ServiceDescriptor> = self
            .inner
            .read()
            .await
            .values()
            .filter(|s| s.node_id == node_id)
            .map(|s| s.descriptor.clone())
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
