//! The container orchestrator seam.
//!
//! Kiln never talks to a cluster directly; everything it needs from one
//! (containers, readiness, labels, and addressable services) goes through
//! [`Orchestrator`]. [`LocalOrchestrator`] models those primitives
//! in-process for standalone mode and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::{KilnError, KilnResult};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

pub type Labels = BTreeMap<String, String>;

/// Marks every resource Kiln creates.
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const MANAGED_BY_KILN: &str = "kiln";
/// Instance id of the pool manager that created the resource.
pub const LABEL_INSTANCE: &str = "kiln-instance";
pub const LABEL_ENV_NAME: &str = "environment-name";
pub const LABEL_ENV_NAMESPACE: &str = "environment-namespace";
pub const LABEL_FUNCTION_NAME: &str = "function-name";
pub const LABEL_FUNCTION_NAMESPACE: &str = "function-namespace";
pub const LABEL_FUNCTION_VERSION: &str = "function-version";

/// Labels carried by every resource of one pool manager instance.
pub fn managed_labels(instance_id: &str) -> Labels {
    Labels::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_KILN.to_string()),
        (LABEL_INSTANCE.to_string(), instance_id.to_string()),
    ])
}

/// True if `labels` contains every pair in `selector`.
pub fn matches_selector(labels: &Labels, selector: &Labels) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub labels: Labels,
    /// Where the shared volume is mounted in the runtime.
    pub shared_mount_path: String,
    pub fetcher_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub namespace: String,
    /// Host on which the container's fetcher and runtime ports are reachable.
    pub host: String,
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub namespace: String,
    pub container_id: String,
    pub port: u16,
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    /// Address handed to callers of the function.
    pub address: String,
    pub labels: Labels,
}

/// Container and service primitives consumed by the pool manager.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_container(&self, spec: &ContainerSpec) -> KilnResult<ContainerInfo>;

    /// Resolve once the container's fetcher and runtime accept requests.
    async fn wait_ready(&self, container_id: &str, timeout: Duration) -> KilnResult<()>;

    /// Merge `labels` into the container's labels.
    async fn label_container(&self, container_id: &str, labels: &Labels) -> KilnResult<()>;

    async fn delete_container(&self, container_id: &str) -> KilnResult<()>;

    async fn list_containers(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> KilnResult<Vec<ContainerInfo>>;

    async fn create_service(&self, spec: &ServiceSpec) -> KilnResult<ServiceInfo>;

    async fn delete_service(&self, namespace: &str, name: &str) -> KilnResult<()>;

    async fn list_services(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> KilnResult<Vec<ServiceInfo>>;
}

// ── LocalOrchestrator ──────────────────────────────────────────────

#[derive(Default)]
struct LocalState {
    containers: HashMap<String, ContainerInfo>,
    /// `{namespace}/{name}` → service.
    services: HashMap<String, ServiceInfo>,
}

/// In-process orchestrator.
///
/// Containers are records whose fetcher and runtime endpoints all live on
/// one configured host (for example a sidecar pair started next to the
/// daemon). Services get a cluster-DNS style address
/// `{name}.{namespace}:{port}`.
pub struct LocalOrchestrator {
    host: String,
    state: Mutex<LocalState>,
    next_id: AtomicU64,
}

impl LocalOrchestrator {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            state: Mutex::new(LocalState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Snapshot of live containers.
    pub fn containers(&self) -> Vec<ContainerInfo> {
        self.state.lock().containers.values().cloned().collect()
    }

    /// Snapshot of live services.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.state.lock().services.values().cloned().collect()
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn create_container(&self, spec: &ContainerSpec) -> KilnResult<ContainerInfo> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = ContainerInfo {
            id: format!("local-{n:06}"),
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            host: self.host.clone(),
            labels: spec.labels.clone(),
        };
        self.state
            .lock()
            .containers
            .insert(info.id.clone(), info.clone());
        debug!(id = %info.id, name = %info.name, image = %spec.image, "local container created");
        Ok(info)
    }

    async fn wait_ready(&self, container_id: &str, _timeout: Duration) -> KilnResult<()> {
        if self.state.lock().containers.contains_key(container_id) {
            Ok(())
        } else {
            Err(KilnError::Orchestrator(format!(
                "container {container_id} does not exist"
            )))
        }
    }

    async fn label_container(&self, container_id: &str, labels: &Labels) -> KilnResult<()> {
        let mut state = self.state.lock();
        let container = state.containers.get_mut(container_id).ok_or_else(|| {
            KilnError::Orchestrator(format!("container {container_id} does not exist"))
        })?;
        container
            .labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete_container(&self, container_id: &str) -> KilnResult<()> {
        let removed = self.state.lock().containers.remove(container_id);
        debug!(id = %container_id, existed = removed.is_some(), "local container deleted");
        Ok(())
    }

    async fn list_containers(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> KilnResult<Vec<ContainerInfo>> {
        Ok(self
            .state
            .lock()
            .containers
            .values()
            .filter(|c| c.namespace == namespace && matches_selector(&c.labels, selector))
            .cloned()
            .collect())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> KilnResult<ServiceInfo> {
        let mut state = self.state.lock();
        if !state.containers.contains_key(&spec.container_id) {
            return Err(KilnError::Orchestrator(format!(
                "service {} targets missing container {}",
                spec.name, spec.container_id
            )));
        }
        let key = format!("{}/{}", spec.namespace, spec.name);
        if state.services.contains_key(&key) {
            return Err(KilnError::Orchestrator(format!("service {key} already exists")));
        }
        let info = ServiceInfo {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            address: format!("{}.{}:{}", spec.name, spec.namespace, spec.port),
            labels: spec.labels.clone(),
        };
        state.services.insert(key, info.clone());
        Ok(info)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> KilnResult<()> {
        self.state
            .lock()
            .services
            .remove(&format!("{namespace}/{name}"));
        Ok(())
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> KilnResult<Vec<ServiceInfo>> {
        Ok(self
            .state
            .lock()
            .services
            .values()
            .filter(|s| s.namespace == namespace && matches_selector(&s.labels, selector))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, labels: Labels) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            namespace: "kiln-function".into(),
            image: "kiln/node-env".into(),
            labels,
            shared_mount_path: "/userfunc".into(),
            fetcher_port: 8000,
        }
    }

    #[tokio::test]
    async fn selector_filters_containers() {
        let orch = LocalOrchestrator::new("127.0.0.1");
        orch.create_container(&spec("a", managed_labels("inst1")))
            .await
            .unwrap();
        orch.create_container(&spec("b", managed_labels("inst2")))
            .await
            .unwrap();

        let all = orch
            .list_containers("kiln-function", &managed_labels("inst1"))
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "a");
        assert_eq!(all[0].host, "127.0.0.1");
    }

    #[tokio::test]
    async fn service_address_is_unique_per_service() {
        let orch = LocalOrchestrator::new("127.0.0.1");
        let c1 = orch.create_container(&spec("a", Labels::new())).await.unwrap();
        let c2 = orch.create_container(&spec("b", Labels::new())).await.unwrap();

        let mk = |name: &str, id: &str| ServiceSpec {
            name: name.into(),
            namespace: "kiln-function".into(),
            container_id: id.into(),
            port: 8888,
            labels: Labels::new(),
        };
        let s1 = orch.create_service(&mk("a", &c1.id)).await.unwrap();
        let s2 = orch.create_service(&mk("b", &c2.id)).await.unwrap();
        assert_ne!(s1.address, s2.address);
        assert_eq!(s1.address, "a.kiln-function:8888");

        assert!(orch.create_service(&mk("a", &c1.id)).await.is_err());
    }

    #[tokio::test]
    async fn labels_merge() {
        let orch = LocalOrchestrator::new("127.0.0.1");
        let c = orch
            .create_container(&spec("a", managed_labels("inst1")))
            .await
            .unwrap();
        orch.label_container(
            &c.id,
            &Labels::from([(LABEL_FUNCTION_NAME.to_string(), "hello".to_string())]),
        )
        .await
        .unwrap();

        let listed = orch.containers();
        assert_eq!(listed[0].labels.get(LABEL_FUNCTION_NAME).unwrap(), "hello");
        assert_eq!(listed[0].labels.get(LABEL_INSTANCE).unwrap(), "inst1");
    }
}
