//! Explicitly constructed service context.

use std::sync::Arc;

use kiln_core::HttpClient;
use kiln_core::config::PoolManagerConfig;
use kiln_store::MetadataStore;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::orchestrator::Orchestrator;

/// Length of a pool manager instance id.
pub const INSTANCE_ID_LEN: usize = 8;

/// Everything a pool manager component needs, built once at startup.
#[derive(Clone)]
pub struct ServiceContext {
    /// Tags every resource this process creates.
    pub instance_id: String,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub store: MetadataStore,
    pub http: HttpClient,
    pub config: Arc<PoolManagerConfig>,
}

impl ServiceContext {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        store: MetadataStore,
        config: PoolManagerConfig,
    ) -> Self {
        Self {
            instance_id: generate_instance_id(),
            orchestrator,
            store,
            http: HttpClient::new(),
            config: Arc::new(config),
        }
    }

    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.instance_id = instance_id.to_string();
        self
    }
}

/// Random 8-character alphanumeric id, lowercased so it is label-safe.
pub fn generate_instance_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INSTANCE_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_are_short_and_distinct() {
        let a = generate_instance_id();
        let b = generate_instance_id();
        assert_eq!(a.len(), INSTANCE_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
