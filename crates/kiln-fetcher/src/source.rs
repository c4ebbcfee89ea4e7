//! Where the fetcher resolves function definitions.

use std::time::Duration;

use async_trait::async_trait;
use kiln_core::{ApiResponse, Function, FunctionRef, HttpClient, KilnError, KilnResult};
use kiln_store::MetadataStore;
use tracing::debug;

/// Resolves a function reference to its current definition.
#[async_trait]
pub trait FunctionSource: Send + Sync {
    async fn get_function(&self, function: &FunctionRef) -> KilnResult<Function>;
}

/// Co-located deployments read straight from the metadata store.
#[async_trait]
impl FunctionSource for MetadataStore {
    async fn get_function(&self, function: &FunctionRef) -> KilnResult<Function> {
        Ok(self
            .functions()
            .require(&function.namespace, &function.name)?)
    }
}

/// Reads definitions from a pool manager's definitions API.
#[derive(Clone)]
pub struct RemoteFunctionSource {
    base_url: String,
    http: HttpClient,
    timeout: Duration,
}

impl RemoteFunctionSource {
    pub fn new(base_url: &str, http: HttpClient, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            timeout,
        }
    }
}

#[async_trait]
impl FunctionSource for RemoteFunctionSource {
    async fn get_function(&self, function: &FunctionRef) -> KilnResult<Function> {
        let url = format!(
            "{}/v2/functions/{}/{}",
            self.base_url, function.namespace, function.name
        );
        let resp = self.http.get(&url, self.timeout).await?;
        debug!(%url, status = %resp.status, "function definition fetched");

        let status = resp.status.as_u16();
        match serde_json::from_slice::<ApiResponse<Function>>(&resp.body) {
            Ok(envelope) => envelope.into_result(status),
            Err(_) if !resp.is_success() => Err(KilnError::from_status(status, &resp.text())),
            Err(e) => Err(KilnError::Internal(format!(
                "malformed function definition from {url}: {e}"
            ))),
        }
    }
}
