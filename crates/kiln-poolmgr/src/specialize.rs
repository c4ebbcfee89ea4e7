//! Turning a pooled container into an instance of one function.

use std::future::Future;
use std::time::Duration;

use kiln_core::{
    Environment, FetchRequest, Function, FunctionIdentity, FunctionLoadRequest, KilnError,
    KilnResult,
};
use tracing::{debug, warn};

use crate::context::ServiceContext;
use crate::orchestrator::{
    LABEL_FUNCTION_NAME, LABEL_FUNCTION_NAMESPACE, LABEL_FUNCTION_VERSION, Labels, ServiceInfo,
    ServiceSpec, managed_labels,
};
use crate::pool::Container;

/// A failed specialization attempt.
#[derive(Debug)]
pub(crate) struct AttemptFailure {
    pub error: KilnError,
    /// The container may still be working on a request we gave up on;
    /// leave it `Specializing` for the reaper instead of deleting it.
    pub timed_out: bool,
}

impl AttemptFailure {
    fn failed(error: KilnError) -> Self {
        Self {
            error,
            timed_out: false,
        }
    }
}

/// Labels identifying the function a container serves.
pub(crate) fn function_labels(identity: &FunctionIdentity) -> Labels {
    Labels::from([
        (LABEL_FUNCTION_NAME.to_string(), identity.name.clone()),
        (LABEL_FUNCTION_NAMESPACE.to_string(), identity.namespace.clone()),
        (
            LABEL_FUNCTION_VERSION.to_string(),
            identity.content_version.clone(),
        ),
    ])
}

/// Deliver code, load it into the runtime, and expose a service.
pub(crate) async fn specialize(
    ctx: &ServiceContext,
    env: &Environment,
    function: &Function,
    container: &Container,
) -> Result<ServiceInfo, AttemptFailure> {
    let config = &ctx.config;
    let host = &container.info.host;
    let identity = function.identity();
    let filename = identity.code_filename();

    // Fetch the deployment package onto the shared volume.
    let fetch_url = format!("http://{host}:{}/", config.fetcher_port);
    let fetch = FetchRequest::deployment(identity.function_ref(), &filename)
        .pinned(&identity.content_version);
    let resp = ctx
        .http
        .post_json(&fetch_url, &fetch, config.call_timeout)
        .await
        .map_err(|e| AttemptFailure {
            timed_out: e.is_timeout(),
            error: KilnError::Download(e.to_string()),
        })?;
    if !resp.is_success() {
        return Err(AttemptFailure::failed(KilnError::from_status(
            resp.status.as_u16(),
            &resp.text(),
        )));
    }
    debug!(%identity, container = %container.id(), "code delivered");

    // Ask the runtime to load it.
    let runtime = &env.spec.runtime;
    let load_url = format!(
        "http://{host}:{}{}",
        runtime.load_endpoint_port, runtime.load_endpoint_path
    );
    let load = FunctionLoadRequest {
        filepath: format!(
            "{}/{filename}",
            config.shared_mount_path.trim_end_matches('/')
        ),
        entrypoint: function
            .spec
            .deployment
            .entrypoint
            .clone()
            .unwrap_or_default(),
        url: String::new(),
    };
    let resp = ctx
        .http
        .post_json(&load_url, &load, config.call_timeout)
        .await
        .map_err(|e| AttemptFailure {
            timed_out: e.is_timeout(),
            error: KilnError::Specialization(e.to_string()),
        })?;
    if !resp.is_success() {
        return Err(AttemptFailure::failed(KilnError::Specialization(format!(
            "runtime returned {}: {}",
            resp.status,
            resp.text().trim()
        ))));
    }
    debug!(%identity, container = %container.id(), "runtime loaded function");

    // Expose and label.
    let labels = function_labels(&identity);
    let mut service_labels = managed_labels(&ctx.instance_id);
    service_labels.extend(labels.clone());
    let service_spec = ServiceSpec {
        name: container.info.name.clone(),
        namespace: container.info.namespace.clone(),
        container_id: container.id().to_string(),
        port: runtime.function_endpoint_port,
        labels: service_labels,
    };
    let timeout = config.call_timeout;
    let service = bounded(
        timeout,
        "create service",
        ctx.orchestrator.create_service(&service_spec),
    )
    .await?;

    let labelled = bounded(
        timeout,
        "label container",
        ctx.orchestrator.label_container(container.id(), &labels),
    )
    .await;
    if let Err(e) = labelled {
        // Don't leave the service behind when the container is discarded.
        if let Err(cleanup) = ctx
            .orchestrator
            .delete_service(&service.namespace, &service.name)
            .await
        {
            warn!(service = %service.name, error = %cleanup, "failed to delete service");
        }
        return Err(e);
    }

    Ok(service)
}

/// Bound an orchestrator call, flagging a timeout.
async fn bounded<T>(
    timeout: Duration,
    what: &str,
    fut: impl Future<Output = KilnResult<T>>,
) -> Result<T, AttemptFailure> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(AttemptFailure::failed),
        Err(_) => Err(AttemptFailure {
            error: KilnError::Orchestrator(format!("{what} timed out after {timeout:?}")),
            timed_out: true,
        }),
    }
}
