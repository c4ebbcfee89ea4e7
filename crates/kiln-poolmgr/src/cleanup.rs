//! Startup cleanup of resources left behind by earlier pool managers.

use kiln_core::KilnResult;
use tracing::{info, warn};

use crate::context::ServiceContext;
use crate::orchestrator::{LABEL_INSTANCE, LABEL_MANAGED_BY, Labels, MANAGED_BY_KILN};

/// Delete every Kiln-managed container and service in the function
/// namespace whose instance tag differs from ours.
///
/// Individual delete failures are logged and skipped. Returns how many
/// resources were deleted.
pub async fn cleanup_stale_resources(ctx: &ServiceContext) -> KilnResult<usize> {
    let namespace = &ctx.config.function_namespace;
    let selector = Labels::from([(LABEL_MANAGED_BY.to_string(), MANAGED_BY_KILN.to_string())]);
    let is_stale = |labels: &Labels| {
        labels.get(LABEL_INSTANCE).map(String::as_str) != Some(ctx.instance_id.as_str())
    };
    let mut deleted = 0;

    for service in ctx.orchestrator.list_services(namespace, &selector).await? {
        if !is_stale(&service.labels) {
            continue;
        }
        match ctx
            .orchestrator
            .delete_service(&service.namespace, &service.name)
            .await
        {
            Ok(()) => deleted += 1,
            Err(e) => warn!(service = %service.name, error = %e, "failed to delete stale service"),
        }
    }

    for container in ctx.orchestrator.list_containers(namespace, &selector).await? {
        if !is_stale(&container.labels) {
            continue;
        }
        match ctx.orchestrator.delete_container(&container.id).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(container = %container.id, error = %e, "failed to delete stale container"),
        }
    }

    info!(
        instance_id = %ctx.instance_id,
        %namespace,
        deleted,
        "cleaned up resources from previous pool managers"
    );
    Ok(deleted)
}
