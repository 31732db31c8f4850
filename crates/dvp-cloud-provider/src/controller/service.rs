//! Service controller: realizes tenant LoadBalancer Services
//!
//! A finalizer keeps the tenant Service around until its backing service in
//! the infrastructure cluster is gone.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{LoadBalancerStatus, Service};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info};

use dvp_common::Error;

use super::Context;
use crate::load_balancer::SERVICE_TYPE_LOAD_BALANCER;

/// Finalizer guarding backing service cleanup
pub const LOAD_BALANCER_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";

/// Periodic resync to repair drift on the backing service
const RESYNC_SECS: u64 = 300;

fn wants_load_balancer(svc: &Service) -> bool {
    svc.metadata.deletion_timestamp.is_none()
        && svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some(SERVICE_TYPE_LOAD_BALANCER)
}

fn has_finalizer(svc: &Service) -> bool {
    svc.finalizers().iter().any(|f| f == LOAD_BALANCER_FINALIZER)
}

fn recorded_status(svc: &Service) -> LoadBalancerStatus {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.clone())
        .unwrap_or_default()
}

/// Reconcile a tenant Service
pub async fn reconcile(svc: Arc<Service>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(lb) = ctx.cloud.load_balancer() else {
        return Ok(Action::await_change());
    };
    let name = svc.name_any();
    let namespace = svc.namespace().unwrap_or_default();

    if !wants_load_balancer(&svc) {
        if !has_finalizer(&svc) {
            return Ok(Action::await_change());
        }

        info!(service = %name, namespace = %namespace, "Cleaning up load balancer");
        lb.ensure_load_balancer_deleted(&ctx.cluster_name, &svc).await?;

        // A Service switched away from LoadBalancer keeps living; drop its stale ingress
        if svc.metadata.deletion_timestamp.is_none()
            && recorded_status(&svc) != LoadBalancerStatus::default()
        {
            ctx.tenant
                .patch_service_status(&name, &namespace, &LoadBalancerStatus::default())
                .await?;
        }

        let finalizers: Vec<String> = svc
            .finalizers()
            .iter()
            .filter(|f| *f != LOAD_BALANCER_FINALIZER)
            .cloned()
            .collect();
        ctx.tenant
            .patch_service_finalizers(&name, &namespace, &finalizers)
            .await?;
        return Ok(Action::await_change());
    }

    if !has_finalizer(&svc) {
        let mut finalizers = svc.finalizers().to_vec();
        finalizers.push(LOAD_BALANCER_FINALIZER.to_string());
        ctx.tenant
            .patch_service_finalizers(&name, &namespace, &finalizers)
            .await?;
    }

    let status = lb
        .ensure_load_balancer(&ctx.cluster_name, &svc, &[], &ctx.cancel)
        .await?;

    if recorded_status(&svc) != status {
        ctx.tenant
            .patch_service_status(&name, &namespace, &status)
            .await?;
        info!(service = %name, namespace = %namespace, "Updated load balancer status");
    } else {
        debug!(service = %name, namespace = %namespace, "Load balancer status unchanged");
    }

    Ok(Action::requeue(Duration::from_secs(RESYNC_SECS)))
}
