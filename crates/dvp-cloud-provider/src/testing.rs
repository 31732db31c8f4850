//! Shared fixtures for unit tests

use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Service, ServicePort, ServiceSpec, ServiceStatus,
};
use kube::api::ObjectMeta;

use dvp_common::Error;

pub(crate) const TENANT_UID: &str = "6f1c3a2e-0d4b-4e57-9a51-2b8f3f9b7c10";

/// Tenant Service of type LoadBalancer with allocated node ports
pub(crate) fn tenant_service(name: &str, namespace: &str, ports: Vec<ServicePort>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(TENANT_UID.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

pub(crate) fn lb_ingress(ip: &str) -> LoadBalancerStatus {
    LoadBalancerStatus {
        ingress: Some(vec![LoadBalancerIngress {
            ip: Some(ip.to_string()),
            ..Default::default()
        }]),
    }
}

pub(crate) fn with_ingress(mut svc: Service, ip: &str) -> Service {
    svc.status = Some(ServiceStatus {
        load_balancer: Some(lb_ingress(ip)),
        ..Default::default()
    });
    svc
}

pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} from test", reason),
            reason: reason.to_string(),
            code,
        }),
    }
}
