//! Predicates deciding which cluster members may receive traffic,
//! and naming of the cloud objects created for a service.

use k8s_openapi::api::core::v1::{Node, Pod, Service, ServicePort};
use kube::ResourceExt;

use crate::consts;

/// Nodes that aren't ready or are cordoned are never added as members.
#[must_use]
pub fn is_node_eligible(node: &Node) -> bool {
    let ready = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|condition| condition.status == "True");
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false);
    ready && !unschedulable
}

#[must_use]
pub fn is_pod_active(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if matches!(status.phase.as_deref(), Some("Succeeded" | "Failed")) {
        return false;
    }
    status
        .conditions
        .as_ref()
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Port dedicated to health checks, if the service declares one.
#[must_use]
pub fn health_check_port(svc: &Service) -> Option<&ServicePort> {
    svc.spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|port| port.name.as_deref() == Some(consts::HEALTHZ_PORT_NAME))
}

/// Address of the node with the given type, e.g. `InternalIP`.
#[must_use]
pub fn node_address<'a>(node: &'a Node, address_type: &str) -> Option<&'a str> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|addr| addr.type_ == address_type)
        .map(|addr| addr.address.as_str())
}

fn truncate(value: &str, max: usize) -> &str {
    value
        .char_indices()
        .nth(max)
        .map_or(value, |(idx, _)| &value[..idx])
}

/// Listener name for a service port, e.g. `k8s_TCP_8080`.
#[must_use]
pub fn listener_name(port: &ServicePort) -> String {
    format!(
        "k8s_{}_{}",
        port.protocol.as_deref().unwrap_or("TCP"),
        port.port
    )
}

/// Listener name used by balancers created before listener names carried the port.
#[must_use]
pub fn legacy_listener_name(svc: &Service) -> String {
    format!("{}_{}", svc.name_any(), svc.uid().unwrap_or_default()).replace('.', "_")
}

#[must_use]
pub fn pool_name(svc: &Service, port: &ServicePort) -> String {
    let namespace = svc.namespace().unwrap_or_default();
    let protocol = port.protocol.as_deref().unwrap_or("TCP");
    format!(
        "k8s_{}_{}-{}_{}-{}",
        truncate(&namespace, 64),
        truncate(&svc.name_any(), 64),
        port.port,
        protocol,
        port.port
    )
}

#[must_use]
pub fn load_balancer_name(svc: &Service) -> String {
    format!("cce-lb-{}", svc.uid().unwrap_or_default())
}

/// Description attached to every listener the operator owns.
#[must_use]
pub fn listener_description(cluster_id: &str, svc: &Service) -> String {
    serde_json::json!({
        "cluster_id": cluster_id,
        "service_id": svc.uid().unwrap_or_default(),
        "attention": consts::ATTENTION,
    })
    .to_string()
}
