//! Convergence of the server's [`Service`], which Kubernetes partially fills in by itself.
//!
//! Everything else the operator derives is applied wholesale. The service is diffed instead, so
//! that fields assigned by Kubernetes (node ports, cluster IPs, load balancer metadata) survive
//! and unchanged services are not rewritten on every reconcile.

use std::collections::BTreeMap;

use stackable_operator::k8s_openapi::api::core::v1::{Service, ServicePort};

#[derive(Clone, Debug, PartialEq)]
pub enum Plan {
    Create(Service),
    /// The service type changed, which cannot be done in place.
    Recreate(Service),
    /// The current service with the operator-owned fields replaced.
    Update(Service),
    Unchanged,
}

fn service_type(service: &Service) -> Option<&str> {
    service.spec.as_ref()?.type_.as_deref()
}

fn ports(service: &Service) -> Vec<ServicePort> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.clone())
        .unwrap_or_default()
}

fn selector(service: &Service) -> BTreeMap<String, String> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.clone())
        .unwrap_or_default()
}

fn or_empty(map: &Option<BTreeMap<String, String>>) -> BTreeMap<String, String> {
    map.clone().unwrap_or_default()
}

/// Fills node ports that Kubernetes assigned to `current` into `desired`, wherever `desired`
/// leaves them open.
fn inherit_node_ports(desired: &mut [ServicePort], current: &[ServicePort]) {
    for (index, port) in desired.iter_mut().enumerate() {
        if port.node_port.is_some() {
            continue;
        }
        let assigned = current
            .iter()
            .find(|current| current.name.is_some() && current.name == port.name)
            .or_else(|| current.get(index))
            .and_then(|current| current.node_port);
        port.node_port = assigned;
    }
}

pub fn plan(current: Option<&Service>, mut desired: Service) -> Plan {
    let Some(current) = current else {
        return Plan::Create(desired);
    };
    if service_type(current) != service_type(&desired) {
        return Plan::Recreate(desired);
    }

    let current_ports = ports(current);
    let mut desired_ports = ports(&desired);
    inherit_node_ports(&mut desired_ports, &current_ports);
    if let Some(spec) = &mut desired.spec {
        spec.ports = Some(desired_ports.clone());
    }

    let unchanged = or_empty(&current.metadata.labels) == or_empty(&desired.metadata.labels)
        && or_empty(&current.metadata.annotations) == or_empty(&desired.metadata.annotations)
        && selector(current) == selector(&desired)
        && current_ports == desired_ports;
    if unchanged {
        return Plan::Unchanged;
    }

    let mut updated = current.clone();
    updated.metadata.labels = desired.metadata.labels;
    updated.metadata.annotations = desired.metadata.annotations;
    let spec = updated.spec.get_or_insert_with(Default::default);
    spec.selector = desired.spec.as_ref().and_then(|spec| spec.selector.clone());
    spec.ports = Some(desired_ports);
    Plan::Update(updated)
}
