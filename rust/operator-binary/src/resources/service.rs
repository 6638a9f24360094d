use stackable_operator::k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};

use super::{deployment::CONTAINER_PORT, owned_meta, selector, OwnerReferenceError};
use crate::{
    crd::{OvpnServer, ServiceType},
    effective::ServerConfig,
};

pub const PORT_NAME: &str = "ovpn";

/// The service as the operator wants it to be.
///
/// Load balancers get their node port assigned by Kubernetes, see [`crate::drift`].
pub fn build(server: &OvpnServer, config: &ServerConfig) -> Result<Service, OwnerReferenceError> {
    let node_port = match config.service_type {
        ServiceType::NodePort => Some(i32::from(config.port)),
        ServiceType::LoadBalancer => None,
    };
    Ok(Service {
        metadata: owned_meta(server, &config.names.service, config.service_annotations.clone())?,
        spec: Some(ServiceSpec {
            type_: Some(config.service_type.to_string()),
            selector: Some(selector(config)),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_string()),
                protocol: Some(config.protocol.to_string()),
                port: i32::from(config.port),
                target_port: Some(IntOrString::Int(CONTAINER_PORT)),
                node_port,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    })
}
