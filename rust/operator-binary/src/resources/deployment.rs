use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
            core::v1::{
                Capabilities, ConfigMapVolumeSource, Container, ContainerPort, PodSpec,
                PodTemplateSpec, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
            },
        },
        apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
    },
};

use super::{owned_meta, selector, OwnerReferenceError, ENTRYPOINT_KEY};
use crate::{certificate::EXPIRES_AT_ANNOTATION, crd::OvpnServer, effective::ServerConfig};

pub const CONFIG_DIR: &str = "/etc/openvpn";
pub const ENTRYPOINT_DIR: &str = "/app";
pub const TLS_DIR: &str = "/secrets/tls";
pub const SHARED_DIR: &str = "/secrets/shared";
pub const CRL_DIR: &str = "/secrets/crl";

/// Port that OpenVPN listens on inside the pod, independent of the exposed port.
pub const CONTAINER_PORT: i32 = 1194;

const CONTAINER_NAME: &str = "openvpn";
const READ_MODE: i32 = 0o644;
const EXEC_MODE: i32 = 0o775;

/// Builds the server deployment.
///
/// `certificate_expires_at` ends up in the pod template, so that every renewed server
/// certificate rolls the pod.
pub fn build(
    server: &OvpnServer,
    config: &ServerConfig,
    image: &str,
    certificate_expires_at: &str,
) -> Result<Deployment, OwnerReferenceError> {
    let labels = selector(config);
    let mut pod_annotations = config.pod_annotations.clone();
    pod_annotations.insert(
        EXPIRES_AT_ANNOTATION.to_string(),
        certificate_expires_at.to_string(),
    );

    let config_map_volume = |name: &str, config_map: &str, mode: i32| Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map.to_string()),
            default_mode: Some(mode),
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    };
    let secret_volume = |name: &str, secret: &str| Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            default_mode: Some(READ_MODE),
            ..SecretVolumeSource::default()
        }),
        ..Volume::default()
    };
    let names = &config.names;
    let volumes = vec![
        config_map_volume("config", &names.ovpn_config_map, READ_MODE),
        config_map_volume("entrypoint", &names.entrypoint_config_map, EXEC_MODE),
        secret_volume("tls-keys", &names.server_certificate),
        secret_volume("shared-secrets", &names.shared_secret),
        secret_volume("crl", &names.crl),
    ];
    let volume_mounts = [
        ("config", CONFIG_DIR),
        ("entrypoint", ENTRYPOINT_DIR),
        ("tls-keys", TLS_DIR),
        ("shared-secrets", SHARED_DIR),
        ("crl", CRL_DIR),
    ]
    .into_iter()
    .map(|(name, mount_path)| VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        read_only: Some(true),
        ..VolumeMount::default()
    })
    .collect();

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![format!("{ENTRYPOINT_DIR}/{ENTRYPOINT_KEY}")]),
        ports: Some(vec![ContainerPort {
            name: Some("ovpn".to_string()),
            container_port: CONTAINER_PORT,
            protocol: Some(config.protocol.to_string()),
            ..ContainerPort::default()
        }]),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                ..Capabilities::default()
            }),
            ..SecurityContext::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Container::default()
    };

    Ok(Deployment {
        metadata: owned_meta(
            server,
            &config.names.deployment,
            config.deployment_annotations.clone(),
        )?,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            progress_deadline_seconds: Some(600),
            revision_history_limit: Some(10),
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..DeploymentStrategy::default()
            }),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(pod_annotations),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    termination_grace_period_seconds: Some(30),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    })
}

/// Annotations of the deployment's pod template, if any.
#[cfg(test)]
pub fn pod_annotations(deployment: &Deployment) -> std::collections::BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.annotations.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{build, pod_annotations};
    use crate::{
        certificate::EXPIRES_AT_ANNOTATION, effective::ServerConfig,
        resources::test_fixtures::server,
    };

    #[test]
    fn deployment_shape() {
        let server = server(
            r#"
  network:
    host: vpn.example.com
  deployment:
    annotations:
      example.com/owner: network
    podAnnotations:
      example.com/team: network
"#,
        );
        let config = ServerConfig::resolve(&server).unwrap();
        let deployment = build(&server, &config, "openvpn:2.6", "2025-03-17T12:00:00Z").unwrap();

        assert_eq!(
            deployment.metadata.annotations.as_ref().unwrap()["example.com/owner"],
            "network"
        );
        let annotations = pod_annotations(&deployment);
        assert_eq!(annotations[EXPIRES_AT_ANNOTATION], "2025-03-17T12:00:00Z");
        assert_eq!(annotations["example.com/team"], "network");

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.strategy.unwrap().type_.as_deref(), Some("Recreate"));
        assert_eq!(
            spec.selector.match_labels.unwrap()["app.kubernetes.io/name"],
            "vpn"
        );
        let pod = spec.template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes.len(), 5);
        assert_eq!(
            volumes[1].config_map.as_ref().unwrap().default_mode,
            Some(0o775)
        );
        assert_eq!(
            volumes[4].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("vpn-crl")
        );
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("openvpn:2.6"));
        assert_eq!(
            container.security_context.as_ref().unwrap().capabilities.as_ref().unwrap().add,
            Some(vec!["NET_ADMIN".to_string()])
        );
    }
}
