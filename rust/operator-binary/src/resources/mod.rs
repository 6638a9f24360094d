//! Builders for the objects derived from an [`OvpnServer`](crate::crd::OvpnServer).

use std::collections::BTreeMap;

use snafu::{OptionExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::{ConfigMap, Secret},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
        ByteString,
    },
    kube::ResourceExt,
};

use crate::{effective::ServerConfig, store::Object, OPERATOR_NAME};

pub mod deployment;
pub mod render;
pub mod service;

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub const OVPN_CONFIG_KEY: &str = "openvpn.conf";
pub const ENTRYPOINT_KEY: &str = "entrypoint.sh";

#[derive(Debug, Snafu)]
#[snafu(display("{owner} has no uid yet, cannot own derived objects"))]
pub struct OwnerReferenceError {
    owner: String,
}

/// Metadata of an object that is owned (and garbage collected) through `owner`.
pub fn owned_meta<K: Object>(
    owner: &K,
    name: &str,
    annotations: BTreeMap<String, String>,
) -> Result<ObjectMeta, OwnerReferenceError> {
    let owner_reference = owner
        .controller_owner_ref(&())
        .context(OwnerReferenceSnafu {
            owner: owner.name_any(),
        })?;
    Ok(ObjectMeta {
        name: Some(name.to_string()),
        namespace: owner.namespace(),
        labels: Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            OPERATOR_NAME.to_string(),
        )])),
        annotations: (!annotations.is_empty()).then_some(annotations),
        owner_references: Some(vec![owner_reference]),
        ..ObjectMeta::default()
    })
}

pub fn secret_data<'a>(
    entries: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> BTreeMap<String, ByteString> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect()
}

/// Reads a UTF-8 entry of a secret.
pub fn secret_entry<'a>(secret: &'a Secret, key: &str) -> Option<&'a str> {
    secret
        .data
        .as_ref()?
        .get(key)
        .and_then(|value| std::str::from_utf8(&value.0).ok())
        .filter(|value| !value.trim().is_empty())
}

pub fn config_map<K: Object>(
    owner: &K,
    name: &str,
    key: &str,
    content: String,
) -> Result<ConfigMap, OwnerReferenceError> {
    Ok(ConfigMap {
        metadata: owned_meta(owner, name, BTreeMap::new())?,
        data: Some(BTreeMap::from([(key.to_string(), content)])),
        ..ConfigMap::default()
    })
}

/// Labels that select the server's pods.
pub fn selector(config: &ServerConfig) -> BTreeMap<String, String> {
    BTreeMap::from([(NAME_LABEL.to_string(), config.names.deployment.clone())])
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use stackable_operator::k8s_openapi::api::core::v1::Secret;

    use super::{owned_meta, secret_data, secret_entry, test_fixtures::server};

    #[test]
    fn owned_objects_reference_their_owner() {
        let server = server("  network:\n    host: vpn.example.com\n");
        let meta = owned_meta(&server, "vpn-crl", BTreeMap::new()).unwrap();
        assert_eq!(meta.namespace.as_deref(), Some("default"));
        assert_eq!(meta.annotations, None);
        let owner = &meta.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "OvpnServer");
        assert_eq!(owner.name, "vpn");
        assert_eq!(owner.controller, Some(true));

        let mut uidless = server;
        uidless.metadata.uid = None;
        assert!(owned_meta(&uidless, "vpn-crl", BTreeMap::new()).is_err());
    }

    #[test]
    fn blank_secret_entries_are_missing() {
        let secret = Secret {
            data: Some(secret_data([("dh-params", "DH"), ("tls-auth", "  \n")])),
            ..Secret::default()
        };
        assert_eq!(secret_entry(&secret, "dh-params"), Some("DH"));
        assert_eq!(secret_entry(&secret, "tls-auth"), None);
        assert_eq!(secret_entry(&secret, "crl-pem"), None);
    }
}
