use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
    time::Duration,
};
use strum::{Display, IntoStaticStr};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "vpn.stackable.tech",
    version = "v1alpha1",
    kind = "OvpnServer",
    namespaced,
    shortname = "ovpnserver",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct OvpnServerSpec {
    pub network: ServerNetwork,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub secrets: ServerSecrets,
    #[serde(default)]
    pub deployment: ServerDeployment,
    #[serde(default)]
    pub service: ServerService,
}

/// How the VPN server can be reached from the outside.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerNetwork {
    /// The host that clients connect to, also used as the common name of the server certificate.
    pub host: String,
    /// Transport protocol, defaults to `UDP`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Display, IntoStaticStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficConfig {
    /// Route all client traffic through the VPN.
    #[serde(default)]
    pub redirect_all: bool,
    /// IPv4 ranges (`<ip>/<bits>`) that are routed through the VPN. Ignored if `redirectAll` is set.
    #[serde(default)]
    pub routes: Vec<String>,
    /// Nameservers pushed to clients, defaults to `8.8.4.4` and `8.8.8.8`.
    #[serde(default)]
    pub nameservers: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<Hmac>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<Cipher>,
    /// Size of the Diffie-Hellman parameters (1024, 2048 or 4096), defaults to 2048.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diffie_hellman_bits: Option<u32>,
    #[serde(default)]
    pub pki: PkiConfig,
    /// Certificate settings of the server. Validity defaults to 90 days.
    #[serde(default)]
    pub server: CertificateConfig,
    /// Default certificate settings of clients. Validity defaults to 2 years.
    #[serde(default)]
    pub clients: CertificateConfig,
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Display, IntoStaticStr,
)]
pub enum Hmac {
    #[serde(rename = "SHA256")]
    #[strum(serialize = "SHA256")]
    Sha256,
    #[serde(rename = "SHA384", alias = "SHA-384")]
    #[strum(serialize = "SHA384")]
    Sha384,
    #[serde(rename = "SHA512")]
    #[strum(serialize = "SHA512")]
    Sha512,
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Display, IntoStaticStr,
)]
pub enum Cipher {
    #[serde(rename = "AES-128-GCM")]
    #[strum(serialize = "AES-128-GCM")]
    Aes128Gcm,
    #[serde(rename = "AES-256-GCM")]
    #[strum(serialize = "AES-256-GCM")]
    Aes256Gcm,
}

/// Validity and key size of a certificate.
///
/// Changing the key size of an existing root CA has no effect.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub validity: Option<Duration>,
    /// RSA key size (2048, 4096 or 8192), defaults to 4096.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa_bits: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PkiConfig {
    /// Root CA settings. Validity defaults to 10 years.
    #[serde(default, flatten)]
    pub certificate: CertificateConfig,
    #[serde(default)]
    pub dn: DistinguishedName,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DistinguishedName {
    /// Defaults to `ovpn-pki`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
}

/// Names of the secrets managed for a server.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerSecrets {
    /// Secret holding the DH parameters and TLS auth key, defaults to `<server>-shared-secret`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret_name: Option<String>,
    /// Defaults to `<server>-server-certificate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_certificate_name: Option<String>,
    /// Defaults to `<server>-crl`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crl_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerDeployment {
    /// Defaults to the name of the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_annotations: BTreeMap<String, String>,
    /// Defaults to `<server>-config`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovpn_config_map_name: Option<String>,
    /// Defaults to `<server>-entrypoint`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint_config_map_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerService {
    /// Defaults to the name of the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Port that clients connect to, defaults to 1194. Must be within 30000-32767 for `NodePort`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Defaults to `LoadBalancer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Display, IntoStaticStr,
)]
pub enum ServiceType {
    LoadBalancer,
    NodePort,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "vpn.stackable.tech",
    version = "v1alpha1",
    kind = "OvpnClient",
    namespaced,
    shortname = "ovpnclient",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct OvpnClientSpec {
    /// Name of the [`OvpnServer`] in the same namespace that the client connects to.
    pub server_name: String,
    /// Common name of the client certificate, typically something unique like an email address.
    pub common_name: String,
    #[serde(default)]
    pub certificate: ClientCertificate,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientCertificate {
    /// Overrides the server's default client certificate validity.
    ///
    /// Zero means the server's default validity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub validity: Option<Duration>,
    /// Secret that receives the client profile, defaults to the name of the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}
