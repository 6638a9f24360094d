//! Resolves the user-facing custom resources into fully defaulted and validated configuration.
//!
//! Resolution runs once at the start of every reconcile, everything downstream only consumes
//! [`ServerConfig`] and [`ClientConfig`].

use std::{
    collections::BTreeMap,
    fmt::Display,
    net::{AddrParseError, Ipv4Addr},
    num::ParseIntError,
    time::Duration,
};

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::kube::ResourceExt;
use stackable_vault_pki::{RoleConfig, RoleKind, RootConfig};

use crate::crd::{Cipher, Hmac, OvpnClient, OvpnServer, Protocol, ServiceType};

const HOUR: u64 = 60 * 60;

pub const DEFAULT_PKI_COMMON_NAME: &str = "ovpn-pki";
pub const DEFAULT_ROOT_VALIDITY: Duration = Duration::from_secs(87600 * HOUR);
pub const DEFAULT_SERVER_VALIDITY: Duration = Duration::from_secs(2160 * HOUR);
pub const DEFAULT_CLIENT_VALIDITY: Duration = Duration::from_secs(17520 * HOUR);
pub const DEFAULT_RSA_BITS: u32 = 4096;
pub const DEFAULT_DH_BITS: u32 = 2048;
pub const DEFAULT_PORT: u16 = 1194;
pub const DEFAULT_NAMESERVERS: [Ipv4Addr; 2] =
    [Ipv4Addr::new(8, 8, 4, 4), Ipv4Addr::new(8, 8, 8, 8)];

const RSA_BITS: [u32; 3] = [2048, 4096, 8192];
const DH_BITS: [u32; 3] = [1024, 2048, 4096];
const NODE_PORTS: std::ops::RangeInclusive<u16> = 30000..=32767;

pub const SERVER_ROLE: &str = "server";
pub const CLIENT_ROLE: &str = "client";

#[derive(Debug, Snafu)]
pub enum ResolveError {
    #[snafu(display("object has no namespace"))]
    NoNamespace,

    #[snafu(display("network.host must not be empty"))]
    EmptyHost,

    #[snafu(display("route {route:?} is not of the form <ipv4>/<prefix length>"))]
    MalformedRoute { route: String },

    #[snafu(display("route {route:?} has an invalid network address"))]
    InvalidRouteAddress {
        source: AddrParseError,
        route: String,
    },

    #[snafu(display("route {route:?} has an invalid prefix length"))]
    InvalidRoutePrefix {
        source: ParseIntError,
        route: String,
    },

    #[snafu(display("route {route:?} has a prefix length larger than 32"))]
    RoutePrefixTooLong { route: String },

    #[snafu(display("nameserver {nameserver:?} is not an IPv4 address"))]
    InvalidNameserver {
        source: AddrParseError,
        nameserver: String,
    },

    #[snafu(display("{field} must be one of {RSA_BITS:?}, got {bits}"))]
    UnsupportedRsaBits { field: &'static str, bits: u32 },

    #[snafu(display("security.diffieHellmanBits must be one of {DH_BITS:?}, got {bits}"))]
    UnsupportedDhBits { bits: u32 },

    #[snafu(display("service.port {port} is outside of the NodePort range {NODE_PORTS:?}"))]
    NodePortOutOfRange { port: u16 },

    #[snafu(display("commonName must not be empty"))]
    EmptyCommonName,

    #[snafu(display("serverName must not be empty"))]
    EmptyServerName,
}
type Result<T, E = ResolveError> = std::result::Result<T, E>;

/// An IPv4 network that is routed through the VPN.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

impl Route {
    pub fn parse(route: &str) -> Result<Self> {
        let (network, prefix_len) = route.split_once('/').context(MalformedRouteSnafu { route })?;
        let network = network
            .parse()
            .context(InvalidRouteAddressSnafu { route })?;
        let prefix_len: u8 = prefix_len
            .parse()
            .context(InvalidRoutePrefixSnafu { route })?;
        if prefix_len > 32 {
            return RoutePrefixTooLongSnafu { route }.fail();
        }
        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// The prefix length in dotted notation, such as `255.255.0.0` for `/16`.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(
            u32::MAX
                .checked_shl(32 - u32::from(self.prefix_len))
                .unwrap_or(0),
        )
    }
}

/// Formats as `<network>/<netmask>`, as understood by iptables.
impl Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.netmask())
    }
}

/// Names of all objects derived from a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerObjectNames {
    pub shared_secret: String,
    pub server_certificate: String,
    pub crl: String,
    pub deployment: String,
    pub ovpn_config_map: String,
    pub entrypoint_config_map: String,
    pub service: String,
}

impl ServerObjectNames {
    /// Resolves names on their own, cleanup needs them even if the rest of the server is invalid.
    pub fn new(server: &OvpnServer) -> Self {
        let spec = &server.spec;
        let or_default = |name: &Option<String>, suffix: &str| {
            name.clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("{}{suffix}", server.name_any()))
        };
        Self {
            shared_secret: or_default(&spec.secrets.shared_secret_name, "-shared-secret"),
            server_certificate: or_default(
                &spec.secrets.server_certificate_name,
                "-server-certificate",
            ),
            crl: or_default(&spec.secrets.crl_name, "-crl"),
            deployment: or_default(&spec.deployment.name, ""),
            ovpn_config_map: or_default(&spec.deployment.ovpn_config_map_name, "-config"),
            entrypoint_config_map: or_default(
                &spec.deployment.entrypoint_config_map_name,
                "-entrypoint",
            ),
            service: or_default(&spec.service.name, ""),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub namespace: String,
    pub name: String,
    pub host: String,
    pub protocol: Protocol,
    pub redirect_all: bool,
    pub routes: Vec<Route>,
    pub nameservers: Vec<Ipv4Addr>,
    pub hmac: Hmac,
    pub cipher: Cipher,
    pub dh_bits: u32,
    pub root: RootConfig,
    pub server_role: RoleConfig,
    pub client_role: RoleConfig,
    pub names: ServerObjectNames,
    pub deployment_annotations: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
    pub service_annotations: BTreeMap<String, String>,
    pub port: u16,
    pub service_type: ServiceType,
}

fn validity(validity: Option<stackable_operator::time::Duration>, default: Duration) -> Duration {
    validity
        .map(|validity| *validity)
        .filter(|validity| !validity.is_zero())
        .unwrap_or(default)
}

fn rsa_bits(bits: Option<u32>, field: &'static str) -> Result<u32> {
    let bits = bits.unwrap_or(DEFAULT_RSA_BITS);
    if RSA_BITS.contains(&bits) {
        Ok(bits)
    } else {
        UnsupportedRsaBitsSnafu { field, bits }.fail()
    }
}

impl ServerConfig {
    pub fn resolve(server: &OvpnServer) -> Result<Self> {
        let spec = &server.spec;
        let namespace = server.namespace().context(NoNamespaceSnafu)?;
        let name = server.name_any();

        let host = spec.network.host.trim().to_string();
        if host.is_empty() {
            return EmptyHostSnafu.fail();
        }

        let routes = spec
            .traffic
            .routes
            .iter()
            .map(|route| Route::parse(route.trim()))
            .collect::<Result<Vec<_>>>()?;
        let nameservers = if spec.traffic.nameservers.is_empty() {
            DEFAULT_NAMESERVERS.to_vec()
        } else {
            spec.traffic
                .nameservers
                .iter()
                .map(|nameserver| {
                    nameserver
                        .trim()
                        .parse()
                        .context(InvalidNameserverSnafu { nameserver })
                })
                .collect::<Result<Vec<_>>>()?
        };

        let security = &spec.security;
        let dh_bits = security.diffie_hellman_bits.unwrap_or(DEFAULT_DH_BITS);
        if !DH_BITS.contains(&dh_bits) {
            return UnsupportedDhBitsSnafu { bits: dh_bits }.fail();
        }
        let dn = &security.pki.dn;
        let root = RootConfig {
            common_name: dn
                .common_name
                .clone()
                .filter(|cn| !cn.is_empty())
                .unwrap_or_else(|| DEFAULT_PKI_COMMON_NAME.to_string()),
            validity: validity(security.pki.certificate.validity, DEFAULT_ROOT_VALIDITY),
            rsa_bits: rsa_bits(security.pki.certificate.rsa_bits, "security.pki.rsaBits")?,
            organization: dn.organization.clone(),
            organizational_unit: dn.organizational_unit.clone(),
            country: dn.country.clone(),
            locality: dn.locality.clone(),
        };
        let server_role = RoleConfig {
            kind: RoleKind::Server,
            default_validity: validity(security.server.validity, DEFAULT_SERVER_VALIDITY),
            rsa_bits: rsa_bits(security.server.rsa_bits, "security.server.rsaBits")?,
        };
        let client_role = RoleConfig {
            kind: RoleKind::Client,
            default_validity: validity(security.clients.validity, DEFAULT_CLIENT_VALIDITY),
            rsa_bits: rsa_bits(security.clients.rsa_bits, "security.clients.rsaBits")?,
        };

        let service_type = spec.service.service_type.unwrap_or(ServiceType::LoadBalancer);
        let port = spec.service.port.unwrap_or(DEFAULT_PORT);
        if service_type == ServiceType::NodePort && !NODE_PORTS.contains(&port) {
            return NodePortOutOfRangeSnafu { port }.fail();
        }

        let names = ServerObjectNames::new(server);

        Ok(Self {
            namespace,
            name,
            host,
            protocol: spec.network.protocol.unwrap_or(Protocol::Udp),
            redirect_all: spec.traffic.redirect_all,
            routes,
            nameservers,
            hmac: security.hmac.unwrap_or(Hmac::Sha384),
            cipher: security.cipher.unwrap_or(Cipher::Aes256Gcm),
            dh_bits,
            root,
            server_role,
            client_role,
            names,
            deployment_annotations: spec.deployment.annotations.clone(),
            pod_annotations: spec.deployment.pod_annotations.clone(),
            service_annotations: spec.service.annotations.clone(),
            port,
            service_type,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub namespace: String,
    pub name: String,
    pub server_name: String,
    pub common_name: String,
    /// `None` means the default validity of the client role.
    pub validity: Option<Duration>,
    pub secret_name: String,
}

impl ClientConfig {
    /// Resolves everything that can be known without looking at the server.
    pub fn resolve(client: &OvpnClient) -> Result<Self> {
        let spec = &client.spec;
        let namespace = client.namespace().context(NoNamespaceSnafu)?;
        let common_name = spec.common_name.trim().to_string();
        if common_name.is_empty() {
            return EmptyCommonNameSnafu.fail();
        }
        if spec.server_name.is_empty() {
            return EmptyServerNameSnafu.fail();
        }
        Ok(Self {
            namespace,
            name: client.name_any(),
            server_name: spec.server_name.clone(),
            common_name,
            validity: spec
                .certificate
                .validity
                .map(|validity| *validity)
                .filter(|validity| !validity.is_zero()),
            secret_name: Self::secret_name(client),
        })
    }

    /// Name of the secret holding the client's profile, which also has to be known for invalid
    /// clients to revoke their certificate.
    pub fn secret_name(client: &OvpnClient) -> String {
        client
            .spec
            .certificate
            .secret_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| client.name_any())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::{
        ClientConfig, ResolveError, Route, ServerConfig, DEFAULT_CLIENT_VALIDITY,
        DEFAULT_NAMESERVERS, DEFAULT_ROOT_VALIDITY, DEFAULT_SERVER_VALIDITY,
    };
    use crate::crd::{Cipher, Hmac, OvpnClient, OvpnServer, Protocol, ServiceType};

    fn server(spec: &str) -> OvpnServer {
        let input = format!(
            r#"
apiVersion: vpn.stackable.tech/v1alpha1
kind: OvpnServer
metadata:
  name: vpn
  namespace: default
spec:
{spec}
"#
        );
        serde_yaml::from_str(&input).unwrap()
    }

    #[test]
    fn netmasks() {
        let mask = |route: &str| Route::parse(route).unwrap().netmask();
        assert_eq!(mask("10.0.0.0/8"), Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(mask("172.16.0.0/12"), Ipv4Addr::new(255, 240, 0, 0));
        assert_eq!(mask("192.168.1.7/32"), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(mask("0.0.0.0/0"), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(
            Route::parse("10.1.0.0/16").unwrap().to_string(),
            "10.1.0.0/255.255.0.0"
        );
    }

    #[test]
    fn malformed_routes() {
        assert!(matches!(
            Route::parse("10.0.0.0"),
            Err(ResolveError::MalformedRoute { .. })
        ));
        assert!(matches!(
            Route::parse("10.0.0/8"),
            Err(ResolveError::InvalidRouteAddress { .. })
        ));
        assert!(matches!(
            Route::parse("10.0.0.0/x"),
            Err(ResolveError::InvalidRoutePrefix { .. })
        ));
        assert!(matches!(
            Route::parse("10.0.0.0/33"),
            Err(ResolveError::RoutePrefixTooLong { .. })
        ));
    }

    #[test]
    fn server_defaults() {
        let config = ServerConfig::resolve(&server(
            r#"
  network:
    host: vpn.example.com
"#,
        ))
        .unwrap();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.protocol, Protocol::Udp);
        assert_eq!(config.nameservers, DEFAULT_NAMESERVERS.to_vec());
        assert_eq!(config.hmac, Hmac::Sha384);
        assert_eq!(config.cipher, Cipher::Aes256Gcm);
        assert_eq!(config.dh_bits, 2048);
        assert_eq!(config.root.common_name, "ovpn-pki");
        assert_eq!(config.root.validity, DEFAULT_ROOT_VALIDITY);
        assert_eq!(config.root.rsa_bits, 4096);
        assert_eq!(config.server_role.default_validity, DEFAULT_SERVER_VALIDITY);
        assert_eq!(config.client_role.default_validity, DEFAULT_CLIENT_VALIDITY);
        assert_eq!(config.port, 1194);
        assert_eq!(config.service_type, ServiceType::LoadBalancer);
        assert_eq!(config.names.shared_secret, "vpn-shared-secret");
        assert_eq!(config.names.server_certificate, "vpn-server-certificate");
        assert_eq!(config.names.crl, "vpn-crl");
        assert_eq!(config.names.deployment, "vpn");
        assert_eq!(config.names.ovpn_config_map, "vpn-config");
        assert_eq!(config.names.entrypoint_config_map, "vpn-entrypoint");
        assert_eq!(config.names.service, "vpn");
    }

    #[test]
    fn zero_validity_means_default() {
        let config = ServerConfig::resolve(&server(
            r#"
  network:
    host: vpn.example.com
  security:
    server:
      validity: 0s
"#,
        ))
        .unwrap();
        assert_eq!(config.server_role.default_validity, DEFAULT_SERVER_VALIDITY);
    }

    #[test]
    fn invalid_server_configs() {
        let resolve = |spec: &str| ServerConfig::resolve(&server(spec)).unwrap_err();
        assert!(matches!(
            resolve(
                r#"
  network:
    host: " "
"#
            ),
            ResolveError::EmptyHost
        ));
        assert!(matches!(
            resolve(
                r#"
  network:
    host: vpn.example.com
  traffic:
    routes: [10.0.0.0/8, "bogus"]
"#
            ),
            ResolveError::MalformedRoute { .. }
        ));
        assert!(matches!(
            resolve(
                r#"
  network:
    host: vpn.example.com
  traffic:
    nameservers: [dns.example.com]
"#
            ),
            ResolveError::InvalidNameserver { .. }
        ));
        assert!(matches!(
            resolve(
                r#"
  network:
    host: vpn.example.com
  security:
    clients:
      rsaBits: 1024
"#
            ),
            ResolveError::UnsupportedRsaBits {
                field: "security.clients.rsaBits",
                bits: 1024
            }
        ));
        assert!(matches!(
            resolve(
                r#"
  network:
    host: vpn.example.com
  security:
    diffieHellmanBits: 3072
"#
            ),
            ResolveError::UnsupportedDhBits { bits: 3072 }
        ));
        assert!(matches!(
            resolve(
                r#"
  network:
    host: vpn.example.com
  service:
    serviceType: NodePort
"#
            ),
            ResolveError::NodePortOutOfRange { port: 1194 }
        ));
    }

    #[test]
    fn client_resolution() {
        let client: OvpnClient = serde_yaml::from_str(
            r#"
apiVersion: vpn.stackable.tech/v1alpha1
kind: OvpnClient
metadata:
  name: alice
  namespace: default
spec:
  serverName: vpn
  commonName: alice@example.com
  certificate:
    validity: 0s
"#,
        )
        .unwrap();
        let config = ClientConfig::resolve(&client).unwrap();
        assert_eq!(config.validity, None);
        assert_eq!(config.secret_name, "alice");
        assert_eq!(config.server_name, "vpn");

        let mut nameless = client;
        nameless.spec.common_name = String::new();
        assert!(matches!(
            ClientConfig::resolve(&nameless),
            Err(ResolveError::EmptyCommonName)
        ));
    }
}
