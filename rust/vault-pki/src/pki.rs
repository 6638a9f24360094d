//! Operations on a single PKI secrets engine mount

use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use openssl::x509::X509Crl;
use reqwest::{Method, StatusCode};
use serde::{de::IgnoredAny, Deserialize};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{
    utils::{asn1time_to_offsetdatetime, Asn1TimeParseError},
    Client,
};

/// Lease configuration of newly mounted engines.
const DEFAULT_LEASE_TTL: &str = "2592000"; // 30 days
const MAX_LEASE_TTL: &str = "315360000"; // 10 years
const CRL_EXPIRY: &str = "72h";
const ROLE_MAX_TTL: &str = "87600h";
const ROLE_NOT_BEFORE: &str = "15m";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list existing secrets engine mounts"))]
    ListMounts { source: crate::Error },

    #[snafu(display("failed to mount PKI engine at {path:?}"))]
    Mount { source: crate::Error, path: String },

    #[snafu(display("failed to configure CRL of {path:?}"))]
    ConfigureCrl { source: crate::Error, path: String },

    #[snafu(display("failed to unmount PKI engine at {path:?}"))]
    Unmount { source: crate::Error, path: String },

    #[snafu(display("failed to look up root CA of {path:?}"))]
    ReadRoot { source: crate::Error, path: String },

    #[snafu(display("failed to generate root CA of {path:?}"))]
    GenerateRoot { source: crate::Error, path: String },

    #[snafu(display("failed to configure role {role:?} of {path:?}"))]
    ConfigureRole {
        source: crate::Error,
        path: String,
        role: String,
    },

    #[snafu(display("failed to issue {role:?} certificate for {common_name:?} from {path:?}"))]
    Issue {
        source: crate::Error,
        path: String,
        role: String,
        common_name: String,
    },

    #[snafu(display("certificate issued by {path:?} has invalid expiration {expiration}"))]
    InvalidExpiration {
        source: time::error::ComponentRange,
        path: String,
        expiration: i64,
    },

    #[snafu(display("failed to revoke certificate {serial:?} of {path:?}"))]
    Revoke {
        source: crate::Error,
        path: String,
        serial: String,
    },

    #[snafu(display("failed to read CRL of {path:?}"))]
    ReadCrl { source: crate::Error, path: String },

    #[snafu(display("failed to parse CRL of {path:?}"))]
    ParseCrl {
        source: openssl::error::ErrorStack,
        path: String,
    },

    #[snafu(display("CRL of {path:?} has no next update"))]
    CrlWithoutNextUpdate { path: String },

    #[snafu(display("failed to convert next update of CRL of {path:?}"))]
    ConvertNextUpdate {
        source: Asn1TimeParseError,
        path: String,
    },

    #[snafu(display("failed to rotate CRL of {path:?}"))]
    RotateCrl { source: crate::Error, path: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Subject and key parameters of the self-signed root CA.
///
/// Optional name components are omitted from the subject when unset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootConfig {
    pub common_name: String,
    pub validity: Duration,
    pub rsa_bits: u32,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub country: Option<String>,
    pub locality: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    Server,
    Client,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleConfig {
    pub kind: RoleKind,
    pub default_validity: Duration,
    pub rsa_bits: u32,
}

/// A freshly issued leaf certificate with its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub serial: String,
    pub certificate: String,
    pub private_key: String,
    pub ca_certificate: String,
    pub expires_at: OffsetDateTime,
}

impl Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("serial", &self.serial)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Certificate revocation list, as currently published by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crl {
    pub pem: String,
    pub next_update: OffsetDateTime,
}

#[derive(Deserialize)]
struct CertificateData {
    certificate: String,
}

// Every field is required, a partial answer must never turn into a certificate without a serial
#[derive(Deserialize)]
struct IssueData {
    serial_number: String,
    certificate: String,
    private_key: String,
    issuing_ca: String,
    expiration: i64,
}

fn ttl(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}

/// Handle to the PKI secrets engine mounted at one path.
#[derive(Clone, Debug)]
pub struct Pki {
    client: Client,
    path: String,
}

impl Pki {
    pub(crate) fn new(client: Client, path: String) -> Self {
        Self {
            client,
            path: path.trim_matches('/').to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn is_mounted(&self) -> Result<bool> {
        let mounts = self
            .client
            .call_data::<BTreeMap<String, IgnoredAny>>(Method::GET, "sys/mounts", None)
            .await
            .context(ListMountsSnafu)?;
        Ok(mounts.contains_key(&format!("{}/", self.path)))
    }

    /// Mounts the engine (and configures its CRL) unless it is already mounted.
    pub async fn ensure_enabled(&self) -> Result<()> {
        let path = &self.path;
        if self.is_mounted().await? {
            return Ok(());
        }
        info!(pki = %path, "mounting PKI secrets engine");
        self.client
            .call(
                Method::POST,
                &format!("sys/mounts/{path}"),
                Some(&json!({
                    "type": "pki",
                    "config": {
                        "default_lease_ttl": DEFAULT_LEASE_TTL,
                        "max_lease_ttl": MAX_LEASE_TTL,
                    },
                })),
            )
            .await
            .context(MountSnafu { path })?;
        self.client
            .call(
                Method::POST,
                &format!("{path}/config/crl"),
                Some(&json!({ "expiry": CRL_EXPIRY, "disable": false })),
            )
            .await
            .context(ConfigureCrlSnafu { path })?;
        Ok(())
    }

    /// Unmounts the engine, destroying its CA and all issued certificates.
    ///
    /// Succeeds without doing anything if the engine is not mounted.
    pub async fn disable_if_enabled(&self) -> Result<()> {
        let path = &self.path;
        if !self.is_mounted().await? {
            debug!(pki = %path, "PKI secrets engine is not mounted, nothing to disable");
            return Ok(());
        }
        info!(pki = %path, "unmounting PKI secrets engine");
        self.client
            .call(Method::DELETE, &format!("sys/mounts/{path}"), None)
            .await
            .context(UnmountSnafu { path })?;
        Ok(())
    }

    async fn has_root(&self) -> Result<bool> {
        let path = &self.path;
        match self
            .client
            .call_data::<CertificateData>(Method::GET, &format!("{path}/cert/ca"), None)
            .await
        {
            Ok(data) => Ok(!data.certificate.trim().is_empty()),
            Err(crate::Error::MissingData { .. }) => Ok(false),
            Err(crate::Error::Rejected { status, .. })
                if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST =>
            {
                Ok(false)
            }
            Err(err) => Err(err).context(ReadRootSnafu { path }),
        }
    }

    /// Generates the engine's self-signed root CA unless it already has one.
    pub async fn generate_root_if_absent(&self, config: &RootConfig) -> Result<()> {
        let path = &self.path;
        if self.has_root().await? {
            return Ok(());
        }
        info!(pki = %path, common_name = %config.common_name, "generating root CA");
        let mut body = json!({
            "common_name": config.common_name,
            "key_type": "rsa",
            "key_bits": config.rsa_bits,
            "ttl": ttl(config.validity),
            "exclude_cn_from_sans": true,
        });
        for (key, value) in [
            ("organization", &config.organization),
            ("ou", &config.organizational_unit),
            ("country", &config.country),
            ("locality", &config.locality),
        ] {
            if let Some(value) = value {
                body[key] = json!(value);
            }
        }
        self.client
            .call(
                Method::POST,
                &format!("{path}/root/generate/internal"),
                Some(&body),
            )
            .await
            .context(GenerateRootSnafu { path })?;
        Ok(())
    }

    /// Creates or overwrites the role `name`.
    pub async fn configure_role(&self, name: &str, config: &RoleConfig) -> Result<()> {
        let path = &self.path;
        let is_server = config.kind == RoleKind::Server;
        let ext_key_usage = if is_server {
            "TLS Web Server Authentication"
        } else {
            "TLS Web Client Authentication"
        };
        self.client
            .call(
                Method::POST,
                &format!("{path}/roles/{name}"),
                Some(&json!({
                    "key_type": "rsa",
                    "key_bits": config.rsa_bits,
                    "ttl": ttl(config.default_validity),
                    "max_ttl": ROLE_MAX_TTL,
                    "allow_any_name": true,
                    "server_flag": is_server,
                    "client_flag": !is_server,
                    "generate_lease": false,
                    "not_before_duration": ROLE_NOT_BEFORE,
                    "key_usage": ["DigitalSignature", "KeyAgreement", "KeyEncipherment"],
                    "ext_key_usage": [ext_key_usage],
                })),
            )
            .await
            .context(ConfigureRoleSnafu { path, role: name })?;
        Ok(())
    }

    /// Issues a new certificate for `common_name` from `role`.
    ///
    /// Without a `validity` the role's default TTL applies.
    pub async fn issue(
        &self,
        role: &str,
        common_name: &str,
        validity: Option<Duration>,
    ) -> Result<IssuedCertificate> {
        let path = &self.path;
        let mut body = json!({ "common_name": common_name, "format": "pem" });
        if let Some(validity) = validity {
            body["ttl"] = json!(ttl(validity));
        }
        let data = self
            .client
            .call_data::<IssueData>(Method::POST, &format!("{path}/issue/{role}"), Some(&body))
            .await
            .context(IssueSnafu {
                path,
                role,
                common_name,
            })?;
        let expires_at =
            OffsetDateTime::from_unix_timestamp(data.expiration).context(InvalidExpirationSnafu {
                path,
                expiration: data.expiration,
            })?;
        debug!(pki = %path, role, serial = %data.serial_number, %expires_at, "issued certificate");
        Ok(IssuedCertificate {
            serial: data.serial_number,
            certificate: data.certificate,
            private_key: data.private_key,
            ca_certificate: data.issuing_ca,
            expires_at,
        })
    }

    /// Revokes the certificate with the given serial.
    ///
    /// Serials that Vault does not know (for example because they have already expired and been
    /// tidied) are treated as revoked. Revoking an already revoked serial is a no-op on Vault's side.
    pub async fn revoke(&self, serial: &str) -> Result<()> {
        let path = &self.path;
        match self
            .client
            .call(
                Method::POST,
                &format!("{path}/revoke"),
                Some(&json!({ "serial_number": serial })),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                debug!(pki = %path, serial, "certificate is unknown, treating as revoked");
                Ok(())
            }
            Err(err) => Err(err).context(RevokeSnafu { path, serial }),
        }
    }

    /// Reads the currently published CRL.
    pub async fn fetch_crl(&self) -> Result<Crl> {
        let path = &self.path;
        let data = self
            .client
            .call_data::<CertificateData>(Method::GET, &format!("{path}/cert/crl"), None)
            .await
            .context(ReadCrlSnafu { path })?;
        let next_update = parse_next_update(&data.certificate, path)?;
        Ok(Crl {
            pem: data.certificate,
            next_update,
        })
    }

    /// Forces Vault to rebuild and re-sign the CRL.
    pub async fn rotate_crl(&self) -> Result<()> {
        let path = &self.path;
        self.client
            .call(Method::GET, &format!("{path}/crl/rotate"), None)
            .await
            .context(RotateCrlSnafu { path })?;
        Ok(())
    }
}

fn parse_next_update(pem: &str, path: &str) -> Result<OffsetDateTime> {
    let crl = X509Crl::from_pem(pem.as_bytes()).context(ParseCrlSnafu { path })?;
    let next_update = crl
        .next_update()
        .context(CrlWithoutNextUpdateSnafu { path })?;
    asn1time_to_offsetdatetime(next_update).context(ConvertNextUpdateSnafu { path })
}
