//! The operations that the reconcilers need from the certificate authority.

use std::{
    fmt::{Debug, Display},
    time::Duration,
};

use async_trait::async_trait;
use stackable_vault_pki::{Crl, IssuedCertificate, RoleConfig, RootConfig};

#[cfg(test)]
pub mod fake;

/// Identifies the PKI instance that belongs to one server.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PkiPath(String);

impl PkiPath {
    pub fn for_server(base: &str, namespace: &str, server: &str) -> Self {
        Self(format!("{}/{namespace}/{server}", base.trim_matches('/')))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&PkiPath> for PkiPath {
    fn from(path: &PkiPath) -> Self {
        path.clone()
    }
}

impl Display for PkiPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct SignerError(Box<dyn std::error::Error + Send + Sync>);

impl SignerError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }
}

impl Debug for SignerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for SignerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SignerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// External certificate authority, holding one PKI instance per server.
///
/// Implementations must not retry on their own.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn ensure_enabled(&self, pki: &PkiPath) -> Result<(), SignerError>;

    async fn disable_if_enabled(&self, pki: &PkiPath) -> Result<(), SignerError>;

    async fn generate_root_if_absent(
        &self,
        pki: &PkiPath,
        config: &RootConfig,
    ) -> Result<(), SignerError>;

    async fn configure_role(
        &self,
        pki: &PkiPath,
        name: &str,
        config: &RoleConfig,
    ) -> Result<(), SignerError>;

    /// Without a `validity` the role's default applies.
    async fn issue(
        &self,
        pki: &PkiPath,
        role: &str,
        common_name: &str,
        validity: Option<Duration>,
    ) -> Result<IssuedCertificate, SignerError>;

    /// Must succeed for serials that are already revoked or unknown.
    async fn revoke(&self, pki: &PkiPath, serial: &str) -> Result<(), SignerError>;

    async fn fetch_crl(&self, pki: &PkiPath) -> Result<Crl, SignerError>;

    async fn rotate_crl(&self, pki: &PkiPath) -> Result<(), SignerError>;
}

#[async_trait]
impl Signer for stackable_vault_pki::Client {
    async fn ensure_enabled(&self, pki: &PkiPath) -> Result<(), SignerError> {
        self.pki(pki.as_str())
            .ensure_enabled()
            .await
            .map_err(SignerError::new)
    }

    async fn disable_if_enabled(&self, pki: &PkiPath) -> Result<(), SignerError> {
        self.pki(pki.as_str())
            .disable_if_enabled()
            .await
            .map_err(SignerError::new)
    }

    async fn generate_root_if_absent(
        &self,
        pki: &PkiPath,
        config: &RootConfig,
    ) -> Result<(), SignerError> {
        self.pki(pki.as_str())
            .generate_root_if_absent(config)
            .await
            .map_err(SignerError::new)
    }

    async fn configure_role(
        &self,
        pki: &PkiPath,
        name: &str,
        config: &RoleConfig,
    ) -> Result<(), SignerError> {
        self.pki(pki.as_str())
            .configure_role(name, config)
            .await
            .map_err(SignerError::new)
    }

    async fn issue(
        &self,
        pki: &PkiPath,
        role: &str,
        common_name: &str,
        validity: Option<Duration>,
    ) -> Result<IssuedCertificate, SignerError> {
        self.pki(pki.as_str())
            .issue(role, common_name, validity)
            .await
            .map_err(SignerError::new)
    }

    async fn revoke(&self, pki: &PkiPath, serial: &str) -> Result<(), SignerError> {
        self.pki(pki.as_str())
            .revoke(serial)
            .await
            .map_err(SignerError::new)
    }

    async fn fetch_crl(&self, pki: &PkiPath) -> Result<Crl, SignerError> {
        self.pki(pki.as_str())
            .fetch_crl()
            .await
            .map_err(SignerError::new)
    }

    async fn rotate_crl(&self, pki: &PkiPath) -> Result<(), SignerError> {
        self.pki(pki.as_str())
            .rotate_crl()
            .await
            .map_err(SignerError::new)
    }
}
