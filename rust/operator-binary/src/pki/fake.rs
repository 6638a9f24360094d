//! In-memory [`Signer`] with bookkeeping of every call that matters for the reconcilers.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use snafu::Snafu;
use stackable_vault_pki::{Crl, IssuedCertificate, RoleConfig, RootConfig};
use time::OffsetDateTime;

use super::{PkiPath, Signer, SignerError};

#[derive(Debug, Snafu)]
pub enum FakeError {
    #[snafu(display("PKI {pki} is not mounted"))]
    NotMounted { pki: PkiPath },

    #[snafu(display("PKI {pki} has no root CA"))]
    NoRoot { pki: PkiPath },

    #[snafu(display("PKI {pki} has no role {role:?}"))]
    NoRole { pki: PkiPath, role: String },

    #[snafu(display("signer is unavailable"))]
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Issued {
    pub pki: PkiPath,
    pub role: String,
    pub common_name: String,
    pub validity: Option<Duration>,
    pub serial: String,
}

#[derive(Debug)]
pub struct State {
    pub mounted: BTreeSet<PkiPath>,
    pub roots: BTreeMap<PkiPath, RootConfig>,
    pub roles: BTreeMap<(PkiPath, String), RoleConfig>,
    pub issued: Vec<Issued>,
    pub revoke_calls: Vec<(PkiPath, String)>,
    pub revoked: BTreeSet<(PkiPath, String)>,
    /// Next update of every CRL that is fetched before the next rotation.
    pub crl_next_update: OffsetDateTime,
    pub crl_fetches: usize,
    pub crl_rotations: usize,
    pub unavailable: bool,
}

pub struct FakeSigner {
    pub state: Mutex<State>,
}

fn pem(label: &str, body: &str) -> String {
    format!("-----BEGIN {label}-----\n{body}\n-----END {label}-----\n")
}

impl Default for FakeSigner {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                mounted: BTreeSet::new(),
                roots: BTreeMap::new(),
                roles: BTreeMap::new(),
                issued: Vec::new(),
                revoke_calls: Vec::new(),
                revoked: BTreeSet::new(),
                crl_next_update: OffsetDateTime::now_utc() + time::Duration::hours(72),
                crl_fetches: 0,
                crl_rotations: 0,
                unavailable: false,
            }),
        }
    }
}

impl FakeSigner {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn check(&self, pki: &PkiPath) -> Result<std::sync::MutexGuard<'_, State>, SignerError> {
        let state = self.lock();
        if state.unavailable {
            return Err(SignerError::new(FakeError::Unavailable));
        }
        if !state.mounted.contains(pki) {
            return Err(SignerError::new(FakeError::NotMounted { pki: pki.clone() }));
        }
        Ok(state)
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn ensure_enabled(&self, pki: &PkiPath) -> Result<(), SignerError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(SignerError::new(FakeError::Unavailable));
        }
        state.mounted.insert(pki.clone());
        Ok(())
    }

    async fn disable_if_enabled(&self, pki: &PkiPath) -> Result<(), SignerError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(SignerError::new(FakeError::Unavailable));
        }
        state.mounted.remove(pki);
        state.roots.remove(pki);
        state.roles.retain(|(path, _), _| path != pki);
        Ok(())
    }

    async fn generate_root_if_absent(
        &self,
        pki: &PkiPath,
        config: &RootConfig,
    ) -> Result<(), SignerError> {
        let mut state = self.check(pki)?;
        state
            .roots
            .entry(pki.clone())
            .or_insert_with(|| config.clone());
        Ok(())
    }

    async fn configure_role(
        &self,
        pki: &PkiPath,
        name: &str,
        config: &RoleConfig,
    ) -> Result<(), SignerError> {
        let mut state = self.check(pki)?;
        state
            .roles
            .insert((pki.clone(), name.to_string()), config.clone());
        Ok(())
    }

    async fn issue(
        &self,
        pki: &PkiPath,
        role: &str,
        common_name: &str,
        validity: Option<Duration>,
    ) -> Result<IssuedCertificate, SignerError> {
        let mut state = self.check(pki)?;
        if !state.roots.contains_key(pki) {
            return Err(SignerError::new(FakeError::NoRoot { pki: pki.clone() }));
        }
        let role_config = state
            .roles
            .get(&(pki.clone(), role.to_string()))
            .cloned()
            .ok_or_else(|| {
                SignerError::new(FakeError::NoRole {
                    pki: pki.clone(),
                    role: role.to_string(),
                })
            })?;
        let serial = format!("{:02x}:{:02x}", state.issued.len() / 256, state.issued.len() % 256);
        state.issued.push(Issued {
            pki: pki.clone(),
            role: role.to_string(),
            common_name: common_name.to_string(),
            validity,
            serial: serial.clone(),
        });
        let validity = validity.unwrap_or(role_config.default_validity);
        Ok(IssuedCertificate {
            certificate: pem("CERTIFICATE", common_name),
            private_key: pem("PRIVATE KEY", &serial),
            ca_certificate: pem("CERTIFICATE", "ca"),
            expires_at: OffsetDateTime::now_utc()
                + time::Duration::try_from(validity).unwrap_or(time::Duration::MAX),
            serial,
        })
    }

    async fn revoke(&self, pki: &PkiPath, serial: &str) -> Result<(), SignerError> {
        let mut state = self.check(pki)?;
        state.revoke_calls.push((pki.clone(), serial.to_string()));
        state.revoked.insert((pki.clone(), serial.to_string()));
        Ok(())
    }

    async fn fetch_crl(&self, pki: &PkiPath) -> Result<Crl, SignerError> {
        let mut state = self.check(pki)?;
        state.crl_fetches += 1;
        let revoked = state
            .revoked
            .iter()
            .filter(|(path, _)| path == pki)
            .map(|(_, serial)| serial.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Ok(Crl {
            pem: format!("-----BEGIN X509 CRL-----\n{revoked}\n-----END X509 CRL-----\n"),
            next_update: state.crl_next_update,
        })
    }

    async fn rotate_crl(&self, pki: &PkiPath) -> Result<(), SignerError> {
        let mut state = self.check(pki)?;
        state.crl_rotations += 1;
        state.crl_next_update = OffsetDateTime::now_utc() + time::Duration::hours(72);
        Ok(())
    }
}
