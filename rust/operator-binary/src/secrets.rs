//! Keys and contents of the secrets that the operator maintains.

use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use openssl::{dh::Dh, error::ErrorStack};
use snafu::{ResultExt, Snafu};
use stackable_operator::k8s_openapi::api::core::v1::Secret;
use stackable_vault_pki::IssuedCertificate;

use crate::{
    certificate::{self, record_annotations, Holder},
    crd::OvpnServer,
    effective::ServerConfig,
    resources::{owned_meta, secret_data, secret_entry, OwnerReferenceError},
    utils::{FmtByteSlice, Unloggable},
};

pub const DH_PARAMS_KEY: &str = "dh-params";
pub const TLS_AUTH_KEY: &str = "tls-auth";
pub const SERVER_CERT_KEY: &str = "server-cert";
pub const SERVER_KEY_KEY: &str = "server-key";
pub const CA_CERT_KEY: &str = "ca-cert";
pub const PROFILE_KEY: &str = "ovpn-profile-text";
pub const CRL_KEY: &str = "crl-pem";

const DH_GENERATOR: u32 = 2;
const STATIC_KEY_BYTES: usize = 256;
const STATIC_KEY_BYTES_PER_LINE: usize = 16;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate {bits} bit DH parameters"))]
    GenerateDhParams { source: ErrorStack, bits: u32 },

    #[snafu(display("DH parameter generation was aborted"))]
    DhWorker { source: tokio::task::JoinError },

    #[snafu(display("generated DH parameters are not valid UTF-8"))]
    DhNotUtf8 { source: std::string::FromUtf8Error },

    #[snafu(display("failed to generate TLS auth key"))]
    GenerateTlsAuth { source: ErrorStack },

    #[snafu(display("failed to build secret metadata"))]
    Metadata { source: OwnerReferenceError },

    #[snafu(display("failed to record issued certificate"))]
    RecordCertificate {
        source: certificate::FormatExpirationError,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether the shared secret has everything the server needs.
///
/// Shared secrets are never rotated, only regenerated when something is missing.
pub fn shared_secret_is_complete(secret: &Secret) -> bool {
    secret_entry(secret, DH_PARAMS_KEY).is_some() && secret_entry(secret, TLS_AUTH_KEY).is_some()
}

/// Generates DH parameters on a blocking thread, which can take minutes for large sizes.
pub async fn generate_dh_params(bits: u32) -> Result<String> {
    let pem = tokio::task::spawn_blocking(move || {
        Dh::generate_params(bits, DH_GENERATOR).and_then(|dh| dh.params_to_pem())
    })
    .await
    .context(DhWorkerSnafu)?
    .context(GenerateDhParamsSnafu { bits })?;
    String::from_utf8(pem).context(DhNotUtf8Snafu)
}

type DhParamsJob = Shared<BoxFuture<'static, Result<String, Arc<Error>>>>;

/// DH parameter generations in flight, at most one per server.
///
/// A generation outlives the reconcile that started it. A reconcile that runs out of time picks
/// up the same generation on its next attempt instead of starting over.
#[derive(Default)]
pub struct DhParamsGenerator {
    jobs: Mutex<HashMap<String, (u32, DhParamsJob)>>,
    started: AtomicUsize,
}

impl DhParamsGenerator {
    /// Waits for the DH parameters of the server `namespace/name`, starting a generation unless
    /// one with the same size is already running.
    pub async fn generate(
        &self,
        namespace: &str,
        name: &str,
        bits: u32,
    ) -> Result<String, Arc<Error>> {
        let key = format!("{namespace}/{name}");
        let job = {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            match jobs.get(&key) {
                Some((running_bits, job)) if *running_bits == bits => job.clone(),
                _ => {
                    self.started.fetch_add(1, Ordering::Relaxed);
                    let handle = tokio::spawn(generate_dh_params(bits));
                    let job = async move {
                        handle
                            .await
                            .context(DhWorkerSnafu)
                            .and_then(|generated| generated)
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    jobs.insert(key.clone(), (bits, job.clone()));
                    job
                }
            }
        };
        let generated = job.await;
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs
            .get(&key)
            .is_some_and(|(running_bits, _)| *running_bits == bits)
        {
            jobs.remove(&key);
        }
        generated
    }

    /// Drops the generation of a deleted server, its result is discarded once it finishes.
    pub fn forget(&self, namespace: &str, name: &str) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&format!("{namespace}/{name}"));
    }

    #[cfg(test)]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::Relaxed)
    }
}

/// Generates a key in the format of `openvpn --genkey secret`.
pub fn generate_tls_auth() -> Result<Unloggable<String>> {
    let mut key = [0; STATIC_KEY_BYTES];
    openssl::rand::rand_bytes(&mut key).context(GenerateTlsAuthSnafu)?;
    let mut out = String::from(
        "#\n# 2048 bit OpenVPN static key\n#\n-----BEGIN OpenVPN Static key V1-----\n",
    );
    for line in key.chunks(STATIC_KEY_BYTES_PER_LINE) {
        // Writing into a String cannot fail
        let _ = writeln!(out, "{:x}", FmtByteSlice(line));
    }
    out.push_str("-----END OpenVPN Static key V1-----\n");
    Ok(Unloggable(out))
}

/// Whether the server certificate secret holds key material.
///
/// Incomplete secrets are treated as if there were no certificate at all.
pub fn server_certificate_is_complete(secret: &Secret) -> bool {
    [SERVER_CERT_KEY, SERVER_KEY_KEY, CA_CERT_KEY]
        .into_iter()
        .all(|key| secret_entry(secret, key).is_some())
}

pub fn shared_secret(
    server: &OvpnServer,
    config: &ServerConfig,
    dh_params: &str,
    tls_auth: &str,
) -> Result<Secret> {
    Ok(Secret {
        metadata: owned_meta(server, &config.names.shared_secret, Default::default())
            .context(MetadataSnafu)?,
        data: Some(secret_data([
            (DH_PARAMS_KEY, dh_params),
            (TLS_AUTH_KEY, tls_auth),
        ])),
        ..Secret::default()
    })
}

pub fn server_certificate(
    server: &OvpnServer,
    config: &ServerConfig,
    issued: &IssuedCertificate,
) -> Result<Secret> {
    let annotations = record_annotations(issued, Holder::Server).context(RecordCertificateSnafu)?;
    Ok(Secret {
        metadata: owned_meta(server, &config.names.server_certificate, annotations)
            .context(MetadataSnafu)?,
        data: Some(secret_data([
            (SERVER_CERT_KEY, issued.certificate.as_str()),
            (SERVER_KEY_KEY, issued.private_key.as_str()),
            (CA_CERT_KEY, issued.ca_certificate.as_str()),
        ])),
        ..Secret::default()
    })
}
