//! Keeps the server's CRL secret fresh, and lets clients poke it after a revocation.
//!
//! The dirty marker carries no meaning besides "something changed". Writing it modifies a secret
//! that is owned by the server, which makes the server controller reconcile, and every server
//! reconcile refreshes the CRL regardless of the marker's value.

use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{k8s_openapi::api::core::v1::Secret, kube::ResourceExt};
use stackable_vault_pki::Crl;
use time::OffsetDateTime;

use crate::{
    crd::OvpnServer,
    effective::ServerConfig,
    pki::{PkiPath, Signer, SignerError},
    resources::{owned_meta, secret_data, OwnerReferenceError},
    secrets::CRL_KEY,
    store::{self, Store},
};

pub const DIRTY_ANNOTATION: &str = "vpn.stackable.tech/dirty-marker";

/// CRLs are rotated once their next update is closer than this.
pub const ROTATION_THRESHOLD: time::Duration = time::Duration::hours(24);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to fetch CRL of {pki}"))]
    Fetch { source: SignerError, pki: PkiPath },

    #[snafu(display("failed to rotate CRL of {pki}"))]
    Rotate { source: SignerError, pki: PkiPath },

    #[snafu(display("OvpnServer has no namespace"))]
    NoNamespace,

    #[snafu(display("failed to build CRL secret"))]
    Metadata { source: OwnerReferenceError },

    #[snafu(display("failed to mark CRL secret {secret:?} as dirty"))]
    MarkDirty { source: store::Error, secret: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Fetches the current CRL, rotating it first if it is about to go stale.
pub async fn refresh<G: Signer>(signer: &G, pki: &PkiPath, now: OffsetDateTime) -> Result<Crl> {
    let crl = signer.fetch_crl(pki).await.context(FetchSnafu { pki })?;
    let remaining = crl.next_update - now;
    if remaining >= ROTATION_THRESHOLD {
        return Ok(crl);
    }
    tracing::info!(%pki, next_update = %crl.next_update, "rotating CRL");
    signer.rotate_crl(pki).await.context(RotateSnafu { pki })?;
    signer.fetch_crl(pki).await.context(FetchSnafu { pki })
}

/// The CRL secret with a reset dirty marker.
pub fn secret(server: &OvpnServer, config: &ServerConfig, crl: &Crl) -> Result<Secret> {
    Ok(Secret {
        metadata: owned_meta(
            server,
            &config.names.crl,
            BTreeMap::from([(DIRTY_ANNOTATION.to_string(), String::new())]),
        )
        .context(MetadataSnafu)?,
        data: Some(secret_data([(CRL_KEY, crl.pem.as_str())])),
        ..Secret::default()
    })
}

/// Sets the dirty marker on the server's CRL secret, creating the secret if necessary.
///
/// The marker value changes on every call so that every call is observable as a modification.
pub async fn mark_dirty<S: Store>(
    store: &S,
    server: &OvpnServer,
    name: &str,
    now: OffsetDateTime,
) -> Result<()> {
    let namespace = server.namespace().context(NoNamespaceSnafu)?;
    let marker = now.unix_timestamp_nanos().to_string();
    match store
        .annotate::<Secret>(&namespace, name, DIRTY_ANNOTATION, &marker)
        .await
    {
        Ok(_) => {}
        Err(store::Error::NotFound { .. }) => {
            let secret = Secret {
                metadata: owned_meta(
                    server,
                    name,
                    BTreeMap::from([(DIRTY_ANNOTATION.to_string(), marker)]),
                )
                .context(MetadataSnafu)?,
                ..Secret::default()
            };
            store
                .create(&secret)
                .await
                .context(MarkDirtySnafu { secret: name })?;
        }
        Err(err) => return Err(err).context(MarkDirtySnafu { secret: name }),
    }
    tracing::debug!(server = %server.name_any(), secret = %name, "marked CRL as dirty");
    Ok(())
}
