//! Decides when certificates are (re)issued, and how issued certificates are recorded.

use std::{collections::BTreeMap, time::Duration};

use snafu::{ResultExt, Snafu};
use stackable_operator::k8s_openapi::api::core::v1::Secret;
use stackable_vault_pki::IssuedCertificate;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub const EXPIRES_AT_ANNOTATION: &str = "vpn.stackable.tech/expires-at";
pub const SERIAL_ANNOTATION: &str = "vpn.stackable.tech/serial";
/// Set once the certificate has been revoked, so that revocation is not repeated.
pub const REVOKED_ANNOTATION: &str = "vpn.stackable.tech/revoked";

/// Server certificates are renewed once less than this fraction of their validity remains.
const RENEWAL_DIVISOR: u32 = 6;

#[derive(Debug, Snafu)]
#[snafu(display("failed to format expiration {expires_at}"))]
pub struct FormatExpirationError {
    source: time::error::Format,
    expires_at: OffsetDateTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Holder {
    Server,
    Client,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    pub holder: Holder,
    /// The validity that newly issued certificates get.
    pub validity: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Issue,
}

/// The persisted facts about an existing certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateRecord {
    pub expires_at: Option<String>,
    pub serial: Option<String>,
    pub revoked: bool,
}

impl CertificateRecord {
    pub fn from_secret(secret: &Secret) -> Self {
        let annotation = |key: &str| {
            secret
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(key))
                .cloned()
        };
        Self {
            expires_at: annotation(EXPIRES_AT_ANNOTATION),
            serial: annotation(SERIAL_ANNOTATION).filter(|serial| !serial.is_empty()),
            revoked: annotation(REVOKED_ANNOTATION).is_some_and(|revoked| revoked == "true"),
        }
    }

    /// `None` if the expiration is missing or unparseable.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::parse(self.expires_at.as_deref()?, &Rfc3339).ok()
    }
}

pub fn decide(
    existing: Option<&CertificateRecord>,
    policy: &Policy,
    now: OffsetDateTime,
) -> Decision {
    let Some(existing) = existing else {
        return Decision::Issue;
    };
    match policy.holder {
        // Clients are only reissued after their record has been deleted
        Holder::Client => Decision::Keep,
        Holder::Server => {
            let Some(expires_at) = existing.expires_at() else {
                tracing::warn!(
                    expires_at = existing.expires_at.as_deref(),
                    "unable to determine expiration of server certificate, keeping it"
                );
                return Decision::Keep;
            };
            let remaining = (expires_at - now).whole_nanoseconds();
            let threshold = (policy.validity / RENEWAL_DIVISOR).as_nanos() as i128;
            if remaining <= threshold {
                Decision::Issue
            } else {
                Decision::Keep
            }
        }
    }
}

/// Annotations that describe a freshly issued certificate.
///
/// Written in the same object as the key material.
pub fn record_annotations(
    issued: &IssuedCertificate,
    holder: Holder,
) -> Result<BTreeMap<String, String>, FormatExpirationError> {
    let expires_at = issued
        .expires_at
        .format(&Rfc3339)
        .context(FormatExpirationSnafu {
            expires_at: issued.expires_at,
        })?;
    let mut annotations = BTreeMap::from([(EXPIRES_AT_ANNOTATION.to_string(), expires_at)]);
    if holder == Holder::Client {
        annotations.insert(SERIAL_ANNOTATION.to_string(), issued.serial.clone());
    }
    Ok(annotations)
}
