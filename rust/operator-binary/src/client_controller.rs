//! Issues a profile for every [`OvpnClient`], and revokes its certificate once the client is
//! deleted.
//!
//! Clients never talk to the server controller directly. A revocation is announced by marking
//! the server's CRL secret as dirty, see [`crate::crl`].

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
        ResourceExt,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
    namespace::WatchNamespace,
};
use stackable_vault_pki::IssuedCertificate;
use strum::{EnumDiscriminants, IntoStaticStr};
use time::OffsetDateTime;

use crate::{
    barrier::{self, Step},
    certificate::{
        self, decide, record_annotations, CertificateRecord, Decision, Holder, Policy,
        REVOKED_ANNOTATION,
    },
    context::Ctx,
    crd::{OvpnClient, OvpnServer},
    crl,
    effective::{
        ClientConfig, ResolveError, ServerConfig, ServerObjectNames, CLIENT_ROLE,
        DEFAULT_CLIENT_VALIDITY,
    },
    pki::{PkiPath, Signer, SignerError},
    resources::{
        owned_meta,
        render::{self, ProfileSecrets},
        secret_data, secret_entry, OwnerReferenceError,
    },
    secrets::{PROFILE_KEY, TLS_AUTH_KEY},
    store::{self, KubeStore, Store},
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "ovpnclient";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

pub async fn start(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    ctx: Arc<Ctx<KubeStore, stackable_vault_pki::Client>>,
) {
    Controller::new(
        watch_namespace.get_api::<OvpnClient>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<Secret>(client),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(
        reconcile::<KubeStore, stackable_vault_pki::Client>,
        error_policy,
        ctx,
    )
    .map(|res| report_controller_reconciled(client, FULL_CONTROLLER_NAME, &res))
    .collect::<()>()
    .await;
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("reconcile did not finish within {timeout:?}"))]
    Timeout {
        source: tokio::time::error::Elapsed,
        timeout: Duration,
    },

    #[snafu(display("OvpnClient has no namespace"))]
    NoNamespace,

    #[snafu(display("failed to pass the deletion barrier"))]
    Barrier { source: barrier::Error },

    #[snafu(display("OvpnClient is invalid"))]
    InvalidClient { source: ResolveError },

    #[snafu(display("failed to get {server}"))]
    GetServer {
        source: store::Error,
        server: ObjectRef<OvpnServer>,
    },

    #[snafu(display("{server} does not exist"))]
    ServerNotFound { server: ObjectRef<OvpnServer> },

    #[snafu(display("{server} is invalid"))]
    InvalidServer {
        source: ResolveError,
        server: ObjectRef<OvpnServer>,
    },

    #[snafu(display("{server} is not provisioned yet, {secret} has no TLS auth key"))]
    ServerNotProvisioned {
        server: ObjectRef<OvpnServer>,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to get {secret}"))]
    GetSecret {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to issue client certificate from PKI {pki}"))]
    IssueCertificate { source: SignerError, pki: PkiPath },

    #[snafu(display("failed to render client profile"))]
    Render { source: render::RenderError },

    #[snafu(display("failed to record issued certificate"))]
    RecordCertificate {
        source: certificate::FormatExpirationError,
    },

    #[snafu(display("failed to build client profile secret"))]
    BuildSecret { source: OwnerReferenceError },

    #[snafu(display("failed to create {secret}"))]
    CreateSecret {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to revoke certificate {serial} in PKI {pki}"))]
    Revoke {
        source: SignerError,
        pki: PkiPath,
        serial: String,
    },

    #[snafu(display("failed to record revocation in {secret}"))]
    RecordRevocation {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to announce revocation to {server}"))]
    MarkCrlDirty {
        source: crl::Error,
        server: ObjectRef<OvpnServer>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<stackable_operator::kube::api::DynamicObject>> {
        match self {
            Error::GetServer { server, .. }
            | Error::ServerNotFound { server }
            | Error::InvalidServer { server, .. }
            | Error::ServerNotProvisioned { server, .. }
            | Error::MarkCrlDirty { server, .. } => Some(server.clone().erase()),
            Error::GetSecret { secret, .. }
            | Error::CreateSecret { secret, .. }
            | Error::RecordRevocation { secret, .. } => Some(secret.clone().erase()),
            Error::Timeout { .. }
            | Error::NoNamespace
            | Error::Barrier { .. }
            | Error::InvalidClient { .. }
            | Error::IssueCertificate { .. }
            | Error::Render { .. }
            | Error::RecordCertificate { .. }
            | Error::BuildSecret { .. }
            | Error::Revoke { .. } => None,
        }
    }
}

async fn reconcile<S: Store + 'static, G: Signer + 'static>(
    client: Arc<OvpnClient>,
    ctx: Arc<Ctx<S, G>>,
) -> Result<Action> {
    tokio::time::timeout(
        ctx.timeout,
        reconcile_client(&client, &ctx, OffsetDateTime::now_utc()),
    )
    .await
    .context(TimeoutSnafu {
        timeout: ctx.timeout,
    })?
}

fn error_policy<S, G>(_obj: Arc<OvpnClient>, _error: &Error, _ctx: Arc<Ctx<S, G>>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

pub async fn reconcile_client<S: Store, G: Signer>(
    client: &OvpnClient,
    ctx: &Ctx<S, G>,
    now: OffsetDateTime,
) -> Result<Action> {
    match barrier::enter(&ctx.store, client)
        .await
        .context(BarrierSnafu)?
    {
        Step::Converge(client) => ensure_profile(&client, ctx, now).await?,
        Step::Cleanup(client) => {
            revoke(&client, ctx, now).await?;
            barrier::release(&ctx.store, &client)
                .await
                .context(BarrierSnafu)?;
        }
        Step::Done => {}
    }
    Ok(Action::await_change())
}

async fn get_server<S: Store, G: Signer>(
    ctx: &Ctx<S, G>,
    namespace: &str,
    name: &str,
) -> Result<Option<OvpnServer>> {
    ctx.store
        .get::<OvpnServer>(namespace, name)
        .await
        .with_context(|_| GetServerSnafu {
            server: ObjectRef::<OvpnServer>::new(name).within(namespace),
        })
}

/// Issues the client's certificate and profile, unless it already has one.
async fn ensure_profile<S: Store, G: Signer>(
    client: &OvpnClient,
    ctx: &Ctx<S, G>,
    now: OffsetDateTime,
) -> Result<()> {
    let config = ClientConfig::resolve(client).context(InvalidClientSnafu)?;
    let secret_ref = ObjectRef::<Secret>::new(&config.secret_name).within(&config.namespace);
    let server_ref = ObjectRef::<OvpnServer>::new(&config.server_name).within(&config.namespace);

    let record = ctx
        .store
        .get::<Secret>(&config.namespace, &config.secret_name)
        .await
        .with_context(|_| GetSecretSnafu { secret: secret_ref })?
        .map(|secret| CertificateRecord::from_secret(&secret));
    let policy = Policy {
        holder: Holder::Client,
        validity: config.validity.unwrap_or(DEFAULT_CLIENT_VALIDITY),
    };
    if decide(record.as_ref(), &policy, now) == Decision::Keep {
        return Ok(());
    }

    let server = get_server(ctx, &config.namespace, &config.server_name)
        .await?
        .with_context(|| ServerNotFoundSnafu {
            server: server_ref.clone(),
        })?;
    let server_config = ServerConfig::resolve(&server).with_context(|_| InvalidServerSnafu {
        server: server_ref.clone(),
    })?;

    let shared_secret_ref =
        ObjectRef::<Secret>::new(&server_config.names.shared_secret).within(&config.namespace);
    let shared_secret = ctx
        .store
        .get::<Secret>(&config.namespace, &server_config.names.shared_secret)
        .await
        .with_context(|_| GetSecretSnafu {
            secret: shared_secret_ref.clone(),
        })?;
    let tls_auth = shared_secret
        .as_ref()
        .and_then(|secret| secret_entry(secret, TLS_AUTH_KEY))
        .with_context(|| ServerNotProvisionedSnafu {
            server: server_ref.clone(),
            secret: shared_secret_ref,
        })?;

    let pki = ctx.pki_path(&config.namespace, &config.server_name);
    let issued = ctx
        .signer
        .issue(&pki, CLIENT_ROLE, &config.common_name, config.validity)
        .await
        .context(IssueCertificateSnafu { pki: &pki })?;
    if let Err(err) =
        store_profile(&ctx.store, client, &config, &server_config, tls_auth, &issued).await
    {
        tracing::warn!(
            client = %ObjectRef::from_obj(client),
            %pki,
            serial = %issued.serial,
            error = &err as &dyn std::error::Error,
            "issued certificate was not recorded, revoke it manually"
        );
        return Err(err);
    }
    tracing::info!(
        client = %ObjectRef::from_obj(client),
        serial = %issued.serial,
        expires_at = %issued.expires_at,
        "issued client certificate"
    );
    Ok(())
}

/// Renders the profile of a freshly issued certificate and stores it as the client's record.
async fn store_profile<S: Store>(
    store: &S,
    client: &OvpnClient,
    config: &ClientConfig,
    server_config: &ServerConfig,
    tls_auth: &str,
    issued: &IssuedCertificate,
) -> Result<()> {
    let profile = render::client_profile(
        server_config,
        &ProfileSecrets {
            key: &issued.private_key,
            certificate: &issued.certificate,
            ca_certificate: &issued.ca_certificate,
            tls_auth,
        },
    )
    .context(RenderSnafu)?;
    let secret = Secret {
        metadata: owned_meta(
            client,
            &config.secret_name,
            record_annotations(issued, Holder::Client).context(RecordCertificateSnafu)?,
        )
        .context(BuildSecretSnafu)?,
        data: Some(secret_data([(PROFILE_KEY, profile.as_str())])),
        ..Secret::default()
    };
    // Never overwrite a record that appeared in the meantime
    store
        .create(&secret)
        .await
        .with_context(|_| CreateSecretSnafu {
            secret: ObjectRef::<Secret>::new(&config.secret_name).within(&config.namespace),
        })?;
    Ok(())
}

/// Revokes the client's certificate, if it still needs to be.
///
/// Every step can be repeated. The revocation itself is recorded on the certificate's secret
/// before the server is told about it, so that a failure to notify the server does not revoke
/// again.
async fn revoke<S: Store, G: Signer>(
    client: &OvpnClient,
    ctx: &Ctx<S, G>,
    now: OffsetDateTime,
) -> Result<()> {
    let namespace = client.namespace().context(NoNamespaceSnafu)?;
    let secret_name = ClientConfig::secret_name(client);
    let secret_ref = ObjectRef::<Secret>::new(&secret_name).within(&namespace);
    let client_ref = ObjectRef::from_obj(client);

    let Some(secret) = ctx
        .store
        .get::<Secret>(&namespace, &secret_name)
        .await
        .with_context(|_| GetSecretSnafu {
            secret: secret_ref.clone(),
        })?
    else {
        tracing::info!(client = %client_ref, "client has no certificate, nothing to revoke");
        return Ok(());
    };
    let record = CertificateRecord::from_secret(&secret);
    match record.expires_at() {
        Some(expires_at) if expires_at > now => {}
        Some(_) => {
            tracing::info!(
                client = %client_ref,
                "certificate has already expired, not revoking it"
            );
            return Ok(());
        }
        None => {
            tracing::warn!(
                client = %client_ref,
                expires_at = record.expires_at.as_deref(),
                "unable to determine expiration of certificate, not revoking it"
            );
            return Ok(());
        }
    }
    let Some(serial) = record.serial else {
        tracing::warn!(
            client = %client_ref,
            secret = %secret_ref,
            "certificate has no serial and cannot be revoked, leaving it to expire"
        );
        return Ok(());
    };

    let server_name = &client.spec.server_name;
    let server = get_server(ctx, &namespace, server_name).await?;
    let Some(server) = server.filter(|server| server.metadata.deletion_timestamp.is_none()) else {
        tracing::info!(
            client = %client_ref,
            server = %server_name,
            "server is being deleted together with its PKI, not revoking"
        );
        return Ok(());
    };

    if !record.revoked {
        let pki = ctx.pki_path(&namespace, server_name);
        ctx.signer
            .revoke(&pki, &serial)
            .await
            .with_context(|_| RevokeSnafu {
                pki: pki.clone(),
                serial: serial.clone(),
            })?;
        ctx.store
            .annotate::<Secret>(&namespace, &secret_name, REVOKED_ANNOTATION, "true")
            .await
            .context(RecordRevocationSnafu {
                secret: secret_ref.clone(),
            })?;
        tracing::info!(client = %client_ref, %pki, %serial, "revoked client certificate");
    }

    crl::mark_dirty(
        &ctx.store,
        &server,
        &ServerObjectNames::new(&server).crl,
        now,
    )
    .await
    .with_context(|_| MarkCrlDirtySnafu {
        server: ObjectRef::from_obj(&server),
    })
}
