//! Converges an [`OvpnServer`] into its PKI instance and the objects that run the VPN server.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, Secret, Service},
    },
    kube::{
        runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
        Resource, ResourceExt,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
    namespace::WatchNamespace,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use time::OffsetDateTime;

use crate::{
    barrier::{self, Step},
    certificate::{decide, CertificateRecord, Decision, Holder, Policy},
    context::Ctx,
    crd::OvpnServer,
    crl,
    drift::{self, Plan},
    effective::{ResolveError, ServerConfig, CLIENT_ROLE, SERVER_ROLE},
    pki::{PkiPath, Signer, SignerError},
    resources::{
        config_map, deployment, render, service, OwnerReferenceError, ENTRYPOINT_KEY,
        OVPN_CONFIG_KEY,
    },
    secrets,
    store::{self, KubeStore, Store},
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "ovpnserver";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

pub async fn start(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    ctx: Arc<Ctx<KubeStore, stackable_vault_pki::Client>>,
) {
    Controller::new(
        watch_namespace.get_api::<OvpnServer>(client),
        watcher::Config::default(),
    )
    // Also carries the dirty marker of the CRL secret
    .owns(
        watch_namespace.get_api::<Secret>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<ConfigMap>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<Deployment>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<Service>(client),
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

    #[snafu(display("OvpnServer has no namespace"))]
    NoNamespace,

    #[snafu(display("failed to pass the deletion barrier"))]
    Barrier { source: barrier::Error },

    #[snafu(display("OvpnServer is invalid"))]
    InvalidServer { source: ResolveError },

    #[snafu(display("failed to get {secret}"))]
    GetSecret {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to apply {secret}"))]
    ApplySecret {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to generate DH parameters"))]
    GenerateDhParams { source: Arc<secrets::Error> },

    #[snafu(display("failed to build shared secret"))]
    BuildSharedSecret { source: secrets::Error },

    #[snafu(display("failed to build server certificate secret"))]
    BuildServerCertificate { source: secrets::Error },

    #[snafu(display("failed to enable PKI {pki}"))]
    EnablePki { source: SignerError, pki: PkiPath },

    #[snafu(display("failed to disable PKI {pki}"))]
    DisablePki { source: SignerError, pki: PkiPath },

    #[snafu(display("failed to generate root CA of PKI {pki}"))]
    GenerateRoot { source: SignerError, pki: PkiPath },

    #[snafu(display("failed to configure role {role:?} of PKI {pki}"))]
    ConfigureRole {
        source: SignerError,
        pki: PkiPath,
        role: &'static str,
    },

    #[snafu(display("failed to issue server certificate from PKI {pki}"))]
    IssueServerCertificate { source: SignerError, pki: PkiPath },

    #[snafu(display("failed to refresh CRL"))]
    RefreshCrl { source: crl::Error },

    #[snafu(display("failed to render configuration"))]
    Render { source: render::RenderError },

    #[snafu(display("failed to build derived object"))]
    BuildObject { source: OwnerReferenceError },

    #[snafu(display("failed to apply {config_map}"))]
    ApplyConfigMap {
        source: store::Error,
        config_map: ObjectRef<ConfigMap>,
    },

    #[snafu(display("failed to apply {deployment}"))]
    ApplyDeployment {
        source: store::Error,
        deployment: ObjectRef<Deployment>,
    },

    #[snafu(display("failed to get {service}"))]
    GetService {
        source: store::Error,
        service: ObjectRef<Service>,
    },

    #[snafu(display("failed to write {service}"))]
    WriteService {
        source: store::Error,
        service: ObjectRef<Service>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<stackable_operator::kube::api::DynamicObject>> {
        match self {
            Error::GetSecret { secret, .. } | Error::ApplySecret { secret, .. } => {
                Some(secret.clone().erase())
            }
            Error::ApplyConfigMap { config_map, .. } => Some(config_map.clone().erase()),
            Error::ApplyDeployment { deployment, .. } => Some(deployment.clone().erase()),
            Error::GetService { service, .. } | Error::WriteService { service, .. } => {
                Some(service.clone().erase())
            }
            Error::Timeout { .. }
            | Error::NoNamespace
            | Error::Barrier { .. }
            | Error::InvalidServer { .. }
            | Error::GenerateDhParams { .. }
            | Error::BuildSharedSecret { .. }
            | Error::BuildServerCertificate { .. }
            | Error::EnablePki { .. }
            | Error::DisablePki { .. }
            | Error::GenerateRoot { .. }
            | Error::ConfigureRole { .. }
            | Error::IssueServerCertificate { .. }
            | Error::RefreshCrl { .. }
            | Error::Render { .. }
            | Error::BuildObject { .. } => None,
        }
    }
}

fn object_ref<K: Resource<DynamicType = ()>>(config: &ServerConfig, name: &str) -> ObjectRef<K> {
    ObjectRef::new(name).within(&config.namespace)
}

async fn reconcile<S: Store + 'static, G: Signer + 'static>(
    server: Arc<OvpnServer>,
    ctx: Arc<Ctx<S, G>>,
) -> Result<Action> {
    tokio::time::timeout(
        ctx.timeout,
        reconcile_server(&server, &ctx, OffsetDateTime::now_utc()),
    )
    .await
    .context(TimeoutSnafu {
        timeout: ctx.timeout,
    })?
}

fn error_policy<S, G>(_obj: Arc<OvpnServer>, _error: &Error, _ctx: Arc<Ctx<S, G>>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

pub async fn reconcile_server<S: Store, G: Signer>(
    server: &OvpnServer,
    ctx: &Ctx<S, G>,
    now: OffsetDateTime,
) -> Result<Action> {
    let server = match barrier::enter(&ctx.store, server)
        .await
        .context(BarrierSnafu)?
    {
        Step::Converge(server) => server,
        Step::Cleanup(server) => {
            tear_down(&server, ctx).await?;
            return Ok(Action::await_change());
        }
        Step::Done => return Ok(Action::await_change()),
    };
    let config = ServerConfig::resolve(&server).context(InvalidServerSnafu)?;
    let pki = ctx.pki_path(&config.namespace, &config.name);

    ensure_shared_secret(&server, &config, ctx).await?;
    provision_pki(&config, &pki, ctx).await?;

    let crl = crl::refresh(&ctx.signer, &pki, now)
        .await
        .context(RefreshCrlSnafu)?;
    let crl_secret = crl::secret(&server, &config, &crl).context(RefreshCrlSnafu)?;
    ctx.store
        .apply(&crl_secret)
        .await
        .with_context(|_| ApplySecretSnafu {
            secret: object_ref::<Secret>(&config, &config.names.crl),
        })?;

    let expires_at = ensure_server_certificate(&server, &config, &pki, ctx, now).await?;

    for (name, key, content) in [
        (
            &config.names.ovpn_config_map,
            OVPN_CONFIG_KEY,
            render::server_config(&config).context(RenderSnafu)?,
        ),
        (
            &config.names.entrypoint_config_map,
            ENTRYPOINT_KEY,
            render::entrypoint(&config).context(RenderSnafu)?,
        ),
    ] {
        let cm = config_map(&server, name, key, content).context(BuildObjectSnafu)?;
        ctx.store
            .apply(&cm)
            .await
            .with_context(|_| ApplyConfigMapSnafu {
                config_map: object_ref::<ConfigMap>(&config, name),
            })?;
    }

    let deployment = deployment::build(&server, &config, &ctx.image, &expires_at)
        .context(BuildObjectSnafu)?;
    ctx.store
        .apply(&deployment)
        .await
        .with_context(|_| ApplyDeploymentSnafu {
            deployment: object_ref::<Deployment>(&config, &config.names.deployment),
        })?;

    converge_service(&server, &config, ctx).await?;

    Ok(Action::requeue(ctx.resync))
}

/// Disables the server's PKI instance, the derived objects are garbage collected afterwards.
async fn tear_down<S: Store, G: Signer>(server: &OvpnServer, ctx: &Ctx<S, G>) -> Result<()> {
    let namespace = server.namespace().context(NoNamespaceSnafu)?;
    let pki = ctx.pki_path(&namespace, &server.name_any());
    ctx.dh_params.forget(&namespace, &server.name_any());
    ctx.signer
        .disable_if_enabled(&pki)
        .await
        .with_context(|_| DisablePkiSnafu { pki: pki.clone() })?;
    tracing::info!(server = %ObjectRef::from_obj(server), %pki, "disabled PKI");
    barrier::release(&ctx.store, server)
        .await
        .context(BarrierSnafu)
}

async fn ensure_shared_secret<S: Store, G: Signer>(
    server: &OvpnServer,
    config: &ServerConfig,
    ctx: &Ctx<S, G>,
) -> Result<()> {
    let name = &config.names.shared_secret;
    let current = ctx
        .store
        .get::<Secret>(&config.namespace, name)
        .await
        .with_context(|_| GetSecretSnafu {
            secret: object_ref::<Secret>(config, name),
        })?;
    if current
        .as_ref()
        .is_some_and(secrets::shared_secret_is_complete)
    {
        return Ok(());
    }

    tracing::info!(
        server = %ObjectRef::from_obj(server),
        bits = config.dh_bits,
        "generating shared secret, this may take a while"
    );
    let dh_params = ctx
        .dh_params
        .generate(&config.namespace, &config.name, config.dh_bits)
        .await
        .context(GenerateDhParamsSnafu)?;
    let tls_auth = secrets::generate_tls_auth().context(BuildSharedSecretSnafu)?;
    let secret = secrets::shared_secret(server, config, &dh_params, &tls_auth)
        .context(BuildSharedSecretSnafu)?;
    ctx.store
        .apply(&secret)
        .await
        .with_context(|_| ApplySecretSnafu {
            secret: object_ref::<Secret>(config, name),
        })?;
    Ok(())
}

async fn provision_pki<S: Store, G: Signer>(
    config: &ServerConfig,
    pki: &PkiPath,
    ctx: &Ctx<S, G>,
) -> Result<()> {
    ctx.signer
        .ensure_enabled(pki)
        .await
        .context(EnablePkiSnafu { pki })?;
    ctx.signer
        .generate_root_if_absent(pki, &config.root)
        .await
        .context(GenerateRootSnafu { pki })?;
    for (role, role_config) in [
        (SERVER_ROLE, &config.server_role),
        (CLIENT_ROLE, &config.client_role),
    ] {
        ctx.signer
            .configure_role(pki, role, role_config)
            .await
            .context(ConfigureRoleSnafu { pki, role })?;
    }
    Ok(())
}

/// Issues or renews the server certificate, returning the current expiration.
async fn ensure_server_certificate<S: Store, G: Signer>(
    server: &OvpnServer,
    config: &ServerConfig,
    pki: &PkiPath,
    ctx: &Ctx<S, G>,
    now: OffsetDateTime,
) -> Result<String> {
    let name = &config.names.server_certificate;
    let record = ctx
        .store
        .get::<Secret>(&config.namespace, name)
        .await
        .with_context(|_| GetSecretSnafu {
            secret: object_ref::<Secret>(config, name),
        })?
        .filter(secrets::server_certificate_is_complete)
        .map(|secret| CertificateRecord::from_secret(&secret));
    let policy = Policy {
        holder: Holder::Server,
        validity: config.server_role.default_validity,
    };
    if decide(record.as_ref(), &policy, now) == Decision::Keep {
        return Ok(record
            .and_then(|record| record.expires_at)
            .unwrap_or_default());
    }

    let issued = ctx
        .signer
        .issue(pki, SERVER_ROLE, &config.host, None)
        .await
        .context(IssueServerCertificateSnafu { pki })?;
    tracing::info!(
        server = %ObjectRef::from_obj(server),
        serial = %issued.serial,
        expires_at = %issued.expires_at,
        "issued server certificate"
    );
    let secret =
        secrets::server_certificate(server, config, &issued).context(BuildServerCertificateSnafu)?;
    let secret = ctx
        .store
        .apply(&secret)
        .await
        .with_context(|_| ApplySecretSnafu {
            secret: object_ref::<Secret>(config, name),
        })?;
    Ok(CertificateRecord::from_secret(&secret)
        .expires_at
        .unwrap_or_default())
}

async fn converge_service<S: Store, G: Signer>(
    server: &OvpnServer,
    config: &ServerConfig,
    ctx: &Ctx<S, G>,
) -> Result<()> {
    let name = &config.names.service;
    let service_ref = || object_ref::<Service>(config, name);
    let desired = service::build(server, config).context(BuildObjectSnafu)?;
    let current = ctx
        .store
        .get::<Service>(&config.namespace, name)
        .await
        .with_context(|_| GetServiceSnafu {
            service: service_ref(),
        })?;
    match drift::plan(current.as_ref(), desired) {
        Plan::Unchanged => {}
        Plan::Create(service) => {
            ctx.store
                .create(&service)
                .await
                .with_context(|_| WriteServiceSnafu {
                    service: service_ref(),
                })?;
        }
        Plan::Recreate(service) => {
            tracing::info!(service = %service_ref(), "service type changed, recreating service");
            ctx.store
                .delete::<Service>(&config.namespace, name)
                .await
                .with_context(|_| WriteServiceSnafu {
                    service: service_ref(),
                })?;
            ctx.store
                .create(&service)
                .await
                .with_context(|_| WriteServiceSnafu {
                    service: service_ref(),
                })?;
        }
        Plan::Update(service) => {
            ctx.store
                .update(&service)
                .await
                .with_context(|_| WriteServiceSnafu {
                    service: service_ref(),
                })?;
        }
    }
    Ok(())
}
