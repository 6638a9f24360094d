use std::{path::PathBuf, sync::Arc};

use clap::{crate_description, crate_version, Parser};
use stackable_operator::{
    logging::TracingTarget, namespace::WatchNamespace, time::Duration, CustomResourceExt,
};
use stackable_vault_pki::token::{load_token_file, watch_token_file};

use crate::{
    context::Ctx,
    crd::{OvpnClient, OvpnServer},
    store::KubeStore,
};

mod barrier;
mod certificate;
mod client_controller;
mod context;
mod crd;
mod crl;
mod drift;
mod effective;
mod pki;
mod resources;
mod secrets;
mod server_controller;
mod store;
mod utils;

pub const APP_NAME: &str = "vpn";
pub const OPERATOR_NAME: &str = "vpn.stackable.tech";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<VpnOperatorRun>,
}

#[derive(clap::Parser)]
struct VpnOperatorRun {
    /// Image of the OpenVPN server containers
    #[arg(long, env)]
    ovpn_image: String,

    /// Path below which every OvpnServer gets its own Vault PKI secrets engine
    #[arg(long, env, default_value = "pki/vpn")]
    pki_path: String,

    /// Address of Vault, such as https://vault.vault.svc:8200
    #[arg(long, env)]
    vault_addr: String,

    /// File that contains the Vault token, reloaded whenever it changes
    #[arg(long, env)]
    vault_token_file: PathBuf,

    /// CA certificate that Vault's serving certificate is signed by
    #[arg(long, env)]
    vault_ca_cert: Option<PathBuf>,

    /// Only watch objects in this namespace, all namespaces are watched if unset
    #[arg(long, env, default_value = "")]
    watch_namespace: WatchNamespace,

    /// How often converged objects are checked for certificate renewal and CRL rotation
    #[arg(long, env, default_value = "1h")]
    resync_interval: Duration,

    /// Upper bound for a single reconciliation
    #[arg(long, env, default_value = "5m")]
    reconcile_timeout: Duration,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            for crd in [OvpnServer::crd(), OvpnClient::crd()] {
                print!("---\n{}", serde_yaml::to_string(&crd)?);
            }
        }
        stackable_operator::cli::Command::Run(VpnOperatorRun {
            ovpn_image,
            pki_path,
            vault_addr,
            vault_token_file,
            vault_ca_cert,
            watch_namespace,
            resync_interval,
            reconcile_timeout,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "VPN_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let client =
                stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string())).await?;

            let vault = stackable_vault_pki::Client::new(&stackable_vault_pki::ClientConfig {
                addr: vault_addr,
                ca_cert: vault_ca_cert,
            })?;
            // Fail early if there is no usable token at all
            load_token_file(&vault, &vault_token_file).await?;
            let token_watcher = tokio::spawn({
                let vault = vault.clone();
                async move {
                    if let Err(err) = watch_token_file(vault, vault_token_file).await {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "stopped watching Vault token file, the current token is kept"
                        );
                    }
                }
            });

            let ctx = Arc::new(Ctx {
                store: KubeStore::new(&client, OPERATOR_NAME),
                signer: vault,
                image: ovpn_image,
                pki_base: pki_path,
                resync: *resync_interval,
                timeout: *reconcile_timeout,
                dh_params: Default::default(),
            });
            futures::future::join(
                server_controller::start(&client, &watch_namespace, ctx.clone()),
                client_controller::start(&client, &watch_namespace, ctx),
            )
            .await;
            token_watcher.abort();
        }
    }
    Ok(())
}
