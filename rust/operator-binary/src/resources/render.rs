//! Renders the OpenVPN configuration files from templates.

use minijinja::{context, Environment, UndefinedBehavior};
use serde::Serialize;
use snafu::{ResultExt, Snafu};

use crate::{
    effective::ServerConfig,
    resources::deployment::{CONFIG_DIR, CONTAINER_PORT, CRL_DIR, SHARED_DIR, TLS_DIR},
    secrets::{
        CA_CERT_KEY, CRL_KEY, DH_PARAMS_KEY, SERVER_CERT_KEY, SERVER_KEY_KEY, TLS_AUTH_KEY,
    },
};

const SERVER_CONFIG: &str = "openvpn.conf";
const ENTRYPOINT: &str = "entrypoint.sh";
const CLIENT_PROFILE: &str = "client.ovpn";

#[derive(Debug, Snafu)]
#[snafu(display("failed to render {template}"))]
pub struct RenderError {
    source: minijinja::Error,
    template: &'static str,
}

fn environment() -> Result<Environment<'static>, RenderError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    for (name, source) in [
        (
            SERVER_CONFIG,
            include_str!("../../templates/openvpn.conf.j2"),
        ),
        (ENTRYPOINT, include_str!("../../templates/entrypoint.sh.j2")),
        (CLIENT_PROFILE, include_str!("../../templates/client.ovpn.j2")),
    ] {
        env.add_template(name, source)
            .context(RenderSnafu { template: name })?;
    }
    Ok(env)
}

fn render(template: &'static str, ctx: minijinja::Value) -> Result<String, RenderError> {
    environment()?
        .get_template(template)
        .and_then(|tmpl| tmpl.render(ctx))
        .context(RenderSnafu { template })
}

#[derive(Serialize)]
struct RouteContext {
    network: String,
    netmask: String,
}

pub fn server_config(config: &ServerConfig) -> Result<String, RenderError> {
    let routes = config
        .routes
        .iter()
        .map(|route| RouteContext {
            network: route.network.to_string(),
            netmask: route.netmask().to_string(),
        })
        .collect::<Vec<_>>();
    let nameservers = config
        .nameservers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    render(
        SERVER_CONFIG,
        context! {
            protocol => config.protocol.to_string(),
            container_port => CONTAINER_PORT,
            files => context! {
                server_cert => format!("{TLS_DIR}/{SERVER_CERT_KEY}"),
                server_key => format!("{TLS_DIR}/{SERVER_KEY_KEY}"),
                ca_cert => format!("{TLS_DIR}/{CA_CERT_KEY}"),
                dh_params => format!("{SHARED_DIR}/{DH_PARAMS_KEY}"),
                tls_auth => format!("{SHARED_DIR}/{TLS_AUTH_KEY}"),
                crl => format!("{CRL_DIR}/{CRL_KEY}"),
            },
            hmac => config.hmac.to_string(),
            cipher => config.cipher.to_string(),
            routes => routes,
            nameservers => nameservers,
            redirect_all => config.redirect_all,
        },
    )
}

pub fn entrypoint(config: &ServerConfig) -> Result<String, RenderError> {
    let routes = config
        .routes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    render(
        ENTRYPOINT,
        context! {
            routes => routes,
            config_file => format!("{CONFIG_DIR}/{}", super::OVPN_CONFIG_KEY),
        },
    )
}

/// Key material embedded into a client profile.
pub struct ProfileSecrets<'a> {
    pub key: &'a str,
    pub certificate: &'a str,
    pub ca_certificate: &'a str,
    pub tls_auth: &'a str,
}

pub fn client_profile(
    config: &ServerConfig,
    secrets: &ProfileSecrets<'_>,
) -> Result<String, RenderError> {
    render(
        CLIENT_PROFILE,
        context! {
            host => config.host,
            port => config.port,
            protocol => config.protocol.to_string(),
            hmac => config.hmac.to_string(),
            cipher => config.cipher.to_string(),
            key => secrets.key,
            certificate => secrets.certificate,
            ca_certificate => secrets.ca_certificate,
            tls_auth => secrets.tls_auth,
        },
    )
}
