//! Minimal client for the parts of the Vault HTTP API that back one PKI secrets engine per VPN
//! server.
//!
//! The client never retries on its own. Every operation is a single round-trip, callers that
//! need retries (such as the operator's reconcilers) get them from requeueing.

use std::{path::PathBuf, sync::Arc};

use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::RwLock;

pub mod pki;
pub mod token;
mod utils;

pub use pki::{Crl, IssuedCertificate, Pki, RoleConfig, RoleKind, RootConfig};

const TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read Vault CA certificate from {path:?}"))]
    ReadCaCertificate {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse Vault CA certificate from {path:?}"))]
    ParseCaCertificate {
        source: reqwest::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to build HTTP client"))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("no Vault token has been loaded yet"))]
    NoToken,

    #[snafu(display("failed to send request to {path:?}"))]
    SendRequest { source: reqwest::Error, path: String },

    #[snafu(display("failed to read response body from {path:?}"))]
    ReadResponse { source: reqwest::Error, path: String },

    #[snafu(display("Vault rejected request to {path:?} with {status}: {}", errors.join(", ")))]
    Rejected {
        status: StatusCode,
        path: String,
        errors: Vec<String>,
    },

    #[snafu(display("response from {path:?} is not valid JSON"))]
    InvalidJson {
        source: serde_json::Error,
        path: String,
    },

    #[snafu(display("response from {path:?} has no data"))]
    MissingData { path: String },

    #[snafu(display("response from {path:?} does not match the expected schema"))]
    DecodeData {
        source: serde_json::Error,
        path: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether Vault reported that the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Rejected { status, errors, .. } => {
                *status == StatusCode::NOT_FOUND
                    || errors.iter().any(|err| err.contains("not found"))
            }
            _ => false,
        }
    }
}

/// How to reach Vault.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base address, such as `https://vault.vault.svc:8200`.
    pub addr: String,
    /// PEM file with the CA that signed Vault's serving certificate, if it is not publicly trusted.
    pub ca_cert: Option<PathBuf>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// Authenticated handle to Vault.
///
/// Cheap to clone, all clones share the same connection pool and token.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    addr: String,
    token: Arc<RwLock<Option<String>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Client {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(path) = &config.ca_cert {
            let pem = std::fs::read(path).context(ReadCaCertificateSnafu { path })?;
            let ca = reqwest::Certificate::from_pem(&pem)
                .context(ParseCaCertificateSnafu { path })?;
            builder = builder.add_root_certificate(ca);
        }
        Ok(Self {
            http: builder.build().context(BuildHttpClientSnafu)?,
            addr: config.addr.trim_end_matches('/').to_string(),
            token: Arc::default(),
        })
    }

    /// Replaces the token used for all subsequent requests.
    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    /// Returns a handle to the PKI secrets engine mounted at `path`.
    ///
    /// The engine may not exist yet, see [`Pki::ensure_enabled`].
    pub fn pki(&self, path: impl Into<String>) -> Pki {
        Pki::new(self.clone(), path.into())
    }

    /// Performs a single API call against `/v1/{path}`.
    ///
    /// Returns `None` for responses without a body (Vault answers most writes with
    /// `204 No Content`).
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>> {
        let token = self.token.read().await.clone().context(NoTokenSnafu)?;
        let mut request = self
            .http
            .request(method, format!("{}/v1/{path}", self.addr))
            .header(TOKEN_HEADER, token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.context(SendRequestSnafu { path })?;
        let status = response.status();
        let bytes = response.bytes().await.context(ReadResponseSnafu { path })?;
        if !status.is_success() {
            let errors = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|body| body.errors)
                .unwrap_or_default();
            return RejectedSnafu {
                status,
                path,
                errors,
            }
            .fail();
        }
        if bytes.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .context(InvalidJsonSnafu { path })
    }

    /// Performs an API call and decodes the `data` field of its response into `T`.
    async fn call_data<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let mut response = self
            .call(method, path, body)
            .await?
            .context(MissingDataSnafu { path })?;
        let data = response
            .get_mut("data")
            .map(serde_json::Value::take)
            .filter(|data| !data.is_null())
            .context(MissingDataSnafu { path })?;
        serde_json::from_value(data).context(DecodeDataSnafu { path })
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::Error;

    #[test]
    fn not_found_detection() {
        let rejected = |status, errors: &[&str]| Error::Rejected {
            status,
            path: "pki/default/vpn/revoke".to_string(),
            errors: errors.iter().map(|err| err.to_string()).collect(),
        };
        assert!(rejected(StatusCode::NOT_FOUND, &[]).is_not_found());
        assert!(rejected(
            StatusCode::BAD_REQUEST,
            &["certificate with serial 1a:2b not found"]
        )
        .is_not_found());
        assert!(!rejected(StatusCode::BAD_REQUEST, &["permission denied"]).is_not_found());
        assert!(!Error::NoToken.is_not_found());
    }

    #[test]
    fn rejected_message_lists_vault_errors() {
        let err = Error::Rejected {
            status: StatusCode::FORBIDDEN,
            path: "sys/mounts".to_string(),
            errors: vec!["permission denied".to_string(), "token expired".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Vault rejected request to \"sys/mounts\" with 403 Forbidden: permission denied, token expired"
        );
    }
}
