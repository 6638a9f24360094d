use std::time::Duration;

use crate::{pki::PkiPath, secrets::DhParamsGenerator};

/// Everything a reconciler needs besides the object it is reconciling.
pub struct Ctx<S, G> {
    pub store: S,
    pub signer: G,
    /// Image of the OpenVPN server container.
    pub image: String,
    /// Base path below which every server gets its own PKI instance.
    pub pki_base: String,
    /// How often converged objects are re-evaluated, which bounds how late certificate renewal
    /// and CRL rotation can happen.
    pub resync: Duration,
    pub timeout: Duration,
    /// Shared secret generations, which may take longer than `timeout`.
    pub dh_params: DhParamsGenerator,
}

impl<S, G> Ctx<S, G> {
    pub fn pki_path(&self, namespace: &str, server: &str) -> PkiPath {
        PkiPath::for_server(&self.pki_base, namespace, server)
    }
}
