//! Client-side pinned server certificates (trust-on-first-use).
//!
//! One certificate is pinned per named remote, stored PEM-encoded under
//! `<cert_dir>/servercerts/<remote>.crt`. The first contact captures the
//! wire certificate and asks the operator to confirm its fingerprint; all
//! later contacts must present the identical certificate byte-for-byte.

use std::path::{Path, PathBuf};

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use tracing::{debug, info};

use super::{fingerprint, pem_encode_cert, TrustError};

/// Operator confirmation hook for first-contact pinning.
///
/// The CLI implements an interactive prompt; tests implement auto-accept
/// or auto-reject.
pub trait TrustPrompt: Send + Sync {
    /// Return true to pin the certificate with the shown fingerprint.
    fn confirm(&self, remote: &str, fingerprint: &str) -> bool;
}

/// Accept every certificate without asking. Test and automation use only.
pub struct AcceptAll;

impl TrustPrompt for AcceptAll {
    fn confirm(&self, _remote: &str, _fingerprint: &str) -> bool {
        true
    }
}

/// The per-remote pinned server certificate store.
pub struct ServerCertStore {
    dir: PathBuf,
}

impl ServerCertStore {
    /// Open (or lazily create) the store under the given certificate
    /// directory.
    pub fn new(cert_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: cert_dir.as_ref().join("servercerts"),
        }
    }

    fn cert_path(&self, remote: &str) -> PathBuf {
        self.dir.join(format!("{remote}.crt"))
    }

    /// Load the pinned certificate for a remote, if any.
    pub fn load(&self, remote: &str) -> Result<Option<CertificateDer<'static>>, TrustError> {
        let path = self.cert_path(remote);
        let pem = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let cert = CertificateDer::from_pem_slice(&pem)
            .map_err(|e| TrustError::InvalidCertificate(format!("{}: {e:?}", path.display())))?;
        Ok(Some(cert))
    }

    /// Persist a certificate as the sole trusted credential for a remote.
    pub fn pin(&self, remote: &str, cert: &CertificateDer<'_>) -> Result<(), TrustError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.cert_path(remote);
        std::fs::write(&path, pem_encode_cert(cert))?;
        info!(remote, path = %path.display(), "pinned server certificate");
        Ok(())
    }

    /// Reconcile the wire-observed peer certificate against the pin.
    ///
    /// First contact: present the fingerprint to the operator; pin on
    /// confirmation, fail with [`TrustError::Rejected`] otherwise.
    /// Subsequent contacts: any byte difference fails with
    /// [`TrustError::ServerCertificateChanged`]. This runs before any
    /// response body is trusted.
    pub fn verify_or_pin(
        &self,
        remote: &str,
        wire: &CertificateDer<'_>,
        prompt: &dyn TrustPrompt,
    ) -> Result<(), TrustError> {
        match self.load(remote)? {
            Some(pinned) => {
                if pinned.as_ref() == wire.as_ref() {
                    debug!(remote, "server certificate matches pin");
                    Ok(())
                } else {
                    Err(TrustError::ServerCertificateChanged)
                }
            }
            None => {
                let digest = fingerprint(wire);
                if prompt.confirm(remote, &digest) {
                    self.pin(remote, wire)
                } else {
                    Err(TrustError::Rejected)
                }
            }
        }
    }
}
