//! Certificate trust management.
//!
//! Both sides of the protocol authenticate peers by pinned certificate
//! rather than a central CA: the client pins one daemon certificate per
//! named remote (trust-on-first-use), and the daemon pins client
//! certificates accepted through the trust-establishment action,
//! optionally gated by a shared-secret password.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};

pub mod client;
pub mod daemon;
pub mod password;

pub use client::{ServerCertStore, TrustPrompt};
pub use daemon::ClientCertStore;
pub use password::PasswordGate;

/// Errors from trust management. Never silently downgraded.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("server certificate rejected by operator")]
    Rejected,

    #[error("server certificate has changed")]
    ServerCertificateChanged,

    #[error("no certificate with fingerprint {0}")]
    UnknownFingerprint(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// SHA-256 digest of the DER-encoded certificate, rendered as lowercase
/// hex. Both sides compute it identically so fingerprints match.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    hex::encode(digest)
}

/// PEM-encode a DER certificate for on-disk pinning.
pub(crate) fn pem_encode_cert(der: &CertificateDer<'_>) -> String {
    let b64 = BASE64.encode(der.as_ref());
    let mut out = String::with_capacity(b64.len() + 64);
    out.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        // chunks of a valid base64 string are valid UTF-8
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustls::pki_types::pem::PemObject;

    pub(crate) fn test_cert(common_name: &str) -> CertificateDer<'static> {
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        let key = rcgen::KeyPair::generate().expect("key generation");
        let cert = params.self_signed(&key).expect("self-signing");
        cert.der().clone()
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let cert = test_cert("daemon");
        let a = fingerprint(&cert);
        let b = fingerprint(&cert);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_distinct_certs_differ() {
        let a = fingerprint(&test_cert("one"));
        let b = fingerprint(&test_cert("two"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_pem_round_trip() {
        let cert = test_cert("daemon");
        let pem = pem_encode_cert(&cert);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        let parsed = CertificateDer::from_pem_slice(pem.as_bytes()).unwrap();
        assert_eq!(parsed.as_ref(), cert.as_ref());
    }
}
