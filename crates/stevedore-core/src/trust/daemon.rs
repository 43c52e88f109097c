//! Daemon-side pinned client certificates.
//!
//! Client certificates accepted through the trust-establishment action
//! are kept in memory keyed by the client-chosen host identifier and
//! persisted PEM-encoded under `<data_dir>/clientcerts/<host>.crt`.
//! Reads happen on every request; writes only on trust actions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{fingerprint, pem_encode_cert, TrustError};
use crate::api::TrustEntry;

/// The daemon's set of trusted client certificates.
pub struct ClientCertStore {
    dir: PathBuf,
    certs: RwLock<BTreeMap<String, CertificateDer<'static>>>,
}

impl ClientCertStore {
    /// Open the store under the daemon data directory, loading any
    /// previously pinned certificates from disk.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, TrustError> {
        let dir = data_dir.as_ref().join("clientcerts");
        let mut certs = BTreeMap::new();

        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                        continue;
                    }
                    let host = match path.file_stem().and_then(|s| s.to_str()) {
                        Some(stem) => stem.to_string(),
                        None => continue,
                    };
                    match CertificateDer::from_pem_slice(&std::fs::read(&path)?) {
                        Ok(cert) => {
                            certs.insert(host, cert);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = ?e, "skipping unparseable client certificate");
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if !certs.is_empty() {
            info!(count = certs.len(), "loaded pinned client certificates");
        }

        Ok(Self {
            dir,
            certs: RwLock::new(certs),
        })
    }

    /// Whether this exact certificate belongs to a known principal.
    pub async fn is_trusted(&self, cert: &CertificateDer<'_>) -> bool {
        self.certs
            .read()
            .await
            .values()
            .any(|pinned| pinned.as_ref() == cert.as_ref())
    }

    /// Pin a client certificate under its host identifier, persisting it
    /// to disk before publishing it to readers.
    pub async fn add(&self, host: &str, cert: CertificateDer<'static>) -> Result<(), TrustError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{host}.crt"));
        std::fs::write(&path, pem_encode_cert(&cert))?;
        info!(host, fingerprint = %fingerprint(&cert), "pinned client certificate");
        self.certs.write().await.insert(host.to_string(), cert);
        Ok(())
    }

    /// List all pinned certificates as (host, fingerprint) pairs,
    /// ordered by host.
    pub async fn list(&self) -> Vec<TrustEntry> {
        self.certs
            .read()
            .await
            .iter()
            .map(|(host, cert)| TrustEntry {
                host: host.clone(),
                fingerprint: fingerprint(cert),
            })
            .collect()
    }

    /// Look up a stored certificate by fingerprint.
    ///
    /// Linear scan over the set; fingerprints are public identifiers, so
    /// no constant-time comparison is attempted.
    pub async fn find_by_fingerprint(
        &self,
        wanted: &str,
    ) -> Result<CertificateDer<'static>, TrustError> {
        let certs = self.certs.read().await;
        for cert in certs.values() {
            if fingerprint(cert) == wanted {
                return Ok(cert.clone());
            }
        }
        Err(TrustError::UnknownFingerprint(wanted.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_cert;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_empty() {
        let tmp = TempDir::new().unwrap();
        let store = ClientCertStore::open(tmp.path()).unwrap();
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_match() {
        let tmp = TempDir::new().unwrap();
        let store = ClientCertStore::open(tmp.path()).unwrap();
        let cert = test_cert("laptop");

        assert!(!store.is_trusted(&cert).await);
        store.add("laptop", cert.clone()).await.unwrap();
        assert!(store.is_trusted(&cert).await);

        // A different certificate is still untrusted.
        assert!(!store.is_trusted(&test_cert("other")).await);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let cert = test_cert("laptop");
        {
            let store = ClientCertStore::open(tmp.path()).unwrap();
            store.add("laptop", cert.clone()).await.unwrap();
        }

        let store = ClientCertStore::open(tmp.path()).unwrap();
        assert!(store.is_trusted(&cert).await);
        let entries = store.list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].host, "laptop");
        assert_eq!(entries[0].fingerprint, fingerprint(&cert));
    }

    #[tokio::test]
    async fn test_list_ordered_by_host() {
        let tmp = TempDir::new().unwrap();
        let store = ClientCertStore::open(tmp.path()).unwrap();
        store.add("zeta", test_cert("z")).await.unwrap();
        store.add("alpha", test_cert("a")).await.unwrap();

        let hosts: Vec<String> = store.list().await.into_iter().map(|e| e.host).collect();
        assert_eq!(hosts, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_find_by_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let store = ClientCertStore::open(tmp.path()).unwrap();
        let cert = test_cert("laptop");
        let fp = fingerprint(&cert);
        store.add("laptop", cert.clone()).await.unwrap();

        let found = store.find_by_fingerprint(&fp).await.unwrap();
        assert_eq!(found.as_ref(), cert.as_ref());

        let missing = store.find_by_fingerprint("00ff").await;
        assert!(matches!(missing, Err(TrustError::UnknownFingerprint(_))));
    }
}
