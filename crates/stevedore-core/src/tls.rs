//! TLS plumbing: identity keypairs and rustls configuration.
//!
//! Neither side of the protocol chains to a CA. The client accepts
//! whatever certificate the daemon presents and reconciles it against the
//! trust store afterwards (trust-on-first-use); the daemon requires a
//! client certificate on every connection but classifies it as trusted or
//! untrusted at the application layer. The verifiers here therefore
//! validate handshake signatures only, never chain identity.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tracing::info;

/// Errors from TLS setup.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("private key error: {0}")]
    PrivateKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

static CRYPTO_INIT: Once = Once::new();

/// Install the process-wide rustls crypto provider. Idempotent; call
/// before building any TLS configuration.
pub fn init_crypto() {
    CRYPTO_INIT.call_once(|| {
        // A concurrent install by another component is acceptable.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// A local identity: self-signed certificate plus private key.
pub struct Identity {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Load the identity stored as `<dir>/<stem>.crt` / `<dir>/<stem>.key`,
    /// generating and persisting a fresh self-signed one on first use.
    pub fn find_or_generate(dir: impl AsRef<Path>, stem: &str) -> Result<Self, TlsError> {
        let dir = dir.as_ref();
        let cert_path = dir.join(format!("{stem}.crt"));
        let key_path = dir.join(format!("{stem}.key"));

        if cert_path.exists() && key_path.exists() {
            return Self::load(&cert_path, &key_path);
        }

        let key = rcgen::KeyPair::generate()
            .map_err(|e| TlsError::PrivateKey(format!("key generation: {e}")))?;
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, stem);
        let cert = params
            .self_signed(&key)
            .map_err(|e| TlsError::Certificate(format!("self-signing: {e}")))?;

        std::fs::create_dir_all(dir)?;
        std::fs::write(&cert_path, cert.pem())?;
        std::fs::write(&key_path, key.serialize_pem())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!(cert = %cert_path.display(), "generated identity keypair");

        Self::load(&cert_path, &key_path)
    }

    fn load(cert_path: &PathBuf, key_path: &PathBuf) -> Result<Self, TlsError> {
        let cert = CertificateDer::from_pem_slice(&std::fs::read(cert_path)?)
            .map_err(|e| TlsError::Certificate(format!("{}: {e:?}", cert_path.display())))?;
        let key = PrivateKeyDer::from_pem_slice(&std::fs::read(key_path)?)
            .map_err(|e| TlsError::PrivateKey(format!("{}: {e:?}", key_path.display())))?;
        Ok(Self { cert, key })
    }
}

/// Build the client configuration: present our certificate, accept the
/// server's pending the pin check.
pub fn client_config(identity: &Identity) -> Result<ClientConfig, TlsError> {
    init_crypto();
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(FirstContactVerifier::new()))
        .with_client_auth_cert(vec![identity.cert.clone()], identity.key.clone_key())
        .map_err(|e| TlsError::Config(format!("client config: {e}")))?;
    Ok(config)
}

/// Build the server configuration: require a client certificate, accept
/// any; the trust decision is per-action daemon policy.
pub fn server_config(identity: &Identity) -> Result<ServerConfig, TlsError> {
    init_crypto();
    let config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(RequireAnyClientCert::new()))
        .with_single_cert(vec![identity.cert.clone()], identity.key.clone_key())
        .map_err(|e| TlsError::Config(format!("server config: {e}")))?;
    Ok(config)
}

/// Server-certificate verifier for the TOFU model: signature checks only.
#[derive(Debug)]
struct FirstContactVerifier {
    provider: CryptoProvider,
}

impl FirstContactVerifier {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for FirstContactVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // Identity is established by the pin check after the handshake.
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client-certificate verifier: mandatory presence, any issuer.
#[derive(Debug)]
struct RequireAnyClientCert {
    provider: CryptoProvider,
}

impl RequireAnyClientCert {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ClientCertVerifier for RequireAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_identity_generation_persists() {
        let tmp = TempDir::new().unwrap();
        let first = Identity::find_or_generate(tmp.path(), "client").unwrap();
        let second = Identity::find_or_generate(tmp.path(), "client").unwrap();
        assert_eq!(first.cert.as_ref(), second.cert.as_ref());
    }

    #[test]
    fn test_distinct_stems_distinct_identities() {
        let tmp = TempDir::new().unwrap();
        let a = Identity::find_or_generate(tmp.path(), "client").unwrap();
        let b = Identity::find_or_generate(tmp.path(), "server").unwrap();
        assert_ne!(a.cert.as_ref(), b.cert.as_ref());
    }

    #[test]
    fn test_configs_build() {
        let tmp = TempDir::new().unwrap();
        let identity = Identity::find_or_generate(tmp.path(), "node").unwrap();
        client_config(&identity).unwrap();
        server_config(&identity).unwrap();
    }

    #[tokio::test]
    async fn test_mutual_handshake_exposes_peer_certs() {
        let tmp = TempDir::new().unwrap();
        let server_id = Identity::find_or_generate(tmp.path(), "server").unwrap();
        let client_id = Identity::find_or_generate(tmp.path(), "client").unwrap();
        let server_cert = server_id.cert.clone();
        let client_cert = client_id.cert.clone();

        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config(&server_id).unwrap()));
        let connector =
            tokio_rustls::TlsConnector::from(Arc::new(client_config(&client_id).unwrap()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let peer = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            peer
        });

        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();
        let observed_server = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();

        let observed_client = server.await.unwrap();
        assert_eq!(observed_server.as_ref(), server_cert.as_ref());
        assert_eq!(observed_client.as_ref(), client_cert.as_ref());
    }
}
