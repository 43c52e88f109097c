//! Client-side transport and dispatch.
//!
//! Issues HTTP/1.1 requests over either the local trusted unix socket or
//! a mutually authenticated TLS session, and decodes response bodies into
//! envelopes. On the remote channel the peer certificate is reconciled
//! against the pinned-certificate store immediately after the handshake,
//! before any request is sent.

use std::path::PathBuf;
use std::sync::Arc;

use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::api::API_VERSION;
use crate::envelope::{Envelope, EnvelopeError};
use crate::tls::{self, Identity, TlsError};
use crate::trust::{ServerCertStore, TrustError, TrustPrompt};

/// Errors from the transport layer. Never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("daemon is not running (socket not found at {0})")]
    NotRunning(PathBuf),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("server presented no certificate")]
    MissingPeerCertificate,

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("request failed: {0}")]
    Request(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

enum Channel {
    Local {
        socket_path: PathBuf,
    },
    Remote {
        name: String,
        addr: String,
        tls: Arc<ClientConfig>,
        store: ServerCertStore,
        prompt: Box<dyn TrustPrompt>,
    },
}

/// A connection target: the local trusted channel or a named remote.
pub struct Transport {
    channel: Channel,
}

impl Transport {
    /// Target the local daemon over its unix socket. Implicitly trusted;
    /// no certificate checks apply.
    pub fn local(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            channel: Channel::Local {
                socket_path: socket_path.into(),
            },
        }
    }

    /// Target a named remote daemon over TLS, presenting the given client
    /// identity and pinning the server certificate under the remote name.
    pub fn remote(
        name: impl Into<String>,
        addr: impl Into<String>,
        identity: &Identity,
        store: ServerCertStore,
        prompt: Box<dyn TrustPrompt>,
    ) -> Result<Self, TlsError> {
        let tls = Arc::new(tls::client_config(identity)?);
        Ok(Self {
            channel: Channel::Remote {
                name: name.into(),
                addr: addr.into(),
                tls,
                store,
                prompt,
            },
        })
    }

    /// Whether this transport uses the local trusted channel.
    pub fn is_local(&self) -> bool {
        matches!(self.channel, Channel::Local { .. })
    }

    /// Open a fresh connection, performing the certificate reconciliation
    /// on the remote channel.
    async fn connect(&self) -> Result<Box<dyn Io>, TransportError> {
        match &self.channel {
            Channel::Local { socket_path } => {
                if !socket_path.exists() {
                    return Err(TransportError::NotRunning(socket_path.clone()));
                }
                let stream = UnixStream::connect(socket_path).await.map_err(|source| {
                    TransportError::Connect {
                        addr: socket_path.display().to_string(),
                        source,
                    }
                })?;
                Ok(Box::new(stream))
            }
            Channel::Remote {
                name,
                addr,
                tls,
                store,
                prompt,
            } => {
                let tcp =
                    TcpStream::connect(addr)
                        .await
                        .map_err(|source| TransportError::Connect {
                            addr: addr.clone(),
                            source,
                        })?;

                let server_name = ServerName::try_from(host_of(addr).to_string())
                    .map_err(|e| TransportError::Handshake(format!("invalid server name: {e}")))?;
                let stream = TlsConnector::from(Arc::clone(tls))
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| TransportError::Handshake(e.to_string()))?;

                // Pin check before any byte of the response is trusted.
                let peer = stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .cloned()
                    .ok_or(TransportError::MissingPeerCertificate)?;
                store.verify_or_pin(name, &peer, prompt.as_ref())?;

                Ok(Box::new(stream))
            }
        }
    }

    /// Send one request and return the raw response. `path` is absolute
    /// (including the version prefix and any query string).
    pub async fn request(
        &self,
        method: hyper::Method,
        path: &str,
        headers: &[(&str, String)],
        body: Option<Bytes>,
    ) -> Result<hyper::Response<hyper::body::Incoming>, TransportError> {
        let io = TokioIo::new(self.connect().await?);

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, http_body_util::Full<Bytes>>(io)
                .await
                .map_err(|e| TransportError::Request(format!("HTTP handshake failed: {e}")))?;

        // Drive the connection in the background
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });

        debug!(%method, path, "dispatching request");

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(path)
            .header("host", "stevedore");

        for (key, value) in headers {
            builder = builder.header(*key, value.as_str());
        }

        let req_body = match body {
            Some(bytes) => http_body_util::Full::new(bytes),
            None => http_body_util::Full::new(Bytes::new()),
        };

        let req = builder
            .body(req_body)
            .map_err(|e| TransportError::Request(format!("failed to build request: {e}")))?;

        sender
            .send_request(req)
            .await
            .map_err(|e| TransportError::Request(format!("request failed: {e}")))
    }

    /// Dispatch an action under the versioned prefix and decode the
    /// response body as an envelope.
    pub async fn envelope(
        &self,
        method: hyper::Method,
        action: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Envelope, TransportError> {
        let path = format!("/{API_VERSION}/{action}");
        self.envelope_abs(method, &path, body).await
    }

    /// Like [`Transport::envelope`], but with a caller-supplied absolute
    /// path (used for operation locators, which already carry the
    /// prefix).
    pub async fn envelope_abs(
        &self,
        method: hyper::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Envelope, TransportError> {
        let (headers, bytes) = match body {
            Some(value) => {
                let encoded = serde_json::to_vec(&value)
                    .map_err(|e| TransportError::Request(format!("encoding body: {e}")))?;
                (
                    vec![("content-type", "application/json".to_string())],
                    Some(Bytes::from(encoded)),
                )
            }
            None => (Vec::new(), None),
        };

        let resp = self.request(method, path, &headers, bytes).await?;
        let body = http_body_util::BodyExt::collect(resp.into_body())
            .await
            .map_err(|e| TransportError::Request(format!("failed to read response body: {e}")))?
            .to_bytes();

        Ok(Envelope::decode(&body)?)
    }
}

/// Extract the host portion of a `host:port` address, handling bracketed
/// IPv6 literals.
fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com:8443"), "example.com");
        assert_eq!(host_of("10.0.0.5:8443"), "10.0.0.5");
        assert_eq!(host_of("[::1]:8443"), "::1");
        assert_eq!(host_of("bare-host"), "bare-host");
    }

    #[tokio::test]
    async fn test_local_not_running() {
        let transport = Transport::local("/tmp/nonexistent-stevedore.sock");
        let result = transport
            .envelope(hyper::Method::GET, "finger", None)
            .await;
        assert!(matches!(result, Err(TransportError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_local_round_trip_and_malformed_body() {
        async fn finger() -> axum::Json<serde_json::Value> {
            axum::Json(serde_json::json!({
                "type": "sync",
                "result": "success",
                "metadata": {"api_compat": 1, "auth": "trusted"}
            }))
        }

        async fn garbage() -> &'static str {
            "this is not an envelope"
        }

        let app = axum::Router::new()
            .route("/1.0/finger", get(finger))
            .route("/1.0/garbage", get(garbage));

        let sock_path = std::env::temp_dir().join(format!(
            "stevedore-test-transport-{}.sock",
            std::process::id()
        ));
        std::fs::remove_file(&sock_path).ok();
        let listener = tokio::net::UnixListener::bind(&sock_path).unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let transport = Transport::local(&sock_path);
        let env = transport
            .envelope(hyper::Method::GET, "finger", None)
            .await
            .unwrap();
        let map = env.metadata_as_map().unwrap();
        assert_eq!(map.get("auth").unwrap(), "trusted");

        let err = transport
            .envelope(hyper::Method::GET, "garbage", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Envelope(EnvelopeError::Malformed(_))
        ));

        std::fs::remove_file(&sock_path).ok();
    }
}
