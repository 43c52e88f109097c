//! High-level typed client.
//!
//! Wraps a [`Transport`] with one method per protocol action, enforcing
//! the expected envelope kind for each and driving asynchronous
//! operations to completion through the wait endpoint.

use hyper::body::Bytes;
use hyper::Method;

use crate::api::{
    ContainerAction, ContainerInfo, CreateRequest, FingerResponse, SnapshotRequest, SourceSpec,
    StateRequest, TrustAddRequest, TrustCertResponse, TrustEntry, API_COMPAT, API_VERSION,
    HEADER_GID, HEADER_MODE, HEADER_UID,
};
use crate::envelope::{ApiError, Envelope, EnvelopeError, ResponseKind};
use crate::operation::Operation;
use crate::transport::{Transport, TransportError};

/// Errors surfaced by the typed client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// An error envelope returned by the daemon, carried as data.
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("api compatibility mismatch: client {client}, daemon {daemon}")]
    ApiMismatch { client: u32, daemon: u32 },

    #[error("malformed file transfer headers: {0}")]
    FileHeaders(String),

    /// The operation completed with a failure result.
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

/// A typed connection to one daemon.
pub struct Client {
    transport: Transport,
}

impl Client {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Decode an envelope into its application payload, surfacing error
    /// envelopes and enforcing the expected kind.
    fn checked(env: Envelope, expected: ResponseKind) -> Result<Envelope, ClientError> {
        if let Some(err) = env.err_from() {
            return Err(err.into());
        }
        env.expect_kind(expected)?;
        Ok(env)
    }

    /// Capability probe. Verifies the daemon speaks a compatible API
    /// level.
    pub async fn finger(&self) -> Result<FingerResponse, ClientError> {
        let env = self.transport.envelope(Method::GET, "finger", None).await?;
        let env = Self::checked(env, ResponseKind::Sync)?;
        let finger: FingerResponse = env.metadata_as()?;
        if finger.api_compat != API_COMPAT {
            return Err(ClientError::ApiMismatch {
                client: API_COMPAT,
                daemon: finger.api_compat,
            });
        }
        Ok(finger)
    }

    /// Whether the daemon attributes this connection to a known
    /// principal. Any failure reads as untrusted.
    pub async fn am_trusted(&self) -> bool {
        match self.finger().await {
            Ok(finger) => finger.auth == "trusted",
            Err(_) => false,
        }
    }

    /// Ordered list of container names.
    pub async fn list(&self) -> Result<Vec<String>, ClientError> {
        let env = self.transport.envelope(Method::GET, "list", None).await?;
        let env = Self::checked(env, ResponseKind::Sync)?;
        Ok(env.metadata_as()?)
    }

    /// Request container creation. Returns the async envelope carrying
    /// the operation locator.
    pub async fn create(
        &self,
        name: Option<&str>,
        source: SourceSpec,
    ) -> Result<Envelope, ClientError> {
        let body = CreateRequest {
            source,
            name: name.map(str::to_string),
        };
        let env = self
            .transport
            .envelope(
                Method::POST,
                "containers",
                Some(serde_json::to_value(&body).map_err(EnvelopeError::Metadata)?),
            )
            .await?;
        Self::checked(env, ResponseKind::Async)
    }

    /// Fetch one container's descriptor.
    pub async fn container_status(&self, name: &str) -> Result<ContainerInfo, ClientError> {
        let env = self
            .transport
            .envelope(Method::GET, &format!("containers/{name}"), None)
            .await?;
        let env = Self::checked(env, ResponseKind::Sync)?;
        Ok(env.metadata_as()?)
    }

    /// Request a lifecycle action on a container.
    pub async fn action(
        &self,
        name: &str,
        action: ContainerAction,
        timeout: i64,
        force: bool,
    ) -> Result<Envelope, ClientError> {
        let body = StateRequest {
            action,
            timeout,
            force,
        };
        let env = self
            .transport
            .envelope(
                Method::PUT,
                &format!("containers/{name}/state"),
                Some(serde_json::to_value(&body).map_err(EnvelopeError::Metadata)?),
            )
            .await?;
        Self::checked(env, ResponseKind::Async)
    }

    /// Request container deletion.
    pub async fn delete(&self, name: &str) -> Result<Envelope, ClientError> {
        let env = self
            .transport
            .envelope(Method::DELETE, &format!("containers/{name}"), None)
            .await?;
        Self::checked(env, ResponseKind::Async)
    }

    /// Request a snapshot.
    pub async fn snapshot(
        &self,
        name: &str,
        snapshot: &str,
        stateful: bool,
    ) -> Result<Envelope, ClientError> {
        let body = SnapshotRequest {
            name: snapshot.to_string(),
            stateful,
        };
        let env = self
            .transport
            .envelope(
                Method::POST,
                &format!("containers/{name}/snapshots"),
                Some(serde_json::to_value(&body).map_err(EnvelopeError::Metadata)?),
            )
            .await?;
        Self::checked(env, ResponseKind::Async)
    }

    /// Push file content with ownership and mode metadata.
    pub async fn push_file(
        &self,
        container: &str,
        path: &str,
        uid: u32,
        gid: u32,
        mode: u32,
        content: Bytes,
    ) -> Result<(), ClientError> {
        let uri = format!(
            "/{API_VERSION}/containers/{container}/files?path={}",
            encode_query_value(path)
        );
        let headers = [
            (HEADER_MODE, format!("{mode:04o}")),
            (HEADER_UID, uid.to_string()),
            (HEADER_GID, gid.to_string()),
        ];
        let resp = self
            .transport
            .request(Method::PUT, &uri, &headers, Some(content))
            .await?;
        let body = http_body_util::BodyExt::collect(resp.into_body())
            .await
            .map_err(|e| TransportError::Request(format!("failed to read response body: {e}")))?
            .to_bytes();
        let env = Envelope::decode(&body)?;
        Self::checked(env, ResponseKind::Sync)?;
        Ok(())
    }

    /// Pull a file: ownership/mode metadata plus a streaming body handle.
    pub async fn pull_file(&self, container: &str, path: &str) -> Result<FilePull, ClientError> {
        let uri = format!(
            "/{API_VERSION}/containers/{container}/files?path={}",
            encode_query_value(path)
        );
        let resp = self.transport.request(Method::GET, &uri, &[], None).await?;

        if !resp.status().is_success() {
            let body = http_body_util::BodyExt::collect(resp.into_body())
                .await
                .map_err(|e| TransportError::Request(format!("failed to read response body: {e}")))?
                .to_bytes();
            let env = Envelope::decode(&body)?;
            if let Some(err) = env.err_from() {
                return Err(err.into());
            }
            return Err(EnvelopeError::Malformed(
                "non-success status without error envelope".into(),
            )
            .into());
        }

        let (parts, body) = resp.into_parts();
        let (uid, gid, mode) =
            crate::api::parse_file_headers(&parts.headers).map_err(ClientError::FileHeaders)?;
        Ok(FilePull {
            uid,
            gid,
            mode,
            body,
        })
    }

    /// Ask the daemon to trust this client's certificate, gated by the
    /// shared-secret password.
    pub async fn add_cert_to_server(
        &self,
        password: &str,
        host: Option<&str>,
    ) -> Result<(), ClientError> {
        let body = TrustAddRequest {
            kind: "client".to_string(),
            certificate: None,
            password: Some(password.to_string()),
            host: host.map(str::to_string),
        };
        let env = self
            .transport
            .envelope(
                Method::POST,
                "trust",
                Some(serde_json::to_value(&body).map_err(EnvelopeError::Metadata)?),
            )
            .await?;
        Self::checked(env, ResponseKind::Sync)?;
        Ok(())
    }

    /// List the daemon's pinned client certificates.
    pub async fn trust_list(&self) -> Result<Vec<TrustEntry>, ClientError> {
        let env = self.transport.envelope(Method::GET, "trust", None).await?;
        let env = Self::checked(env, ResponseKind::Sync)?;
        Ok(env.metadata_as()?)
    }

    /// Fetch one pinned certificate by fingerprint.
    pub async fn trust_get(&self, fingerprint: &str) -> Result<TrustCertResponse, ClientError> {
        let env = self
            .transport
            .envelope(Method::GET, &format!("trust/{fingerprint}"), None)
            .await?;
        let env = Self::checked(env, ResponseKind::Sync)?;
        Ok(env.metadata_as()?)
    }

    /// Long-poll an operation until it reaches a terminal status. The
    /// daemon bounds each wait server-side; this loop re-issues the wait
    /// whenever a non-terminal descriptor comes back.
    pub async fn wait_for(&self, operation_path: &str) -> Result<Operation, ClientError> {
        let wait_path = format!("{operation_path}/wait");
        loop {
            let env = self
                .transport
                .envelope_abs(Method::POST, &wait_path, Some(serde_json::json!({})))
                .await?;
            let env = Self::checked(env, ResponseKind::Sync)?;
            let op = env.metadata_as_operation()?;
            if op.status.is_terminal() {
                return Ok(op);
            }
        }
    }

    /// Wait for an operation and convert a failure result into an error.
    pub async fn wait_for_success(&self, operation_path: &str) -> Result<(), ClientError> {
        let op = self.wait_for(operation_path).await?;
        match op.get_error() {
            None => Ok(()),
            Some(text) => Err(ClientError::OperationFailed(text)),
        }
    }

    /// Request cancellation of an operation.
    pub async fn cancel(&self, operation_path: &str) -> Result<Operation, ClientError> {
        let env = self
            .transport
            .envelope_abs(Method::DELETE, operation_path, None)
            .await?;
        let env = Self::checked(env, ResponseKind::Sync)?;
        Ok(env.metadata_as_operation()?)
    }
}

/// A pulled file: metadata plus the still-streaming body. The caller is
/// responsible for draining it.
pub struct FilePull {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    body: hyper::body::Incoming,
}

impl std::fmt::Debug for FilePull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePull")
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl FilePull {
    /// Drain the body into memory.
    pub async fn read_to_end(self) -> Result<Bytes, ClientError> {
        Ok(http_body_util::BodyExt::collect(self.body)
            .await
            .map_err(|e| TransportError::Request(format!("failed to read file body: {e}")))?
            .to_bytes())
    }
}

/// Percent-encode a query value (everything outside the unreserved set).
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_query_value() {
        assert_eq!(encode_query_value("/etc/motd"), "/etc/motd");
        assert_eq!(encode_query_value("/tmp/a b"), "/tmp/a%20b");
        assert_eq!(encode_query_value("na?me&x"), "na%3Fme%26x");
    }
}
