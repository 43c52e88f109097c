//! Shared request/response types for the daemon protocol.
//!
//! These types are serialized as JSON inside envelope metadata and request
//! bodies. Both the server (daemon) and the typed client use them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Versioned path prefix shared by every action.
pub const API_VERSION: &str = "1.0";

/// Integer API-compatibility level exchanged in the finger handshake.
pub const API_COMPAT: u32 = 1;

/// Custom header carrying the file permission mode (4-digit octal).
pub const HEADER_MODE: &str = "X-LXD-mode";
/// Custom header carrying the file owner uid (decimal).
pub const HEADER_UID: &str = "X-LXD-uid";
/// Custom header carrying the file owner gid (decimal).
pub const HEADER_GID: &str = "X-LXD-gid";

/// Finger (capability probe) response metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerResponse {
    pub api_compat: u32,
    /// `"trusted"` when the caller is a known principal, `"untrusted"`
    /// otherwise.
    pub auth: String,
}

/// Container runtime status as reported in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Stopped,
    Running,
    Frozen,
}

/// Container descriptor returned by `GET /1.0/containers/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub snapshots: Vec<String>,
}

/// Source descriptor for container creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Body of `POST /1.0/containers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub source: SourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Lifecycle actions accepted by the state endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    Freeze,
    Unfreeze,
}

/// Body of `PUT /1.0/containers/{name}/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    pub action: ContainerAction,
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /1.0/containers/{name}/snapshots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub name: String,
    #[serde(default)]
    pub stateful: bool,
}

/// Body of `POST /1.0/trust`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustAddRequest {
    #[serde(rename = "type")]
    pub kind: String,
    /// Base64-encoded DER certificate. Defaults to the TLS peer
    /// certificate of the connection when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Client-chosen host identifier the certificate is stored under.
    /// Defaults to a fingerprint prefix when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Parse the ownership/mode triple out of the custom file-transfer
/// headers.
pub fn parse_file_headers(headers: &hyper::header::HeaderMap) -> Result<(u32, u32, u32), String> {
    let get = |name: &str| -> Result<&str, String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| format!("missing {name}"))
    };

    let mode = u32::from_str_radix(get(HEADER_MODE)?, 8)
        .map_err(|e| format!("bad {HEADER_MODE}: {e}"))?;
    let uid: u32 = get(HEADER_UID)?
        .parse()
        .map_err(|e| format!("bad {HEADER_UID}: {e}"))?;
    let gid: u32 = get(HEADER_GID)?
        .parse()
        .map_err(|e| format!("bad {HEADER_GID}: {e}"))?;
    Ok((uid, gid, mode))
}

/// One entry of the `GET /1.0/trust` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEntry {
    pub host: String,
    pub fingerprint: String,
}

/// Response of `GET /1.0/trust/{fingerprint}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustCertResponse {
    #[serde(rename = "type")]
    pub kind: String,
    /// Base64-encoded DER certificate.
    pub certificate: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_request_wire_shape() {
        let req = StateRequest {
            action: ContainerAction::Stop,
            timeout: 30,
            force: true,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "stop", "timeout": 30, "force": true})
        );
    }

    #[test]
    fn test_create_request_optional_name() {
        let body = serde_json::json!({
            "source": {"type": "image", "name": "ubuntu/noble"}
        });
        let req: CreateRequest = serde_json::from_value(body).unwrap();
        assert!(req.name.is_none());
        assert_eq!(req.source.kind, "image");
    }

    #[test]
    fn test_container_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ContainerStatus::Frozen).unwrap(),
            r#""frozen""#
        );
    }

    #[test]
    fn test_trust_add_request_defaults() {
        let req: TrustAddRequest = serde_json::from_str(r#"{"type":"client"}"#).unwrap();
        assert_eq!(req.kind, "client");
        assert!(req.certificate.is_none());
        assert!(req.password.is_none());
        assert!(req.host.is_none());
    }

    #[test]
    fn test_parse_file_headers() {
        let mut headers = hyper::header::HeaderMap::new();
        headers.insert(HEADER_MODE, "0640".parse().unwrap());
        headers.insert(HEADER_UID, "1000".parse().unwrap());
        headers.insert(HEADER_GID, "1000".parse().unwrap());
        assert_eq!(parse_file_headers(&headers).unwrap(), (1000, 1000, 0o640));
    }

    #[test]
    fn test_parse_file_headers_missing_and_invalid() {
        let headers = hyper::header::HeaderMap::new();
        assert!(parse_file_headers(&headers).is_err());

        let mut headers = hyper::header::HeaderMap::new();
        headers.insert(HEADER_MODE, "99zz".parse().unwrap());
        headers.insert(HEADER_UID, "0".parse().unwrap());
        headers.insert(HEADER_GID, "0".parse().unwrap());
        assert!(parse_file_headers(&headers).is_err());
    }
}
