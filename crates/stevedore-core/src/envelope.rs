//! Wire-level response envelope.
//!
//! Every request to the daemon yields exactly one envelope, decoded from a
//! single JSON response body. The `type` field distinguishes synchronous
//! results, references to asynchronous operations, and structured errors;
//! the `metadata` payload stays undecoded until a caller asks for a
//! concrete shape.

use serde::{Deserialize, Serialize};

use crate::operation::Operation;

/// Errors from envelope decoding and interpretation.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("expected {expected} response, got {got}")]
    UnexpectedKind {
        expected: ResponseKind,
        got: ResponseKind,
    },

    #[error("failed to decode metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// The three envelope kinds. Matching must be exhaustive at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Sync,
    Async,
    Error,
}

impl std::fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResponseKind::Sync => "sync",
            ResponseKind::Async => "async",
            ResponseKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome marker carried by sync envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncResult {
    Success,
    Failure,
}

/// A structured application error extracted from an error envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ApiError {
    pub code: u16,
    pub message: String,
}

/// The uniform response wrapper.
///
/// Exactly one of `result`, `operation`, or the error pair is meaningful,
/// determined by `kind`; [`Envelope::decode`] rejects anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: ResponseKind,

    /// Valid only for sync envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SyncResult>,

    /// Valid only for async envelopes: locator of the created operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Valid only for error envelopes.
    #[serde(rename = "error_code", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,

    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Raw, not-yet-decoded payload. Sync result body, operation
    /// descriptor, or nothing, depending on the calling action.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Envelope {
    /// Build a sync envelope with the given metadata payload.
    pub fn sync(metadata: serde_json::Value) -> Self {
        Self {
            kind: ResponseKind::Sync,
            result: Some(SyncResult::Success),
            operation: None,
            error_code: None,
            error_message: None,
            metadata,
        }
    }

    /// Build an empty sync envelope.
    pub fn sync_empty() -> Self {
        Self::sync(serde_json::Value::Null)
    }

    /// Build an async envelope referencing the given operation locator,
    /// carrying the operation's descriptor as metadata.
    pub fn r#async(operation: String, metadata: serde_json::Value) -> Self {
        Self {
            kind: ResponseKind::Async,
            result: None,
            operation: Some(operation),
            error_code: None,
            error_message: None,
            metadata,
        }
    }

    /// Build an error envelope.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Error,
            result: None,
            operation: None,
            error_code: Some(code),
            error_message: Some(message.into()),
            metadata: serde_json::Value::Null,
        }
    }

    /// Decode an envelope from a response body and check kind/field
    /// coherence.
    pub fn decode(body: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        envelope.check_coherence()?;
        Ok(envelope)
    }

    /// The fields populated must agree with `kind`.
    fn check_coherence(&self) -> Result<(), EnvelopeError> {
        match self.kind {
            ResponseKind::Sync => {
                if self.result.is_none() {
                    return Err(EnvelopeError::Malformed(
                        "sync envelope without result".into(),
                    ));
                }
                if self.operation.is_some() || self.error_message.is_some() {
                    return Err(EnvelopeError::Malformed(
                        "sync envelope with async or error fields".into(),
                    ));
                }
            }
            ResponseKind::Async => {
                if self.operation.as_deref().unwrap_or("").is_empty() {
                    return Err(EnvelopeError::Malformed(
                        "async envelope without operation locator".into(),
                    ));
                }
                if self.result.is_some() || self.error_message.is_some() {
                    return Err(EnvelopeError::Malformed(
                        "async envelope with sync or error fields".into(),
                    ));
                }
            }
            ResponseKind::Error => {
                if self.error_message.is_none() || self.error_code.is_none() {
                    return Err(EnvelopeError::Malformed(
                        "error envelope without code and message".into(),
                    ));
                }
                if self.result.is_some() || self.operation.is_some() {
                    return Err(EnvelopeError::Malformed(
                        "error envelope with sync or async fields".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Extract the structured error, if this is an error envelope.
    ///
    /// Callers must consult this before interpreting `metadata`.
    pub fn err_from(&self) -> Option<ApiError> {
        if self.kind != ResponseKind::Error {
            return None;
        }
        Some(ApiError {
            code: self.error_code.unwrap_or(500),
            message: self
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Reject envelopes of the wrong kind for the invoked action.
    pub fn expect_kind(&self, expected: ResponseKind) -> Result<(), EnvelopeError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(EnvelopeError::UnexpectedKind {
                expected,
                got: self.kind,
            })
        }
    }

    /// Decode the metadata as a generic JSON object.
    pub fn metadata_as_map(
        &self,
    ) -> Result<serde_json::Map<String, serde_json::Value>, EnvelopeError> {
        match &self.metadata {
            serde_json::Value::Object(map) => Ok(map.clone()),
            other => Err(EnvelopeError::Malformed(format!(
                "metadata is not an object: {other}"
            ))),
        }
    }

    /// Decode the metadata as an operation descriptor.
    pub fn metadata_as_operation(&self) -> Result<Operation, EnvelopeError> {
        Ok(serde_json::from_value(self.metadata.clone())?)
    }

    /// Decode the metadata into an action-specific structure.
    pub fn metadata_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(serde_json::from_value(self.metadata.clone())?)
    }
}
