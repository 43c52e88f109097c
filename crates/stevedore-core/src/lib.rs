#![deny(unsafe_code)]

//! stevedore core — the client/daemon communication layer.
//!
//! Implements the wire envelope, the asynchronous operation lifecycle,
//! trust-on-first-use certificate pinning, and the transport that binds
//! them together over either the local trusted unix socket or a mutually
//! authenticated TLS session. Container runtime operations sit behind the
//! [`backend::ContainerBackend`] seam; the daemon only schedules and
//! relays them.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future — the standard return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits (stable since Rust 1.75) produces opaque return
/// types that are **not** object-safe. Traits consumed via `Box<dyn Trait>` or
/// `&dyn Trait` must return a concrete `Pin<Box<dyn Future>>` instead. This
/// alias keeps those signatures readable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Shared request/response types and protocol constants.
pub mod api;
/// Container runtime seam and the in-memory backend.
pub mod backend;
/// High-level typed client.
pub mod client;
/// Daemon context object and runtime.
pub mod daemon;
/// Wire-level response envelope.
pub mod envelope;
/// Asynchronous operation lifecycle and registry.
pub mod operation;
/// Request routing and the unix/TLS listeners.
pub mod server;
/// TLS identities and rustls configuration.
pub mod tls;
/// Client-side transport and dispatch.
pub mod transport;
/// Certificate pinning and the password gate.
pub mod trust;

pub use client::Client;
pub use daemon::Daemon;
pub use envelope::{Envelope, ResponseKind};
pub use operation::{Operation, OperationResult, OperationStatus};
pub use transport::Transport;
pub use trust::fingerprint;
