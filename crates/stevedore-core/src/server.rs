//! Daemon request routing and serving.
//!
//! One axum router carries the whole protocol surface and is served on
//! two channels at once: the local unix socket, whose callers are
//! implicitly trusted, and the TLS listener, whose callers are classified
//! per connection by their client certificate. Untrusted TLS callers may
//! only reach the finger probe and the trust-establishment action.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use serde::Deserialize;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::api::{
    self, CreateRequest, FingerResponse, SnapshotRequest, StateRequest, TrustAddRequest,
    TrustCertResponse, API_COMPAT, API_VERSION,
};
use crate::backend::{BackendError, FileRecord};
use crate::daemon::{DaemonState, ShutdownSignal};
use crate::envelope::Envelope;
use crate::operation::{operation_path, OperationError, RunFn};
use crate::trust::fingerprint;

/// Server-side bound on one long-poll wait. Clients re-issue the wait
/// when a non-terminal descriptor comes back.
pub const WAIT_BOUND: Duration = Duration::from_secs(30);

/// The authenticated origin of a connection, attached per connection as
/// a request extension.
#[derive(Clone)]
pub enum Peer {
    /// The local trusted channel.
    Local,
    /// A TLS connection presenting this client certificate.
    Tls { cert: CertificateDer<'static> },
}

/// Build the router with all protocol routes.
pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/1.0/finger", get(handle_finger))
        .route("/1.0/list", get(handle_list))
        .route("/1.0/containers", post(handle_create))
        .route(
            "/1.0/containers/{name}",
            get(handle_container_get).delete(handle_container_delete),
        )
        .route("/1.0/containers/{name}/state", put(handle_state))
        .route("/1.0/containers/{name}/snapshots", post(handle_snapshot))
        .route(
            "/1.0/containers/{name}/files",
            put(handle_file_push).get(handle_file_pull),
        )
        .route("/1.0/operations/{id}/wait", post(handle_operation_wait))
        .route("/1.0/operations/{id}", delete(handle_operation_cancel))
        .route("/1.0/trust", get(handle_trust_list).post(handle_trust_add))
        .route("/1.0/trust/{fingerprint}", get(handle_trust_cert))
        .with_state(state)
}

/// Serve the router on the local unix socket. Removes any stale socket
/// file before binding; runs until the shutdown signal is received.
pub async fn serve_unix(
    socket_path: PathBuf,
    app: Router,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<(), std::io::Error> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "unix socket listening");

    let app = app.layer(Extension(Peer::Local));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("unix socket listener shutting down");
        })
        .await?;

    std::fs::remove_file(&socket_path).ok();
    Ok(())
}

/// Serve the router on the TLS listener. Every accepted connection must
/// present a client certificate; the certificate is attached to the
/// connection's requests for per-action trust classification.
pub async fn serve_tls(
    addr: String,
    tls: Arc<ServerConfig>,
    app: Router,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "TLS listener ready");
    let acceptor = TlsAcceptor::from(tls);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("TLS listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (tcp, peer_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let stream = match acceptor.accept(tcp).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!(%peer_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    let Some(cert) = stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|certs| certs.first())
                        .cloned()
                    else {
                        debug!(%peer_addr, "connection without client certificate");
                        return;
                    };

                    let app = app.layer(Extension(Peer::Tls { cert }));
                    let service = TowerToHyperService::new(app);
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(%peer_addr, error = %e, "connection error");
                    }
                });
            }
        }
    }
}

// ── Response helpers ────────────────────────────────────────────────────

fn sync_response(metadata: serde_json::Value) -> Response {
    (StatusCode::OK, Json(Envelope::sync(metadata))).into_response()
}

fn async_response(op_path: String, descriptor: serde_json::Value) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(Envelope::r#async(op_path, descriptor)),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(Envelope::error(status.as_u16(), message))).into_response()
}

fn backend_error_response(err: BackendError) -> Response {
    let status = match err {
        BackendError::NotFound(_) | BackendError::FileNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    error_response(status, err.to_string())
}

async fn peer_trusted(state: &DaemonState, peer: &Peer) -> bool {
    match peer {
        Peer::Local => true,
        Peer::Tls { cert } => state.client_certs.is_trusted(cert).await,
    }
}

async fn require_trusted(state: &DaemonState, peer: &Peer) -> Result<(), Response> {
    if peer_trusted(state, peer).await {
        Ok(())
    } else {
        Err(error_response(StatusCode::FORBIDDEN, "untrusted client"))
    }
}

/// Launch a unit of work as an operation and answer with the async
/// envelope referencing it.
async fn accept_operation(state: &DaemonState, resource_url: String, run: RunFn) -> Response {
    let (id, descriptor) = state.operations.spawn(resource_url, run, None).await;
    let metadata = serde_json::to_value(&descriptor).unwrap_or(serde_json::Value::Null);
    async_response(operation_path(&id), metadata)
}

// ── Route handlers ──────────────────────────────────────────────────────

async fn handle_finger(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
) -> Response {
    let auth = if peer_trusted(&state, &peer).await {
        "trusted"
    } else {
        "untrusted"
    };
    let finger = FingerResponse {
        api_compat: API_COMPAT,
        auth: auth.to_string(),
    };
    sync_response(serde_json::to_value(finger).unwrap_or(serde_json::Value::Null))
}

async fn handle_list(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }
    let names = state.backend.list().await;
    sync_response(serde_json::to_value(names).unwrap_or(serde_json::Value::Null))
}

async fn handle_create(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    Json(req): Json<CreateRequest>,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }

    let name = req.name.unwrap_or_else(generated_container_name);
    let resource_url = format!("/{API_VERSION}/containers/{name}");
    let backend = Arc::clone(&state.backend);
    let source = req.source;
    let run: RunFn = Box::new(move || {
        Box::pin(async move {
            backend
                .create(name, source)
                .await
                .map_err(|e| e.to_string())
        })
    });

    accept_operation(&state, resource_url, run).await
}

async fn handle_container_get(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }
    match state.backend.status(&name).await {
        Ok(info) => sync_response(serde_json::to_value(info).unwrap_or(serde_json::Value::Null)),
        Err(e) => backend_error_response(e),
    }
}

async fn handle_container_delete(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }

    let resource_url = format!("/{API_VERSION}/containers/{name}");
    let backend = Arc::clone(&state.backend);
    let run: RunFn = Box::new(move || {
        Box::pin(async move { backend.delete(name).await.map_err(|e| e.to_string()) })
    });

    accept_operation(&state, resource_url, run).await
}

async fn handle_state(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    UrlPath(name): UrlPath<String>,
    Json(req): Json<StateRequest>,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }

    let resource_url = format!("/{API_VERSION}/containers/{name}");
    let backend = Arc::clone(&state.backend);
    let run: RunFn = Box::new(move || {
        Box::pin(async move {
            backend
                .set_state(name, req.action, req.timeout, req.force)
                .await
                .map_err(|e| e.to_string())
        })
    });

    accept_operation(&state, resource_url, run).await
}

async fn handle_snapshot(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    UrlPath(name): UrlPath<String>,
    Json(req): Json<SnapshotRequest>,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }

    let resource_url = format!("/{API_VERSION}/containers/{name}/snapshots/{}", req.name);
    let backend = Arc::clone(&state.backend);
    let run: RunFn = Box::new(move || {
        Box::pin(async move {
            backend
                .snapshot(name, req.name, req.stateful)
                .await
                .map_err(|e| e.to_string())
        })
    });

    accept_operation(&state, resource_url, run).await
}

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

async fn handle_file_push(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    UrlPath(name): UrlPath<String>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }

    let (uid, gid, mode) = match api::parse_file_headers(&headers) {
        Ok(triple) => triple,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let record = FileRecord {
        uid,
        gid,
        mode,
        content: body.to_vec(),
    };
    match state.backend.write_file(name, query.path, record).await {
        Ok(()) => sync_response(serde_json::Value::Null),
        Err(e) => backend_error_response(e),
    }
}

async fn handle_file_pull(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    UrlPath(name): UrlPath<String>,
    Query(query): Query<FileQuery>,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }

    let file = match state.backend.read_file(name, query.path).await {
        Ok(file) => file,
        Err(e) => return backend_error_response(e),
    };

    let mut headers = HeaderMap::new();
    let set = |headers: &mut HeaderMap, name: &str, value: String| {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    };
    set(&mut headers, api::HEADER_MODE, format!("{:04o}", file.mode));
    set(&mut headers, api::HEADER_UID, file.uid.to_string());
    set(&mut headers, api::HEADER_GID, file.gid.to_string());

    (StatusCode::OK, headers, file.content).into_response()
}

async fn handle_operation_wait(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    UrlPath(id): UrlPath<String>,
    _body: Bytes,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }
    match state.operations.wait(&id, WAIT_BOUND).await {
        Ok(op) => sync_response(serde_json::to_value(op).unwrap_or(serde_json::Value::Null)),
        Err(OperationError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "no such operation")
        }
        Err(OperationError::WaiterClaimed) => {
            error_response(StatusCode::CONFLICT, "operation already has a waiter")
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn handle_operation_cancel(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }
    match state.operations.cancel(&id).await {
        Ok(op) => sync_response(serde_json::to_value(op).unwrap_or(serde_json::Value::Null)),
        Err(OperationError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "no such operation")
        }
        Err(OperationError::AlreadyCompleted) => {
            error_response(StatusCode::BAD_REQUEST, "operation has already completed")
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn handle_trust_list(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }
    let entries = state.client_certs.list().await;
    sync_response(serde_json::to_value(entries).unwrap_or(serde_json::Value::Null))
}

async fn handle_trust_add(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    Json(req): Json<TrustAddRequest>,
) -> Response {
    if req.kind != "client" {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unsupported trust type: {}", req.kind),
        );
    }

    let cert: CertificateDer<'static> = match &req.certificate {
        Some(b64) => match BASE64.decode(b64) {
            Ok(der) => CertificateDer::from(der),
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("bad certificate: {e}"));
            }
        },
        None => match &peer {
            Peer::Tls { cert } => cert.clone(),
            Peer::Local => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "certificate required on the local channel",
                );
            }
        },
    };

    // An already-trusted caller (or the local channel) may add
    // certificates freely; anyone else must pass the password gate.
    if !peer_trusted(&state, &peer).await {
        let password = req.password.as_deref().unwrap_or("");
        if !state.password.verify(password) {
            return error_response(StatusCode::FORBIDDEN, "invalid trust password");
        }
    }

    let host = req
        .host
        .unwrap_or_else(|| fingerprint(&cert)[..12].to_string());
    match state.client_certs.add(&host, cert).await {
        Ok(()) => sync_response(serde_json::Value::Null),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn handle_trust_cert(
    State(state): State<Arc<DaemonState>>,
    Extension(peer): Extension<Peer>,
    UrlPath(fingerprint): UrlPath<String>,
) -> Response {
    if let Err(resp) = require_trusted(&state, &peer).await {
        return resp;
    }
    match state.client_certs.find_by_fingerprint(&fingerprint).await {
        Ok(cert) => {
            let body = TrustCertResponse {
                kind: "client".to_string(),
                certificate: BASE64.encode(cert.as_ref()),
            };
            sync_response(serde_json::to_value(body).unwrap_or(serde_json::Value::Null))
        }
        Err(_) => error_response(StatusCode::NOT_FOUND, "no such certificate"),
    }
}

fn generated_container_name() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("c-{}", hex::encode(bytes))
}
