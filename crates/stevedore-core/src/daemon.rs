//! Daemon process — startup, shutdown, and listener orchestration.
//!
//! All mutable daemon state (pinned client certificates, pending
//! operations, the password gate) hangs off one explicitly owned
//! [`DaemonState`] passed to every request handler. Nothing here is
//! global; the state is built at startup and dropped at shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use stevedore_config::AppConfig;

use crate::backend::{ContainerBackend, MemBackend};
use crate::operation::OperationRegistry;
use crate::server;
use crate::tls::{self, Identity, TlsError};
use crate::trust::{ClientCertStore, PasswordGate, TrustError};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon startup failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state accessible to all request handlers.
pub struct DaemonState {
    pub backend: Arc<dyn ContainerBackend>,
    pub operations: OperationRegistry,
    pub client_certs: ClientCertStore,
    pub password: PasswordGate,
}

/// The stevedore daemon.
pub struct Daemon {
    config: AppConfig,
    identity: Identity,
    state: Arc<DaemonState>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl Daemon {
    /// Build a daemon from configuration with the default in-memory
    /// backend.
    pub fn new(config: AppConfig) -> Result<Self, DaemonError> {
        Self::with_backend(config, Arc::new(MemBackend::new()))
    }

    /// Build a daemon around a specific container backend.
    pub fn with_backend(
        config: AppConfig,
        backend: Arc<dyn ContainerBackend>,
    ) -> Result<Self, DaemonError> {
        let data_dir = PathBuf::from(&config.daemon.data_dir);
        let identity = Identity::find_or_generate(&data_dir, "server")?;
        let client_certs = ClientCertStore::open(&data_dir)?;
        let password = PasswordGate::new(&data_dir);

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(DaemonState {
            backend,
            operations: OperationRegistry::new(),
            client_certs,
            password,
        });

        Ok(Self {
            config,
            identity,
            state,
            shutdown_tx,
        })
    }

    /// Run the daemon until a shutdown signal is received: the unix
    /// socket listener, the TLS listener, and a ctrl-c watcher.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!(
            addr = %self.config.daemon.listen_addr,
            port = self.config.daemon.listen_port,
            socket = %self.config.daemon.socket_path,
            "stevedore daemon starting"
        );

        let router = server::router(Arc::clone(&self.state));

        let socket_path = PathBuf::from(&self.config.daemon.socket_path);
        let unix_task = tokio::spawn(server::serve_unix(
            socket_path,
            router.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let tls_config = Arc::new(tls::server_config(&self.identity)?);
        let listen = format!(
            "{}:{}",
            self.config.daemon.listen_addr, self.config.daemon.listen_port
        );
        let tls_task = tokio::spawn(server::serve_tls(
            listen,
            tls_config,
            router,
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping daemon");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
                let _ = self.shutdown_tx.send(ShutdownSignal);
            }
        }

        for task in [unix_task, tls_task] {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "listener exited with error"),
                Err(e) => warn!(error = %e, "listener task panicked"),
            }
        }

        info!("Daemon stopped");
        Ok(())
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// Set the admin password gating the trust-establishment action.
    pub fn set_trust_password(&self, password: &str) -> Result<(), DaemonError> {
        self.state.password.set(password)?;
        Ok(())
    }

    /// The daemon's TLS certificate (for out-of-band distribution).
    pub fn server_certificate(&self) -> &rustls::pki_types::CertificateDer<'static> {
        &self.identity.cert
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> AppConfig {
        let toml = format!(
            r#"
            [daemon]
            socket_path = "{sock}"
            data_dir = "{data}"
        "#,
            sock = tmp.path().join("unix.socket").display(),
            data = tmp.path().join("data").display(),
        );
        AppConfig::parse(&toml).unwrap()
    }

    #[tokio::test]
    async fn test_daemon_creation() {
        let tmp = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&tmp)).unwrap();
        assert_eq!(daemon.config().daemon.listen_port, 8443);
    }

    #[tokio::test]
    async fn test_daemon_identity_stable_across_restart() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        let first = Daemon::new(config.clone()).unwrap();
        let cert = first.server_certificate().clone();
        drop(first);

        let second = Daemon::new(config).unwrap();
        assert_eq!(second.server_certificate().as_ref(), cert.as_ref());
    }

    #[tokio::test]
    async fn test_daemon_shutdown() {
        let tmp = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&tmp)).unwrap();

        // Shutdown should not panic even before run().
        daemon.shutdown();
    }

    #[tokio::test]
    async fn test_set_trust_password() {
        let tmp = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&tmp)).unwrap();
        daemon.set_trust_password("swordfish").unwrap();
        assert!(daemon.state().password.verify("swordfish"));
        assert!(!daemon.state().password.verify("tunafish"));
    }
}
