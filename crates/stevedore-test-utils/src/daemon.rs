//! Daemon test fixture.
//!
//! Runs a real daemon on a temp-dir unix socket and an ephemeral TLS
//! port, with helpers for building clients against either channel. The
//! temp directory is deleted when the fixture is dropped, guaranteeing
//! cleanup even on panic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use stevedore_core::daemon::Daemon;
use stevedore_core::tls::Identity;
use stevedore_core::transport::Transport;
use stevedore_core::trust::{ServerCertStore, TrustPrompt};
use stevedore_core::Client;

use crate::config::daemon_config;

/// A running daemon scoped to one test.
pub struct TestDaemon {
    pub socket_path: PathBuf,
    /// `127.0.0.1:<port>` address of the TLS listener.
    pub addr: String,
    daemon: Arc<Daemon>,
    handle: JoinHandle<()>,
    temp_dir: TempDir,
}

impl TestDaemon {
    /// Start a daemon with the in-memory backend and no trust password.
    pub async fn start() -> Self {
        Self::start_inner(None).await
    }

    /// Start a daemon whose trust-establishment action is gated by the
    /// given password.
    pub async fn start_with_password(password: &str) -> Self {
        Self::start_inner(Some(password)).await
    }

    async fn start_inner(password: Option<&str>) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");

        // Reserve an ephemeral port for the TLS listener.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("port probe");
        let port = probe.local_addr().expect("probe addr").port();
        drop(probe);

        let config = daemon_config(temp_dir.path(), port);
        let socket_path = PathBuf::from(&config.daemon.socket_path);
        let addr = format!("127.0.0.1:{port}");

        let daemon = Arc::new(Daemon::new(config).expect("daemon construction"));
        if let Some(password) = password {
            daemon
                .set_trust_password(password)
                .expect("setting trust password");
        }

        let runner = Arc::clone(&daemon);
        let handle = tokio::spawn(async move {
            runner.run().await.expect("daemon run");
        });

        let fixture = Self {
            socket_path,
            addr,
            daemon,
            handle,
            temp_dir,
        };
        fixture.wait_ready().await;
        fixture
    }

    async fn wait_ready(&self) {
        for _ in 0..100 {
            let socket_up = self.socket_path.exists();
            let tls_up = tokio::net::TcpStream::connect(&self.addr).await.is_ok();
            if socket_up && tls_up {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("daemon did not become ready");
    }

    /// The daemon's TLS certificate, for pre-pinning in tests.
    pub fn server_certificate(&self) -> CertificateDer<'static> {
        self.daemon.server_certificate().clone()
    }

    /// A client over the local trusted unix socket.
    pub fn local_client(&self) -> Client {
        Client::new(Transport::local(&self.socket_path))
    }

    /// A client over TLS, with its own identity and pin store rooted in
    /// the given directory.
    pub fn remote_client(
        &self,
        client_dir: &std::path::Path,
        prompt: Box<dyn TrustPrompt>,
    ) -> Client {
        let identity =
            Identity::find_or_generate(client_dir, "client").expect("client identity");
        let store = ServerCertStore::new(client_dir);
        let transport = Transport::remote("test", &self.addr, &identity, store, prompt)
            .expect("remote transport");
        Client::new(transport)
    }

    /// The client identity certificate stored under `client_dir`,
    /// generating it first if needed.
    pub fn client_certificate(&self, client_dir: &std::path::Path) -> CertificateDer<'static> {
        Identity::find_or_generate(client_dir, "client")
            .expect("client identity")
            .cert
    }

    /// Path for an isolated client state directory inside the fixture's
    /// temp dir.
    pub fn client_dir(&self, name: &str) -> PathBuf {
        let dir = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&dir).expect("client dir");
        dir
    }

    /// Stop the daemon and wait for its listeners to wind down.
    pub async fn stop(self) {
        self.daemon.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}
