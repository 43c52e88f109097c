//! Config builders for tests.

use std::path::Path;

use stevedore_config::AppConfig;

/// Build a daemon config rooted in a temp directory: unix socket and
/// state directory under `root`, TLS listener on the given port.
pub fn daemon_config(root: &Path, listen_port: u16) -> AppConfig {
    let toml = format!(
        r#"
        [daemon]
        listen_addr = "127.0.0.1"
        listen_port = {listen_port}
        socket_path = "{sock}"
        data_dir = "{data}"
    "#,
        sock = root.join("unix.socket").display(),
        data = root.join("data").display(),
    );
    AppConfig::parse(&toml).expect("test config is valid")
}

/// Build a client config whose certificate directory lives under `root`
/// and which knows one remote.
pub fn client_config(root: &Path, remote_name: &str, remote_addr: &str) -> AppConfig {
    let toml = format!(
        r#"
        [client]
        cert_dir = "{certs}"
        default_remote = "{remote_name}"

        [remotes.{remote_name}]
        addr = "{remote_addr}"
    "#,
        certs = root.join("client-certs").display(),
    );
    AppConfig::parse(&toml).expect("test config is valid")
}
