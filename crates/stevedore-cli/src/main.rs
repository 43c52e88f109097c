#![deny(unsafe_code)]

//! stevedore CLI — command-line client and daemon launcher.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stevedore_config::AppConfig;
use stevedore_core::api::{ContainerAction, SourceSpec};
use stevedore_core::client::Client;
use stevedore_core::tls::Identity;
use stevedore_core::transport::Transport;
use stevedore_core::trust::{PasswordGate, ServerCertStore, TrustPrompt};

/// stevedore — manage containers on local and remote daemons.
#[derive(Parser)]
#[command(name = "stevedore", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "stevedore.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stevedore daemon.
    Daemon,

    /// Set the daemon's trust password.
    Password {
        /// The new password.
        password: String,
    },

    /// Probe a daemon for API compatibility and trust state.
    Finger {
        /// Remote name; defaults to the configured default remote.
        remote: Option<String>,
    },

    /// List containers.
    List {
        remote: Option<String>,
    },

    /// Create a container.
    Create {
        /// Container name, optionally prefixed `remote:`.
        name: String,

        /// Image name to create from.
        #[arg(long, default_value = "ubuntu/noble")]
        image: String,
    },

    /// Show a container's status.
    Status {
        name: String,
    },

    /// Start a container.
    Start(ActionArgs),
    /// Stop a container.
    Stop(ActionArgs),
    /// Restart a container.
    Restart(ActionArgs),
    /// Freeze a container.
    Freeze(ActionArgs),
    /// Unfreeze a container.
    Unfreeze(ActionArgs),

    /// Delete a container.
    Delete {
        name: String,
    },

    /// Snapshot a container.
    Snapshot {
        container: String,
        snapshot: String,

        /// Include runtime state in the snapshot.
        #[arg(long)]
        stateful: bool,
    },

    /// Push or pull files.
    #[command(subcommand)]
    File(FileCommands),

    /// Manage the daemon's trusted clients.
    #[command(subcommand)]
    Trust(TrustCommands),

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[derive(clap::Args)]
struct ActionArgs {
    /// Container name, optionally prefixed `remote:`.
    name: String,

    /// Seconds to wait before giving up on the action.
    #[arg(long, default_value_t = 30)]
    timeout: i64,

    /// Force the action.
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand)]
enum FileCommands {
    /// Push a local file into a container.
    Push {
        /// Local source file.
        src: PathBuf,
        /// Container name, optionally prefixed `remote:`.
        container: String,
        /// Destination path inside the container.
        dest: String,
    },
    /// Pull a file out of a container.
    Pull {
        /// Container name, optionally prefixed `remote:`.
        container: String,
        /// Source path inside the container.
        src: String,
        /// Local destination file.
        dest: PathBuf,
    },
}

#[derive(Subcommand)]
enum TrustCommands {
    /// Ask a remote daemon to trust this client's certificate.
    Add {
        remote: Option<String>,

        /// Trust password configured on the daemon.
        #[arg(long, default_value = "")]
        password: String,

        /// Host identifier to store the certificate under.
        #[arg(long)]
        host: Option<String>,
    },
    /// List a daemon's trusted client certificates.
    List {
        remote: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Daemon => cmd_daemon(config).await,
        Commands::Password { password } => cmd_password(&config, &password),
        Commands::Finger { remote } => cmd_finger(&config, remote.as_deref()).await,
        Commands::List { remote } => cmd_list(&config, remote.as_deref()).await,
        Commands::Create { name, image } => cmd_create(&config, &name, &image).await,
        Commands::Status { name } => cmd_status(&config, &name).await,
        Commands::Start(args) => cmd_action(&config, args, ContainerAction::Start).await,
        Commands::Stop(args) => cmd_action(&config, args, ContainerAction::Stop).await,
        Commands::Restart(args) => cmd_action(&config, args, ContainerAction::Restart).await,
        Commands::Freeze(args) => cmd_action(&config, args, ContainerAction::Freeze).await,
        Commands::Unfreeze(args) => cmd_action(&config, args, ContainerAction::Unfreeze).await,
        Commands::Delete { name } => cmd_delete(&config, &name).await,
        Commands::Snapshot {
            container,
            snapshot,
            stateful,
        } => cmd_snapshot(&config, &container, &snapshot, stateful).await,
        Commands::File(cmd) => cmd_file(&config, cmd).await,
        Commands::Trust(cmd) => cmd_trust(&config, cmd).await,
        Commands::Config { show } => cmd_config(&config, show),
    }
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        Ok(AppConfig::load(path).await?)
    } else {
        info!(path = %path.display(), "Config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

/// Interactive fingerprint confirmation for first contact with a remote.
struct InteractivePrompt;

impl TrustPrompt for InteractivePrompt {
    fn confirm(&self, remote: &str, fingerprint: &str) -> bool {
        print!("Certificate fingerprint for {remote}: {fingerprint}\nok (y/n)? ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim_start().chars().next(), Some('y') | Some('Y'))
    }
}

/// Split `remote:name` into its parts, falling back to the configured
/// default remote. An empty remote targets the local unix socket.
fn parse_spec<'a>(config: &'a AppConfig, raw: &'a str) -> (Option<&'a str>, &'a str) {
    match raw.split_once(':') {
        Some((remote, name)) => (Some(remote).filter(|r| !r.is_empty()), name),
        None => {
            let default = config.client.default_remote.as_str();
            (Some(default).filter(|r| !r.is_empty()), raw)
        }
    }
}

fn build_client(config: &AppConfig, remote: Option<&str>) -> Result<Client> {
    match remote {
        None => Ok(Client::new(Transport::local(&config.daemon.socket_path))),
        Some(name) => {
            let addr = config
                .remote_addr(name)
                .with_context(|| format!("unknown remote name: {name:?}"))?;
            let cert_dir = config
                .client
                .resolved_cert_dir()
                .context("cannot resolve the client certificate directory (no $HOME)")?;
            let identity = Identity::find_or_generate(&cert_dir, "client")?;
            let store = ServerCertStore::new(&cert_dir);
            let transport =
                Transport::remote(name, addr, &identity, store, Box::new(InteractivePrompt))?;
            Ok(Client::new(transport))
        }
    }
}

fn remote_client(config: &AppConfig, remote: Option<&str>) -> Result<Client> {
    let remote = remote
        .map(Some)
        .unwrap_or_else(|| Some(config.client.default_remote.as_str()).filter(|r| !r.is_empty()));
    build_client(config, remote)
}

async fn cmd_daemon(config: AppConfig) -> Result<()> {
    info!("Starting stevedore daemon");
    let daemon = stevedore_core::Daemon::new(config)?;
    daemon.run().await?;
    Ok(())
}

fn cmd_password(config: &AppConfig, password: &str) -> Result<()> {
    let gate = PasswordGate::new(&config.daemon.data_dir);
    gate.set(password)?;
    println!("Trust password updated.");
    Ok(())
}

async fn cmd_finger(config: &AppConfig, remote: Option<&str>) -> Result<()> {
    let client = remote_client(config, remote)?;
    let finger = client.finger().await?;
    println!("api_compat: {}", finger.api_compat);
    println!("auth: {}", finger.auth);
    Ok(())
}

async fn cmd_list(config: &AppConfig, remote: Option<&str>) -> Result<()> {
    let client = remote_client(config, remote)?;
    for name in client.list().await? {
        println!("{name}");
    }
    Ok(())
}

async fn cmd_create(config: &AppConfig, spec: &str, image: &str) -> Result<()> {
    let (remote, name) = parse_spec(config, spec);
    let client = build_client(config, remote)?;

    let source = SourceSpec {
        kind: "image".to_string(),
        url: None,
        name: Some(image.to_string()),
    };
    let name_opt = Some(name).filter(|n| !n.is_empty());
    let resp = client.create(name_opt, source).await?;
    let operation = resp.operation.context("async response without operation")?;
    client.wait_for_success(&operation).await?;
    println!("Created {name}");
    Ok(())
}

async fn cmd_status(config: &AppConfig, spec: &str) -> Result<()> {
    let (remote, name) = parse_spec(config, spec);
    let client = build_client(config, remote)?;
    let info = client.container_status(name).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn cmd_action(config: &AppConfig, args: ActionArgs, action: ContainerAction) -> Result<()> {
    let (remote, name) = parse_spec(config, &args.name);
    let client = build_client(config, remote)?;
    let resp = client
        .action(name, action, args.timeout, args.force)
        .await?;
    let operation = resp.operation.context("async response without operation")?;
    client.wait_for_success(&operation).await?;
    Ok(())
}

async fn cmd_delete(config: &AppConfig, spec: &str) -> Result<()> {
    let (remote, name) = parse_spec(config, spec);
    let client = build_client(config, remote)?;
    let resp = client.delete(name).await?;
    let operation = resp.operation.context("async response without operation")?;
    client.wait_for_success(&operation).await?;
    println!("Deleted {name}");
    Ok(())
}

async fn cmd_snapshot(
    config: &AppConfig,
    container: &str,
    snapshot: &str,
    stateful: bool,
) -> Result<()> {
    let (remote, name) = parse_spec(config, container);
    let client = build_client(config, remote)?;
    let resp = client.snapshot(name, snapshot, stateful).await?;
    let operation = resp.operation.context("async response without operation")?;
    client.wait_for_success(&operation).await?;
    println!("Snapshotted {name} as {snapshot}");
    Ok(())
}

async fn cmd_file(config: &AppConfig, cmd: FileCommands) -> Result<()> {
    match cmd {
        FileCommands::Push {
            src,
            container,
            dest,
        } => {
            let (remote, name) = parse_spec(config, &container);
            let client = build_client(config, remote)?;

            let content = tokio::fs::read(&src)
                .await
                .with_context(|| format!("reading {}", src.display()))?;
            let (uid, gid, mode) = local_file_meta(&src)?;
            client
                .push_file(name, &dest, uid, gid, mode, content.into())
                .await?;
            println!("Pushed {} to {name}{dest}", src.display());
        }
        FileCommands::Pull {
            container,
            src,
            dest,
        } => {
            let (remote, name) = parse_spec(config, &container);
            let client = build_client(config, remote)?;

            let pull = client.pull_file(name, &src).await?;
            let mode = pull.mode;
            let content = pull.read_to_end().await?;
            tokio::fs::write(&dest, &content)
                .await
                .with_context(|| format!("writing {}", dest.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))?;
            }
            println!("Pulled {name}{src} to {}", dest.display());
        }
    }
    Ok(())
}

async fn cmd_trust(config: &AppConfig, cmd: TrustCommands) -> Result<()> {
    match cmd {
        TrustCommands::Add {
            remote,
            password,
            host,
        } => {
            let client = remote_client(config, remote.as_deref())?;
            client
                .add_cert_to_server(&password, host.as_deref())
                .await?;
            println!("Client certificate is now trusted.");
        }
        TrustCommands::List { remote } => {
            let client = remote_client(config, remote.as_deref())?;
            for entry in client.trust_list().await? {
                println!("{}\t{}", entry.host, entry.fingerprint);
            }
        }
    }
    Ok(())
}

fn cmd_config(config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration is valid.");
    }
    Ok(())
}

fn local_file_meta(path: &Path) -> Result<(u32, u32, u32)> {
    let meta = std::fs::metadata(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Ok((meta.uid(), meta.gid(), meta.mode() & 0o7777))
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        Ok((0, 0, 0o644))
    }
}
