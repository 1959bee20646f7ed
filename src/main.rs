use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use sshbridge::config::{self, Settings};
use sshbridge::{
    logging, BootstrapInstaller, RemoteEnvironmentProbe, SessionManager, TunnelRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "sshbridge", version, about = "SSH sessions, tunnels and remote server bootstrap")]
struct Cli {
    /// Settings file (defaults to <config dir>/sshbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command on a host profile
    Exec {
        host: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Print the remote platform and architecture
    Probe { host: String },
    /// Deploy and start the remote server configured for the host
    Install { host: String },
    /// Open the host's tunnels until Ctrl-C
    Tunnel { host: String },
    /// Manage credentials in the OS keychain
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
}

#[derive(Subcommand, Debug)]
enum SecretAction {
    /// Store a secret read from stdin under `key`
    Set { key: String },
    /// Remove a stored secret
    Delete { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(logging::DEFAULT_FILTER);
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Exec { host, command } => {
            let session = open_session(&settings, &host)?;
            let (program, args) = command
                .split_first()
                .ok_or_else(|| anyhow!("no command given"))?;
            let output = session.exec(program, args).await;
            session.close().await;
            let output = output?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            if let Some(code) = output.exit_code.filter(|code| *code != 0) {
                std::process::exit(code);
            }
        }
        Commands::Probe { host } => {
            let session = open_session(&settings, &host)?;
            let probe = RemoteEnvironmentProbe::new(&settings.probe);
            let platform = probe.detect_platform(&session).await;
            let arch = probe.detect_architecture(&session).await;
            session.close().await;
            println!("{} {}", platform, arch);
        }
        Commands::Install { host } => {
            let profile = settings.host(&host)?;
            let server = profile
                .server
                .clone()
                .ok_or_else(|| anyhow!("host {} has no [hosts.server] section", host))?;
            let session = open_session(&settings, &host)?;
            let installer =
                BootstrapInstaller::new(session.clone(), RemoteEnvironmentProbe::new(&settings.probe));
            let result = installer.install(&server).await;
            session.close().await;
            let result = result?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Tunnel { host } => {
            let profile = settings.host(&host)?;
            if profile.tunnels.is_empty() {
                return Err(anyhow!("host {} has no tunnels configured", host));
            }
            let session = open_session(&settings, &host)?;
            session.connect(None).await?;
            let registry = TunnelRegistry::new(Arc::clone(&session))?;
            for spec in &profile.tunnels {
                let tunnel = registry
                    .add_tunnel(spec.clone())
                    .await
                    .with_context(|| format!("failed to open tunnel {}", spec.name()))?;
                println!("{} listening on {}", tunnel.name, tunnel.local_addr);
            }

            tokio::signal::ctrl_c().await?;
            tracing::info!("Interrupted, closing session {}", session.id());
            session.close().await;
        }
        Commands::Secret { action } => match action {
            SecretAction::Set { key } => {
                let mut secret = String::new();
                std::io::stdin().read_line(&mut secret)?;
                sshbridge::keychain::store_secret(&key, secret.trim_end_matches(['\r', '\n']))?;
            }
            SecretAction::Delete { key } => sshbridge::keychain::delete_secret(&key)?,
        },
    }

    Ok(())
}

fn load_settings(path: Option<&std::path::Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_file(path)?,
        None => Settings::load(&config::get_config_dir()?)?,
    };
    Ok(settings)
}

fn open_session(settings: &Settings, host: &str) -> Result<Arc<SessionManager>> {
    let profile = settings.host(host)?;
    let config = profile.connection_config(settings.reconnect);
    Ok(SessionManager::with_libssh2(config, settings.ssh.clone()))
}
