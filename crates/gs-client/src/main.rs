//! GameStream client command-line front end.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load config.toml + credentials.toml (identity generated on first run)
//!  └─ GameStreamClient::new()      -- HTTP channel factory, mDNS feed
//!  └─ one subcommand
//!       ├─ discover                 -- search for N seconds, print hosts
//!       ├─ serverinfo / apps        -- read-only queries
//!       ├─ pair / unpair            -- update credentials.toml
//!       └─ launch / resume / quit / asset
//! ```
//!
//! Host commands take an address.  The host is identified with a plaintext
//! `/serverinfo` first, so the certificate pinned for its `uniqueid` is used
//! even when its address changed since pairing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gs_client::application::client_api::GameStreamClient;
use gs_client::infrastructure::network::{AdvertisementFeed, HttpChannelFactory, MdnsFeed};
use gs_client::infrastructure::storage::config::{
    config_file_path, load_config_from, save_config_to, AppConfig,
};
use gs_client::infrastructure::storage::credentials::{
    credentials_file_path, load_credentials_from, save_credentials_to, Credentials,
};
use gs_core::crypto::generate_pin;
use gs_core::{DiscoverySource, HostEndpoint, HostId, Reachability, StreamConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Discovers, pairs with, and starts sessions on GameStream hosts.
#[derive(Debug, Parser)]
#[command(name = "gs-client", version)]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, env = "GS_CLIENT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Credential file to use instead of the platform default.
    #[arg(long, env = "GS_CLIENT_CREDENTIALS", global = true)]
    credentials: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct HostArgs {
    /// Host address (IP or name).
    address: String,

    /// Plaintext control port; defaults to the configured one.
    #[arg(long)]
    http_port: Option<u16>,

    /// TLS control port; defaults to the configured one.
    #[arg(long)]
    https_port: Option<u16>,
}

#[derive(Debug, Args)]
struct ModeArgs {
    #[arg(long, default_value_t = 1920)]
    width: u32,
    #[arg(long, default_value_t = 1080)]
    height: u32,
    #[arg(long, default_value_t = 60)]
    fps: u32,
    /// Ask the host for an HDR stream.
    #[arg(long)]
    hdr: bool,
    /// Play audio on the host instead of the client.
    #[arg(long)]
    host_audio: bool,
}

impl ModeArgs {
    fn stream_config(&self) -> StreamConfig {
        let mut config = StreamConfig::new(self.width, self.height, self.fps);
        config.enable_hdr = self.hdr;
        config.play_audio_on_host = self.host_audio;
        config
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search the LAN and print every host found.
    Discover {
        /// How long to search.
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Print a host's server info.
    Serverinfo(HostArgs),
    /// Pair with a host.  Enter the printed PIN on the host.
    Pair {
        #[command(flatten)]
        host: HostArgs,
        /// PIN to use instead of a random one.
        #[arg(long)]
        pin: Option<String>,
    },
    /// Unpair from a host and forget its certificate.
    Unpair(HostArgs),
    /// List a paired host's apps.
    Apps(HostArgs),
    /// Launch an app.
    Launch {
        #[command(flatten)]
        host: HostArgs,
        /// App id as printed by `apps`.
        app_id: String,
        #[command(flatten)]
        mode: ModeArgs,
    },
    /// Rejoin the running session.
    Resume {
        #[command(flatten)]
        host: HostArgs,
        #[command(flatten)]
        mode: ModeArgs,
    },
    /// Quit the running app.
    Quit(HostArgs),
    /// Save an app's box art.
    Asset {
        #[command(flatten)]
        host: HostArgs,
        app_id: String,
        #[arg(long, short)]
        output: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config_file_path()?,
    };
    let first_run = !config_path.exists();
    let config = load_config_from(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.client.log_level.as_str())),
        )
        .init();

    if first_run {
        save_config_to(&config_path, &config)?;
        info!(path = %config_path.display(), "wrote default config");
    }

    let credentials_path = match &cli.credentials {
        Some(path) => path.clone(),
        None => credentials_file_path()?,
    };
    let mut credentials = load_credentials_from(&credentials_path)
        .with_context(|| format!("failed to load {}", credentials_path.display()))?;
    let (identity, created) = credentials.identity_or_generate()?;
    if created {
        save_credentials_to(&credentials_path, &credentials)?;
    }

    let client = build_client(&config, &credentials, identity)?;
    let mut store = CredentialStore {
        path: credentials_path,
        credentials,
    };

    run(cli.command, &config, &client, &mut store).await
}

struct CredentialStore {
    path: PathBuf,
    credentials: Credentials,
}

impl CredentialStore {
    fn save(&self) -> anyhow::Result<()> {
        save_credentials_to(&self.path, &self.credentials)
            .with_context(|| format!("failed to save {}", self.path.display()))
    }
}

fn build_client(
    config: &AppConfig,
    credentials: &Credentials,
    identity: gs_core::ClientIdentity,
) -> anyhow::Result<GameStreamClient> {
    let channels = Arc::new(HttpChannelFactory::new(
        config.client.client_ids(),
        Some(identity.clone()),
        config.network.timeouts(),
    ));
    let service_type = config.discovery.service_type.clone();
    let feed: Option<Arc<dyn AdvertisementFeed>> = match MdnsFeed::new(service_type) {
        Ok(feed) => Some(Arc::new(feed)),
        Err(e) => {
            warn!("mDNS unavailable, polling known hosts only: {e}");
            None
        }
    };
    let client = GameStreamClient::new(
        channels,
        identity,
        feed,
        config.discovery.settings(&config.network),
    );

    for record in &credentials.hosts {
        match credentials.server_cert_der(&record.host_id) {
            Ok(Some(der)) => client.trust_host(record.host_id.clone(), der),
            Ok(None) => {}
            Err(e) => warn!(host = %record.host_id, "ignoring stored certificate: {e}"),
        }
    }
    for entry in &config.hosts {
        let endpoint = HostEndpoint::new(
            HostId::new(entry.address.clone()),
            entry.address.clone(),
            DiscoverySource::ActivePoll,
        )
        .with_ports(
            entry.http_port.unwrap_or(config.network.http_port),
            entry.https_port.unwrap_or(config.network.https_port),
        );
        client.add_known_host(HostEndpoint {
            name: entry.name.clone(),
            ..endpoint
        });
    }
    Ok(client)
}

async fn resolve(
    client: &GameStreamClient,
    config: &AppConfig,
    host: &HostArgs,
) -> anyhow::Result<HostEndpoint> {
    let (endpoint, info) = client
        .locate(
            &host.address,
            host.http_port.unwrap_or(config.network.http_port),
            host.https_port.unwrap_or(config.network.https_port),
        )
        .await
        .with_context(|| format!("no GameStream host answered at {}", host.address))?;
    info!(host = %endpoint.id, name = %info.hostname, "host located");
    Ok(endpoint)
}

async fn run(
    command: Command,
    config: &AppConfig,
    client: &GameStreamClient,
    store: &mut CredentialStore,
) -> anyhow::Result<()> {
    match command {
        Command::Discover { seconds } => {
            client.start_discovery()?;
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            client.stop_discovery();
            for host in client.hosts() {
                let reachable = match host.state.reachability {
                    Reachability::Online => "online",
                    Reachability::Offline => "offline",
                    Reachability::Unknown => "unknown",
                };
                println!(
                    "{}\t{}\t{}:{}\t{}\t{:?}",
                    host.endpoint.id,
                    host.endpoint.name,
                    host.endpoint.address,
                    host.endpoint.http_port,
                    reachable,
                    host.state.pair_status
                );
            }
        }
        Command::Serverinfo(host) => {
            let endpoint = resolve(client, config, &host).await?;
            let info = client.server_info(&endpoint).await?;
            println!("name:       {}", info.hostname);
            println!("uniqueid:   {}", info.unique_id);
            println!("version:    {}", info.app_version);
            println!("paired:     {}", info.paired);
            println!("currentgame {}", info.current_game);
            if let Some(gpu) = &info.gpu_type {
                println!("gpu:        {gpu}");
            }
        }
        Command::Pair { host, pin } => {
            let endpoint = resolve(client, config, &host).await?;
            let pin = pin.unwrap_or_else(generate_pin);
            println!("Enter PIN {pin} on {}", endpoint.name);
            let credential = client.pair(&endpoint, &pin).await?;
            store.credentials.remember_host(
                credential.host_id.clone(),
                endpoint.name.clone(),
                credential.server_cert_pem,
            );
            store.save()?;
            println!("Paired with {}", endpoint.name);
        }
        Command::Unpair(host) => {
            let endpoint = resolve(client, config, &host).await?;
            let result = client.unpair(&endpoint).await;
            if store.credentials.forget_host(&endpoint.id) {
                store.save()?;
            }
            result?;
            println!("Unpaired from {}", endpoint.name);
        }
        Command::Apps(host) => {
            let endpoint = resolve(client, config, &host).await?;
            for app in client.list_apps(&endpoint).await? {
                let marker = if app.running { "*" } else { " " };
                println!("{marker} {}\t{}", app.id, app.title);
            }
        }
        Command::Launch { host, app_id, mode } => {
            let endpoint = resolve(client, config, &host).await?;
            let ticket = client.launch(&endpoint, &app_id, &mode.stream_config()).await?;
            println!("session {} started", ticket.session_id);
            if let Some(url) = &ticket.session_url {
                println!("rtsp: {url}");
            }
        }
        Command::Resume { host, mode } => {
            let endpoint = resolve(client, config, &host).await?;
            let ticket = client.resume(&endpoint, &mode.stream_config()).await?;
            println!("session {} resumed", ticket.session_id);
        }
        Command::Quit(host) => {
            let endpoint = resolve(client, config, &host).await?;
            client.quit(&endpoint).await?;
            println!("Quit the running app on {}", endpoint.name);
        }
        Command::Asset { host, app_id, output } => {
            let endpoint = resolve(client, config, &host).await?;
            let art = client.app_asset(&endpoint, &app_id).await?;
            if art.is_empty() {
                println!("{} has no box art for app {app_id}", endpoint.name);
            } else {
                std::fs::write(&output, &art)
                    .with_context(|| format!("failed to write {}", output.display()))?;
                println!("wrote {} bytes to {}", art.len(), output.display());
            }
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
