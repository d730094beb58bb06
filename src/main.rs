use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tns::{
    Client, ClientOptions, Command, Daemon, DaemonStores, HostConfig, MemoryContentStore,
    MemoryKeyStore, MemoryZoneStore, Request, TnsConfig, ZoneCreation, ZoneSpec,
};

const DEFAULT_MANAGER_KEY_NAME: &str = "tns-manager";

#[derive(Parser, Debug)]
#[command(name = "tns")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a zone manager daemon until Ctrl-C.
    Daemon {
        /// JSON config file; flags override its values.
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Escrow name of the manager key.
        #[arg(long)]
        manager_key: Option<String>,

        /// Zone to create at startup, as NAME:KEY. Repeatable.
        #[arg(short, long = "zone", value_name = "NAME:KEY")]
        zones: Vec<ZoneSpec>,

        /// Append logs to this file instead of stderr.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Send one query to a daemon and print the raw response.
    Client {
        /// Daemon address, e.g. /ip4/127.0.0.1/udp/4001/quic-v1/p2p/<peer-id>
        #[arg(short, long)]
        peer: String,

        /// echo, zone-request or record-request.
        #[arg(short, long, default_value = "echo")]
        command: String,

        /// Request body as JSON; built-in defaults when omitted.
        #[arg(short, long)]
        args: Option<String>,
    },
    /// Resolve a domain's _dnsaddr records and print the first peer id.
    FindPeer { domain: String },
}

fn init_tracing(default_filter: &str, log_file: Option<File>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match log_file {
        Some(file) => builder.with_writer(Mutex::new(file)).with_ansi(false).init(),
        None => builder.with_writer(std::io::stderr).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::Daemon {
            config,
            listen,
            manager_key,
            zones,
            log_file,
        } => {
            let mut file = match &config {
                Some(path) => TnsConfig::load(path)?,
                None => TnsConfig::default(),
            };
            if log_file.is_some() {
                file.log_file = log_file;
            }
            init_tracing(file.log_filter.as_deref().unwrap_or("info"), file.open_log_file()?);
            run_daemon(file, listen, manager_key, zones).await
        }
        Cmd::Client {
            peer,
            command,
            args,
        } => {
            init_tracing("warn", None);
            run_client(&peer, &command, args.as_deref()).await
        }
        Cmd::FindPeer { domain } => {
            init_tracing("warn", None);
            let client = start_client().await?;
            let peer = client.find_peer(&domain).await;
            client.close().await;
            println!("{}", peer.with_context(|| format!("failed to find a peer for {}", domain))?);
            Ok(())
        }
    }
}

/// Client bound on all interfaces so it can reach non-loopback daemons.
async fn start_client() -> Result<Client> {
    let mut opts = ClientOptions::new(Arc::new(MemoryContentStore::new()));
    opts.host = HostConfig::default().with_listen_addr(SocketAddr::from(([0, 0, 0, 0], 0)));
    Client::new(opts).await.context("failed to start client")
}

async fn run_daemon(
    file: TnsConfig,
    listen: Option<SocketAddr>,
    manager_key: Option<String>,
    extra_zones: Vec<ZoneSpec>,
) -> Result<()> {
    let mut host_config = file.host_config();
    if let Some(addr) = listen {
        host_config = host_config.with_listen_addr(addr);
    }
    let manager_key_name = manager_key
        .or(file.manager_key_name.clone())
        .unwrap_or_else(|| DEFAULT_MANAGER_KEY_NAME.to_string());

    let keys = Arc::new(MemoryKeyStore::new());
    let stores = DaemonStores {
        keys: keys.clone(),
        content: Arc::new(MemoryContentStore::new()),
        zones: Arc::new(MemoryZoneStore::new()),
    };

    let keypair = Daemon::load_manager_key(keys.as_ref(), &manager_key_name)
        .await
        .context("failed to load manager key")?;
    let daemon = Daemon::new(keypair, host_config, stores)
        .await
        .context("failed to start daemon")?;

    for zone in file.zones.iter().chain(extra_zones.iter()) {
        let req = ZoneCreation {
            name: zone.name.clone(),
            manager_key_name: manager_key_name.clone(),
            zone_key_name: zone.key_name.clone(),
        };
        match daemon.create_zone(&req).await {
            Ok(created) => info!(zone = %created.name, hash = %created.hash, "zone ready"),
            Err(e) => warn!(zone = %zone.name, error = %e, "failed to create zone"),
        }
    }

    for addr in daemon.host().listen_addrs() {
        println!("{}", addr);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, exiting gracefully");
            }
            cancel.cancel();
        });
    }

    daemon.run(cancel).await?;
    Ok(())
}

async fn run_client(peer: &str, command: &str, args: Option<&str>) -> Result<()> {
    let command = Command::from_name(command)
        .with_context(|| format!("unsupported command {:?}", command))?;
    let args = args
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--args must be valid JSON")?;
    let request = Request::from_args(command, args)?;

    let client = start_client().await?;

    let peer_id = client.add_peer(peer).await?;
    let response = client.query_raw(&peer_id, &request).await;
    client.close().await;

    let bytes = response.with_context(|| format!("{} query to {} failed", command.name(), peer_id))?;
    println!("{}", String::from_utf8_lossy(&bytes));
    Ok(())
}
