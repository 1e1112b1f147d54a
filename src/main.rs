use chrono::Utc;
use clap::{Parser, Subcommand};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use oscp_registry::server_loop::serve;
use oscp_registry::{
    ConnectTarget, FileBackedStore, InMemoryStore, Messenger, Registry, RegistrationManager,
    Scheduler, SchedulerConfig, Shutdown, VersionUrl,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, help = "Path to TLS certificate file; serves plain HTTP when absent")]
    cert_path: Option<PathBuf>,
    #[arg(long, help = "Path to TLS private key file")]
    key_path: Option<PathBuf>,
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    #[arg(long, default_value = "29170")]
    port: u16,
    /// Protocol version served here, as VERSION=BASE_URL (repeatable)
    #[arg(long = "version-url", value_name = "VERSION=BASE_URL")]
    version_urls: Vec<VersionUrl>,
    /// Peer registry file; peers are kept in memory when absent
    #[arg(long)]
    store_path: Option<PathBuf>,
    #[arg(long, default_value = "5", help = "Scheduler tick interval, in seconds")]
    tick_interval: u64,
    #[arg(long, default_value = "10", help = "Timeout for calls to peers, in seconds")]
    request_timeout: u64,
    #[arg(long, default_value = "8")]
    max_concurrent_peers: usize,
    /// Mint this many bootstrap tokens at startup and print them
    #[arg(long, default_value = "0", value_name = "COUNT")]
    invite: usize,
    /// Register with a peer at startup, as TOKEN@VERSION=BASE_URL (repeatable);
    /// skipped when the token is already on record
    #[arg(long, value_name = "TOKEN@VERSION=BASE_URL")]
    connect: Vec<ConnectTarget>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Offline maintenance of the registry file. Do not run these against a
/// file a live server is using; pass `--invite` or `--connect` to the server
/// instead.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Mint a bootstrap token to hand to a new peer out of band
    Invite,

    /// Queue a registration with a peer that gave us its token out of band
    Connect {
        /// Token the peer issued to us
        #[arg(long)]
        token: String,
        /// Version the peer serves, as VERSION=BASE_URL (repeatable)
        #[arg(long = "peer-version-url", value_name = "VERSION=BASE_URL", required = true)]
        peer_version_urls: Vec<VersionUrl>,
    },

    /// List known peers and their status
    Peers,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    match &args.command {
        Some(Command::Invite) => {
            let manager = offline_manager(&args);
            println!("{}", manager.invite()?);
            return Ok(());
        }
        Some(Command::Connect {
            token,
            peer_version_urls,
        }) => {
            require_version_urls(&args);
            let manager = offline_manager(&args);
            let local_token = manager.connect(token, peer_version_urls)?;
            info!("Registration queued; the peer will call us with the token printed below");
            println!("{}", local_token);
            return Ok(());
        }
        Some(Command::Peers) => {
            let manager = offline_manager(&args);
            let now = Utc::now();
            for record in manager.registry().snapshot()? {
                let groups: Vec<&str> = record.group_ids.iter().map(String::as_str).collect();
                println!(
                    "{}\t{}\t{:?}\t{}",
                    record.label(),
                    record.negotiated_version,
                    record.status(now),
                    groups.join(",")
                );
            }
            return Ok(());
        }
        None => require_version_urls(&args),
    }

    let acceptor = match (&args.cert_path, &args.key_path) {
        (Some(cert_path), Some(key_path)) => {
            check_readable("cert", cert_path);
            check_readable("key", key_path);
            let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
            builder.set_certificate_chain_file(cert_path)?;
            builder.set_private_key_file(key_path, SslFiletype::PEM)?;
            Some(Arc::new(builder.build()))
        }
        (None, None) => None,
        _ => {
            error!("Error: --cert-path and --key-path must be given together");
            std::process::exit(1);
        }
    };

    let registry = match &args.store_path {
        Some(path) => {
            info!("Keeping peers in {}", path.display());
            Registry::new(FileBackedStore::new(path))
        }
        None => {
            info!("Keeping peers in memory; registrations are lost on exit");
            Registry::new(InMemoryStore::new())
        }
    };
    let manager = Arc::new(RegistrationManager::new(
        Arc::new(registry),
        args.version_urls.clone(),
    ));

    let onboarded = manager.bootstrap(args.invite, &args.connect)?;
    for invitation in &onboarded.invitations {
        println!("{}", invitation);
    }
    if !onboarded.connections.is_empty() {
        info!("Queued {} registration(s)", onboarded.connections.len());
    }
    if args.store_path.is_none() && args.invite == 0 && args.connect.is_empty() {
        warn!("No --invite or --connect given; no peer can register with this in-memory registry");
    }

    let config = SchedulerConfig {
        tick_interval: Duration::from_secs(args.tick_interval.max(1)),
        request_timeout: Duration::from_secs(args.request_timeout.max(1)),
        max_concurrent_peers: args.max_concurrent_peers,
    };
    let messenger = Messenger::new(args.version_urls.clone(), config.request_timeout)?;
    let scheduler = Scheduler::new(manager.clone(), messenger, &config);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    let scheme = if acceptor.is_some() { "https" } else { "http" };
    info!("Listening on {}://{}", scheme, addr);

    let shutdown = Arc::new(Shutdown::new());

    tokio::spawn({
        let interrupt_handle = shutdown.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            interrupt_handle.trigger();
        }
    });

    let server_handle = tokio::spawn(serve(listener, acceptor, manager.clone(), shutdown.clone()));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    // Wait for both the server and the scheduler to exit
    let _ = tokio::try_join!(server_handle, scheduler_handle);

    Ok(())
}

fn offline_manager(args: &Args) -> RegistrationManager {
    let path = args.store_path.as_ref().unwrap_or_else(|| {
        error!("Error: --store-path is required for this command");
        std::process::exit(1);
    });
    RegistrationManager::new(
        Arc::new(Registry::new(FileBackedStore::new(path))),
        args.version_urls.clone(),
    )
}

fn require_version_urls(args: &Args) {
    if args.version_urls.is_empty() {
        error!("Error: at least one --version-url VERSION=BASE_URL is required");
        std::process::exit(1);
    }
}

fn check_readable(what: &str, path: &Path) {
    if !path.exists() {
        error!("Error: {} file not found at '{}'", what, path.display());
        std::process::exit(1);
    }
    if let Err(e) = std::fs::File::open(path) {
        error!("Error: {} file '{}' is not readable: {}", what, path.display(), e);
        std::process::exit(1);
    }
}
