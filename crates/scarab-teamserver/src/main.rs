//! scarab-teamserver - C2 teamserver daemon.
//!
//! Boots the session plane: loads (or generates) the beacon-facing RSA
//! keypair, opens the task/beacon store, starts the push-task worker, and
//! serves the operator control plane until SIGINT/SIGTERM. Beacon
//! listeners are started and stopped at runtime by operators through the
//! control plane.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use scarab_core::bus::MessageBus;
use scarab_core::session::SessionRegistry;
use scarab_teamserver::config::ServerConfig;
use scarab_teamserver::handler::BeaconHandler;
use scarab_teamserver::listener::ListenerManager;
use scarab_teamserver::operator::OperatorServer;
use scarab_teamserver::store::{SqliteStore, Store};
use scarab_teamserver::BusEvent;

/// scarab teamserver - beacon session plane daemon
#[derive(Parser, Debug)]
#[command(name = "scarab-teamserver")]
#[command(version, about, long_about = None)]
struct Args {
    /// Operator control-plane listen address
    #[arg(short = 'l', long, default_value = "0.0.0.0:50051")]
    bind: String,

    /// Shared operator secret (operators present its hash at login)
    #[arg(short = 'p', long)]
    secret: String,

    /// SQLite database file
    #[arg(short = 'd', long, default_value = "scarab.db")]
    db: PathBuf,

    /// Beacon-facing RSA public key PEM file
    #[arg(long, default_value = "publickey.pem")]
    public_key: PathBuf,

    /// Beacon-facing RSA private key PEM file
    #[arg(long, default_value = "privatekey.pem")]
    private_key: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            operator_secret: self.secret,
            db_path: self.db,
            public_key_path: self.public_key,
            private_key_path: self.private_key,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config();

    let keys = Arc::new(config.load_keys().context("failed to load RSA keypair")?);
    info!(
        public_key = %config.public_key_path.display(),
        private_key = %config.private_key_path.display(),
        "RSA keypair ready"
    );

    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(&config.db_path).context("failed to open database")?);
    info!(db = %config.db_path.display(), "store opened");

    let bus: MessageBus<BusEvent> = MessageBus::new();
    let sessions = Arc::new(SessionRegistry::new());
    let handler = Arc::new(BeaconHandler::new(
        keys,
        sessions,
        Arc::clone(&store),
        bus.clone(),
    ));
    let push_worker = handler.spawn_push_worker();

    let listeners = Arc::new(ListenerManager::new());
    let operator = Arc::new(OperatorServer::new(
        config.operator_secret.clone(),
        bus,
        store,
        listeners,
        handler,
    ));

    // The operator plane is the only listener bound at startup; failing
    // here is fatal.
    let control = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind operator plane at {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "operator plane listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });

    operator.run(control, shutdown_rx).await;

    push_worker.abort();
    info!("teamserver shutdown complete");
    Ok(())
}
