//! Process bootstrap: config, telemetry, store selection, server state and
//! the expiry sweeper. The RPC transport links against [`depi::server::Server`]
//! and owns the serving loop; this binary holds the process open for it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use depi::config::{self, DbType};
use depi::server::Server;
use depi::store::dolt::DoltStore;
use depi::store::mem::MemStore;
use depi::store::Store;
use depi::telemetry;

#[derive(Parser)]
#[command(name = "depi-server", version, about = "Dependency intermediation server")]
struct Args {
    /// Config file path; overrides $DEPI_CONFIG resolution.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Read the config JSON from stdin.
    #[arg(long)]
    stdin_config: bool,

    /// Root directory for $DEPI_CONFIG-based config resolution.
    #[arg(long, default_value = ".")]
    root_dir: PathBuf,
}

fn main() -> depi::Result<()> {
    let args = Args::parse();

    let config = if args.stdin_config {
        config::load_from_reader(&mut std::io::stdin())?
    } else if let Some(path) = &args.config {
        config::load(path)?
    } else {
        config::load_from_env(&args.root_dir)?
    };

    let _telemetry = telemetry::init(&config.logging);
    let config = Arc::new(config);

    let store: Arc<dyn Store> = match config.db.db_type {
        DbType::MemJson => Arc::new(MemStore::open(config.clone())?),
        DbType::Dolt => Arc::new(DoltStore::open(config.clone())?),
    };

    let server = Server::new(config.clone(), store)?;
    let _sweeper = server.start_sweeper();

    tracing::info!(
        db = ?config.db.db_type,
        insecure_port = config.server.insecure_port,
        secure_port = config.server.secure_port,
        "server state ready"
    );

    // The transport drives requests from here on.
    loop {
        std::thread::park();
    }
}
