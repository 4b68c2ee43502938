//! vmpool - VM pool manager with HTTP task API.
//!
//! Usage:
//!   vmpool serve [--port 20000] [--state-dir vm_cache]   # Start HTTP server
//!   vmpool status [--state-dir vm_cache]                 # Inspect pool state

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

mod error;
mod http_server;
mod pool;
mod runtime;
mod state;
mod store;

use pool::{PoolConfig, PoolManager};
use runtime::HttpBackend;
use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "vmpool")]
#[command(about = "VM pool manager with HTTP task API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "20000")]
        port: u16,

        /// Directory holding the persisted pool state
        #[arg(long, default_value = "vm_cache")]
        state_dir: PathBuf,

        /// Highest VM id; the pool manages ids 0 through this value
        #[arg(long, default_value = "50")]
        max_id: u32,

        /// Seconds between lease reaper sweeps
        #[arg(long, default_value = "60")]
        sweep_interval: u64,

        /// Disable the lease reaper
        #[arg(long)]
        no_reaper: bool,

        /// Host running the per-VM control servers
        #[arg(long, default_value = "127.0.0.1")]
        backend_host: String,

        /// Control port of VM 0 (VM n listens on this port + n)
        #[arg(long, default_value = "30000")]
        backend_base_port: u16,

        /// Per-request timeout against the control servers, in seconds
        #[arg(long, default_value = "120")]
        backend_timeout: u64,
    },
    /// Print the persisted pool state and verify the pool invariant
    Status {
        /// Directory holding the persisted pool state
        #[arg(long, default_value = "vm_cache")]
        state_dir: PathBuf,

        /// Highest VM id the pool was configured with
        #[arg(long, default_value = "50")]
        max_id: u32,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            state_dir,
            max_id,
            sweep_interval,
            no_reaper,
            backend_host,
            backend_base_port,
            backend_timeout,
        } => {
            let pool = match PoolManager::open(PoolConfig {
                state_dir,
                max_id,
                sweep_interval,
            }) {
                Ok(pool) => Arc::new(pool),
                Err(e) => {
                    eprintln!("Error: failed to open pool state: {}", e);
                    exit(1);
                }
            };
            let backend = Arc::new(HttpBackend::new(
                backend_host,
                backend_base_port,
                Duration::from_secs(backend_timeout),
            ));
            let state = AppState::new(pool, backend, !no_reaper);
            http_server::run_server(port, state).await;
        }
        Commands::Status { state_dir, max_id } => {
            if let Err(e) = print_status(&state_dir, max_id) {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
    }
}

fn print_status(state_dir: &Path, max_id: u32) -> Result<(), error::PoolError> {
    let pool = PoolManager::open(PoolConfig {
        state_dir: state_dir.to_path_buf(),
        max_id,
        sweep_interval: 60,
    })?;
    let snapshot = pool.snapshot()?;

    println!("pool:   0..={}", pool.max_id());
    println!("free:   {}", snapshot.free.len());
    println!("leased: {}", snapshot.leased.len());

    let mut leased = snapshot.leased.clone();
    leased.sort_unstable();
    for vm_id in leased {
        match snapshot.leases.get(&vm_id) {
            Some(record) => println!(
                "  vm {:>3}  timeout {:>6}  lifetime {:>6}  visited {}",
                vm_id, record.timeout, record.lifetime, record.visited
            ),
            None => println!("  vm {:>3}  (no lease record)", vm_id),
        }
    }

    match snapshot.check_invariant(max_id) {
        Ok(()) => println!("pool invariant: ok"),
        Err(violation) => {
            eprintln!("pool invariant violated: {}", violation);
            exit(1);
        }
    }
    Ok(())
}
