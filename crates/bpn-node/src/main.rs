//! Thin command-line entry point for the relay node: load configuration,
//! open (and restore) the bundle store, load the security policy, and run
//! until shut down.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use bpn_bpsec::{BpSecConfig, BpSecPolicyManager};
use bpn_node::{logging, NodeConfig, NodeCounters};
use bpn_storage::BundleStore;

#[derive(Debug, Parser)]
#[command(name = "bpn-node", about = "Delay-tolerant networking relay node")]
struct Args {
    /// Path to the node configuration file (TOML).
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if args.json_logs {
        logging::init_json();
    } else {
        logging::init();
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::load(&args.config)?;
    info!(node_id = config.node.node_id, "starting bpn-node");

    let mut policy_manager = BpSecPolicyManager::new();
    if let Some(security_path) = &config.security_config {
        let security_config = BpSecConfig::load(security_path)?;
        policy_manager.load_from_config(&security_config)?;
        info!(path = %security_path.display(), "loaded BPSec policy configuration");
    }

    let store = BundleStore::new(config.storage.to_store_options())?;
    let counters = NodeCounters::new();
    let snapshot = counters.snapshot(store.counters());
    info!(
        bundles = snapshot.num_bundles_restored,
        bytes = snapshot.num_bytes_restored,
        segments = snapshot.num_segments_restored,
        "store ready"
    );

    // ingress/egress transports attach here; the thin entry point just
    // holds the store open until stdin closes
    info!("node running; close stdin to shut down");
    let mut sink = Vec::new();
    let _ = std::io::stdin().read_to_end(&mut sink);

    info!("shutting down");
    drop(store);
    Ok(())
}
