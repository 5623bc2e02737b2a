//! Runs one replicated key-value node.
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (bootstraps a new cluster)
//! cargo run --bin node -- --raft-node-id 1 \
//!   --server-address 127.0.0.1:8001 --raft-address 127.0.0.1:7001 --volume-dir ./data/1
//!
//! # Terminals 2 and 3 (join through node 1)
//! cargo run --bin node -- --raft-node-id 2 \
//!   --server-address 127.0.0.1:8002 --raft-address 127.0.0.1:7002 --volume-dir ./data/2 \
//!   --join-address 127.0.0.1:8001
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use raft_kv::config::Settings;
use raft_kv::server::launch;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let (config, options) = Settings::parse().split();
    let node = launch(config, options).await?;
    info!(http_addr = %node.http_addr(), "node started");

    node.run_until(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
        }
    })
    .await
}
