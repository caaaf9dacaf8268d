//! # pointgraph
//!
//! The node binary: a durable point store with reactive rules and upstream
//! replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 apps/pointgraph (THE BINARY)             │
//! │                                                          │
//! │  ┌─────────┐    ┌──────────────────┐    ┌────────────┐   │
//! │  │   CLI   │    │ TCP listener /   │    │   TOML     │   │
//! │  │ (clap)  │    │ TcpUpstream      │    │   config   │   │
//! │  └────┬────┘    └────────┬─────────┘    └─────┬──────┘   │
//! │       └──────────────────┼────────────────────┘          │
//! │                          ▼                               │
//! │                 ┌─────────────────┐                      │
//! │                 │ pointgraph-core │                      │
//! │                 │   (THE STORE)   │                      │
//! │                 └─────────────────┘                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! pointgraph -D edge.redb init
//! pointgraph --config edge.toml serve
//! pointgraph submit --node sensor-1 --parent <root-id> -f points.json
//! pointgraph nodes --parent root
//! pointgraph up --id sensor-1
//! ```

use clap::Parser;
use pointgraph::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // POINTGRAPH_LOG_FORMAT=json enables machine-parseable output.
    let log_format =
        std::env::var("POINTGRAPH_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pointgraph=info,pointgraph_core=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
