//! # pointgraph CLI Module
//!
//! ## Available Commands
//!
//! - `init` - Create a store and print its root node ID
//! - `serve` - Run the rule engine and replication until Ctrl-C
//! - `submit` - Merge points from a JSON file into a node
//! - `nodes` - Query node/edge pairs
//! - `up` - List the ancestors of a node

mod commands;

use crate::config::AppConfig;
use clap::{Parser, Subcommand};
use pointgraph_core::{ALL, PointGraphError};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// pointgraph - replicated point store for IoT fleets
///
/// Nodes and edges carry time-stamped points merged last-write-wins.
/// Changes drive local rules and flow to an upstream node.
#[derive(Parser, Debug)]
#[command(name = "pointgraph")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the store, overrides `[store] path`
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the store if needed and print the root node ID
    Init,

    /// Run the rule engine, the replication listener and the upstream link
    Serve,

    /// Merge points from a JSON array file into a node
    Submit {
        /// Node receiving the points
        #[arg(short, long)]
        node: String,

        /// Attach the node under this parent first
        #[arg(short, long)]
        parent: Option<String>,

        /// JSON file holding an array of points
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Query node/edge pairs ("all" and "root" are accepted)
    Nodes {
        /// Parent ID
        #[arg(short, long, default_value = ALL)]
        parent: String,

        /// Node ID
        #[arg(short, long, default_value = ALL)]
        id: String,

        /// Only nodes of this type
        #[arg(short = 't', long = "type", default_value = "")]
        node_type: String,

        /// Include tombstoned edges
        #[arg(long)]
        deleted: bool,
    },

    /// List the ancestors of a node, nearest first
    Up {
        /// Node ID
        #[arg(short, long)]
        id: String,

        /// Follow tombstoned edges too
        #[arg(long)]
        deleted: bool,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), PointGraphError> {
    let config = AppConfig::load(cli.config.as_deref())?.with_store_path(cli.database);
    let json_mode = cli.json_mode;

    match cli.command {
        Commands::Init => cmd_init(&config, json_mode),
        Commands::Serve => cmd_serve(&config).await,
        Commands::Submit { node, parent, file } => {
            cmd_submit(&config, json_mode, &node, parent.as_deref(), &file)
        }
        Commands::Nodes {
            parent,
            id,
            node_type,
            deleted,
        } => cmd_nodes(&config, json_mode, &parent, &id, &node_type, deleted),
        Commands::Up { id, deleted } => cmd_up(&config, json_mode, &id, deleted),
    }
}
