//! # CLI Command Implementations

use crate::config::AppConfig;
use crate::transport::{TcpUpstream, run_listener};
use pointgraph_core::{
    Db, NodeEdge, Point, PointGraphError, Replicator, RuleEngine, point_type,
};
use std::path::Path;
use std::sync::Arc;

/// Maximum points file size for `submit` (16 MB).
const MAX_SUBMIT_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Open the configured store.
pub fn open_db(config: &AppConfig) -> Result<Db, PointGraphError> {
    tracing::debug!(path = %config.store.path.display(), "opening store");
    Db::open(&config.store.path, config.db_config())
}

fn print_json(value: &impl serde::Serialize) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create the store if needed and print its root node ID.
pub fn cmd_init(config: &AppConfig, json_mode: bool) -> Result<(), PointGraphError> {
    let db = open_db(config)?;

    if json_mode {
        print_json(&serde_json::json!({
            "database": config.store.path.to_string_lossy(),
            "root_id": db.root_id(),
        }));
        return Ok(());
    }

    println!("Store:   {}", config.store.path.display());
    println!("Root ID: {}", db.root_id());
    Ok(())
}

// =============================================================================
// SERVE COMMAND
// =============================================================================

/// Run the node until Ctrl-C.
pub async fn cmd_serve(config: &AppConfig) -> Result<(), PointGraphError> {
    let db = Arc::new(open_db(config)?);
    tracing::info!(root = db.root_id(), path = %config.store.path.display(), "store open");

    let engine = if config.rules.enabled {
        Some(RuleEngine::start(Arc::clone(&db))?)
    } else {
        tracing::info!("rule engine disabled");
        None
    };

    let replicator = Arc::new(Replicator::start(Arc::clone(&db))?);
    if let (Some(addr), Some(peer_id)) = (
        config.replication.upstream.clone(),
        config.replication.upstream_id(),
    ) {
        let upstream = TcpUpstream::new(
            peer_id.clone(),
            db.root_id(),
            addr.clone(),
            tokio::runtime::Handle::current(),
        );
        replicator.add_peer(Arc::new(upstream))?;
        tracing::info!(peer = %peer_id, %addr, "upstream configured");

        let initial = Arc::clone(&replicator);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = initial.resync(&peer_id) {
                tracing::warn!(peer = %peer_id, error = %e, "initial resync failed, will retry on next change");
            }
        });
    }

    let listener = match &config.replication.listen {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| PointGraphError::Io(format!("Bind failed: {}", e)))?;
            tracing::info!(%addr, "replication listener started");
            Some(tokio::spawn(run_listener(listener, Arc::clone(&db))))
        }
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| PointGraphError::Io(format!("Signal handler failed: {}", e)))?;
    tracing::info!("shutting down");

    if let Some(task) = listener {
        task.abort();
    }
    let stats = replicator.stats();
    tracing::info!(
        sent = stats.batches_sent,
        failed = stats.batches_failed,
        resyncs = stats.resyncs,
        "replication stopped"
    );
    if let Some(engine) = engine {
        let stats = engine.stats();
        tracing::info!(
            evaluated = stats.events_evaluated,
            actions = stats.actions_run,
            failures = stats.action_failures,
            "rule engine stopped"
        );
    }
    Ok(())
}

// =============================================================================
// SUBMIT COMMAND
// =============================================================================

/// Read a JSON array of points.
pub fn read_points(file: &Path) -> Result<Vec<Point>, PointGraphError> {
    let metadata = std::fs::metadata(file).map_err(|e| {
        PointGraphError::Io(format!("Cannot read '{}': {}", file.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(PointGraphError::Io(format!(
            "Path '{}' is not a regular file",
            file.display()
        )));
    }
    if metadata.len() > MAX_SUBMIT_FILE_SIZE {
        return Err(PointGraphError::Serialization(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            MAX_SUBMIT_FILE_SIZE
        )));
    }

    let contents = std::fs::read(file)
        .map_err(|e| PointGraphError::Io(format!("Read file: {}", e)))?;
    serde_json::from_slice(&contents)
        .map_err(|e| PointGraphError::Serialization(format!("Invalid points file: {}", e)))
}

/// Merge points into a node, attaching it under `parent` first.
pub fn cmd_submit(
    config: &AppConfig,
    json_mode: bool,
    node: &str,
    parent: Option<&str>,
    file: &Path,
) -> Result<(), PointGraphError> {
    let points = read_points(file)?;
    let db = open_db(config)?;

    if let Some(parent) = parent {
        db.submit_edge_points(parent, node, vec![Point::new(point_type::TOMBSTONE, 0.0)])?;
    }
    let submitted = points.len();
    let applied = db.submit_points(node, points)?;
    tracing::info!(node, submitted, applied = applied.len(), "points submitted");

    if json_mode {
        print_json(&serde_json::json!({
            "node": node,
            "submitted": submitted,
            "applied": applied,
        }));
        return Ok(());
    }

    println!("Node:      {}", node);
    println!("Submitted: {}", submitted);
    println!("Applied:   {}", applied.len());
    Ok(())
}

// =============================================================================
// QUERY COMMANDS
// =============================================================================

/// Print node/edge pairs.
pub fn cmd_nodes(
    config: &AppConfig,
    json_mode: bool,
    parent: &str,
    id: &str,
    node_type: &str,
    deleted: bool,
) -> Result<(), PointGraphError> {
    let db = open_db(config)?;
    let nodes = db.get_nodes(parent, id, node_type, deleted)?;

    if json_mode {
        print_json(&nodes);
        return Ok(());
    }

    if nodes.is_empty() {
        println!("No nodes.");
        return Ok(());
    }
    for ne in &nodes {
        print_node(ne);
    }
    Ok(())
}

fn print_node(ne: &NodeEdge) {
    let deleted = if ne.is_tombstoned() { " (deleted)" } else { "" };
    println!("{} [{}] under {}{}", ne.id, ne.node_type, ne.parent, deleted);
    println!("  description: {}", ne.desc());
    for p in &ne.points {
        if p.text.is_empty() {
            println!("  {}[{}] = {} @ {}", p.point_type, p.key, p.value, p.time);
        } else {
            println!("  {}[{}] = {:?} @ {}", p.point_type, p.key, p.text, p.time);
        }
    }
}

/// Print the ancestors of a node.
pub fn cmd_up(
    config: &AppConfig,
    json_mode: bool,
    id: &str,
    deleted: bool,
) -> Result<(), PointGraphError> {
    let db = open_db(config)?;
    let ups = db.up(id, deleted)?;

    if json_mode {
        print_json(&ups);
        return Ok(());
    }

    for up in &ups {
        println!("{}", up);
    }
    Ok(())
}
