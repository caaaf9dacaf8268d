//! # Db
//!
//! The store facade: point ingress, graph queries and change
//! subscriptions over one backend.
//!
//! Every write goes through `Db::submit`. The per-owner merge runs in the
//! `PointStore`; while the owner is still locked, the commit hook records
//! new edges in the `GraphIndex` and enqueues the applied points on the
//! `ChangeBus`. Enqueueing never blocks, and fan-out to subscribers happens
//! on the bus thread after the lock is released.
//!
//! ## Storage Backends
//!
//! - `Db::open`: disk-backed, using `RedbBackend`
//! - `Db::in_memory`: volatile, using `MemoryBackend`
//! - `Db::with_backend`: any `PointBackend`

use crate::bus::{BusConfig, ChangeBus, ChangeEvent, Subscription, Topic};
use crate::graph::GraphIndex;
use crate::points::PointStore;
use crate::replication::PropagationConfig;
use crate::rules::RuleEngineConfig;
use crate::storage::{MemoryBackend, PointBackend, RedbBackend};
use crate::types::{
    ALL, NodeEdge, Owner, Point, ROOT, Result, node_type, node_type_of, point_type,
};
use std::path::Path;
use std::sync::Arc;

/// Tunables for a store and the services attached to it.
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    /// Change bus queues.
    pub bus: BusConfig,
    /// Rule engine queues.
    pub rules: RuleEngineConfig,
    /// Upstream propagation timeouts and retries.
    pub propagation: PropagationConfig,
}

/// A point/graph store.
#[derive(Debug)]
pub struct Db {
    store: PointStore,
    graph: GraphIndex,
    bus: ChangeBus,
    root_id: String,
    config: DbConfig,
}

impl Db {
    /// Open or create a disk-backed store.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self> {
        let backend = RedbBackend::open(path)?;
        Self::with_backend(Arc::new(backend), config)
    }

    /// Create a volatile store.
    pub fn in_memory(config: DbConfig) -> Result<Self> {
        Self::with_backend(Arc::new(MemoryBackend::new()), config)
    }

    /// Load a store from any backend, bootstrapping the root node if the
    /// backend is empty.
    pub fn with_backend(backend: Arc<dyn PointBackend>, config: DbConfig) -> Result<Self> {
        let (store, state) = PointStore::load(backend)?;

        let graph = GraphIndex::new();
        for edge in &state.edges {
            graph.insert_edge(&edge.up, &edge.down, edge.seq)?;
        }

        let root_id = match state.root_id {
            Some(id) => {
                tracing::info!(root = %id, nodes = state.nodes.len(), edges = state.edges.len(), "store loaded");
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                store.backend().set_root_id(&id)?;
                tracing::info!(root = %id, "created root node");
                id
            }
        };

        let bus = ChangeBus::new(config.bus.clone())?;
        let db = Self {
            store,
            graph,
            bus,
            root_id,
            config,
        };
        db.attach_root()?;
        Ok(db)
    }

    /// Write the root node and its edge under `root` if either is missing.
    ///
    /// The root ID is recorded before these writes, so a store interrupted
    /// while bootstrapping finishes attaching the same root on the next open.
    fn attach_root(&self) -> Result<()> {
        let id = self.root_id.as_str();
        if !self.store.contains(&Owner::node(id))? {
            self.submit_points(id, vec![Point::text(point_type::NODE_TYPE, node_type::DEVICE)])?;
        }
        if !self.store.contains(&Owner::edge(ROOT, id))? {
            self.submit_edge_points(ROOT, id, vec![Point::new(point_type::TOMBSTONE, 0.0)])?;
        }
        Ok(())
    }

    /// ID of this store's root node.
    #[must_use]
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    // =========================================================================
    // INGRESS
    // =========================================================================

    /// Merge a batch into an owner and publish what was applied.
    ///
    /// Returns the applied points (empty when the whole batch was stale).
    /// A storage error rejects the whole batch.
    pub fn submit(&self, owner: &Owner, points: Vec<Point>) -> Result<Vec<Point>> {
        let graph = &self.graph;
        let bus = &self.bus;
        self.store.upsert_points(owner, points, |report| {
            if let (Some(seq), Owner::Edge { up, down }) = (report.new_edge_seq, report.owner) {
                if let Err(e) = graph.insert_edge(up, down, seq) {
                    tracing::error!(owner = %report.owner, error = %e, "edge not indexed");
                }
            }
            bus.publish(ChangeEvent {
                owner: report.owner.clone(),
                points: report.applied.to_vec(),
            });
        })
    }

    /// Submit node points.
    pub fn submit_points(&self, node_id: &str, points: Vec<Point>) -> Result<Vec<Point>> {
        self.submit(&Owner::node(node_id), points)
    }

    /// Submit edge points, creating the edge on first write.
    pub fn submit_edge_points(&self, up: &str, down: &str, points: Vec<Point>) -> Result<Vec<Point>> {
        self.submit(&Owner::edge(up, down), points)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Current points of an owner. `NotFound` if it was never written.
    pub fn get_points(&self, owner: &Owner) -> Result<Vec<Point>> {
        self.store.get_points(owner)
    }

    /// Hierarchical query; see [`GraphIndex::get_nodes`].
    pub fn get_nodes(
        &self,
        parent: &str,
        id: &str,
        type_filter: &str,
        include_deleted: bool,
    ) -> Result<Vec<NodeEdge>> {
        self.graph
            .get_nodes(&self.store, parent, id, type_filter, include_deleted)
    }

    /// A node by ID, joined with its first live parent edge.
    ///
    /// A node that was written but never attached comes back with an empty
    /// parent.
    pub fn node(&self, id: &str) -> Result<NodeEdge> {
        if let Some(first) = self.get_nodes(ALL, id, "", false)?.into_iter().next() {
            return Ok(first);
        }
        let points = self.store.get_points(&Owner::node(id))?;
        Ok(NodeEdge {
            id: id.to_string(),
            parent: String::new(),
            node_type: node_type_of(&points),
            points,
            edge_points: Vec::new(),
        })
    }

    /// Live children of a node, optionally of one kind.
    pub fn children(&self, id: &str, type_filter: &str) -> Result<Vec<NodeEdge>> {
        self.get_nodes(id, ALL, type_filter, false)
    }

    /// Live parent edges of a node.
    pub fn parents(&self, id: &str) -> Result<Vec<NodeEdge>> {
        self.get_nodes(ALL, id, "", false)
    }

    /// Ancestors of a node; see [`GraphIndex::up`].
    pub fn up(&self, id: &str, include_deleted: bool) -> Result<Vec<String>> {
        self.graph.up(&self.store, id, include_deleted)
    }

    /// Every owner holding points, nodes first.
    pub fn owners(&self) -> Result<Vec<Owner>> {
        self.store.owners()
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Lossy change subscription.
    pub fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        self.bus.subscribe(topic)
    }

    /// Lossless change subscription, for consumers that must see every event.
    pub fn subscribe_lossless(&self, topic: Topic) -> Result<Subscription> {
        self.bus.subscribe_lossless(topic)
    }

    /// Events dropped by lossy subscribers so far.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.bus.dropped_events()
    }
}
