//! # pointgraph-core
//!
//! The replicated point store for pointgraph - THE STORE.
//!
//! A live hierarchical model of devices, sensors and configuration: nodes
//! and edges carry time-stamped points, merged last-write-wins per
//! `(Type, Key)`. Every applied change is published on an in-process bus,
//! consumed by a reactive rule engine and by upstream replication.
//!
//! ## Pipeline
//!
//! ```text
//! submit -> PointStore (per-owner merge, durable) -> GraphIndex (new edges)
//!        -> ChangeBus -> RuleEngine -> feedback writer -> submit
//!                     -> Replicator -> Upstream peers
//! ```
//!
//! ## Architectural Constraints
//!
//! - Writes serialize per owner (node or edge), never globally
//! - A storage failure rejects the whole batch
//! - Subscribers never block the write path; the rule engine's queue is lossless
//! - No async: plain threads and crossbeam channels

// =============================================================================
// MODULES
// =============================================================================

pub mod bus;
pub mod codec;
pub mod db;
pub mod graph;
pub mod merge;
pub mod points;
pub mod registry;
pub mod replication;
pub mod rules;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{
    ALL, NodeEdge, Owner, Point, PointGraphError, PointKey, ROOT, Result, TransportError,
    bool_to_value, node_type, point_type,
};

// =============================================================================
// RE-EXPORTS: Store
// =============================================================================

pub use bus::{BusConfig, ChangeBus, ChangeEvent, Delivery, Subscription, Topic};
pub use db::{Db, DbConfig};
pub use graph::GraphIndex;
pub use merge::{PointSet, merge_points};
pub use points::PointStore;
pub use storage::{MemoryBackend, PointBackend, RedbBackend};

// =============================================================================
// RE-EXPORTS: Rules and Replication
// =============================================================================

pub use codec::{Decode, Field, decode};
pub use registry::Registry;
pub use replication::{PointBatch, PropagationConfig, Propagator, Replicator, Upstream};
pub use rules::{Notification, NotificationHub, Rule, RuleEngine, RuleEngineConfig};
