//! # Durable Storage Backends
//!
//! The `PointBackend` trait is the durability seam of the point store.
//! Backends only ever receive points that already won the merge, and
//! overwrite the row for their `(Type, Key)`: storage collapses to the
//! latest value per key, there is no history.
//!
//! - `MemoryBackend`: volatile, for tests and embedded use
//! - `RedbBackend`: disk-backed ACID storage using redb

mod memory;
mod redb_store;

pub use memory::MemoryBackend;
pub use redb_store::RedbBackend;

use crate::merge::PointSet;
use crate::types::{Owner, Point, Result};
use std::collections::BTreeMap;

/// A persisted edge with its creation sequence number.
#[derive(Debug, Clone, Default)]
pub struct StoredEdge {
    /// Parent ID.
    pub up: String,
    /// Child ID.
    pub down: String,
    /// Creation order, unique and increasing.
    pub seq: u64,
    /// Latest edge points.
    pub points: PointSet,
}

/// Everything a backend holds, loaded once at open.
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    /// ID of the store's root node, once bootstrapped.
    pub root_id: Option<String>,
    /// Latest node points by node ID.
    pub nodes: BTreeMap<String, PointSet>,
    /// Edges ordered by `seq`.
    pub edges: Vec<StoredEdge>,
}

/// Durability contract for the point store.
///
/// Implementations must be safe to call from several threads; the store
/// already serializes calls for the same owner.
pub trait PointBackend: Send + Sync + std::fmt::Debug {
    /// Load the full persisted state.
    fn load(&self) -> Result<StoredState>;

    /// Atomically persist merge winners for one owner.
    ///
    /// `new_edge_seq` is set when this write creates an edge. On error
    /// nothing from the call may be visible after a reopen.
    fn persist(&self, owner: &Owner, new_edge_seq: Option<u64>, points: &[Point]) -> Result<()>;

    /// Record the root node ID.
    fn set_root_id(&self, id: &str) -> Result<()>;
}
