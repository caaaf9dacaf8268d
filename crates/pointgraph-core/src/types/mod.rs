//! # Core Type Definitions
//!
//! This module contains the data model shared by every pointgraph component:
//! - Points and their merge identity (`Point`, `PointKey`)
//! - Point owners (`Owner`) and the query view (`NodeEdge`)
//! - Well-known point and node type strings
//! - Error types (`PointGraphError`, `TransportError`)
//!
//! Unknown point types are never rejected: a point is an opaque
//! `(Type, Key)` fact to the store, only the rule engine and the
//! graph index look at specific types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// SENTINELS
// =============================================================================

/// Virtual top ancestor. Top-level nodes hang off an edge whose `up` is `"root"`.
pub const ROOT: &str = "root";

/// Wildcard accepted by graph queries for either side of an edge.
pub const ALL: &str = "all";

/// Well-known point types.
pub mod point_type {
    /// Human readable description of a node.
    pub const DESCRIPTION: &str = "description";
    /// The kind of a node (`device`, `rule`, ...).
    pub const NODE_TYPE: &str = "nodeType";
    /// Edge tombstone, truthy when the edge is logically deleted.
    pub const TOMBSTONE: &str = "tombstone";
    /// Rule and condition activity latch.
    pub const ACTIVE: &str = "active";
    /// Generic sensor value.
    pub const VALUE: &str = "value";
    /// Role of a child on its parent edge.
    pub const ROLE: &str = "role";
    /// Condition/action target node.
    pub const NODE_ID: &str = "nodeID";
    /// Condition/action point type.
    pub const POINT_TYPE: &str = "pointType";
    /// Condition point index, `-1` for any.
    pub const POINT_INDEX: &str = "pointIndex";
    /// Condition value type (`number`, `onOff`, `text`).
    pub const VALUE_TYPE: &str = "valueType";
    /// Condition comparison operator.
    pub const OPERATOR: &str = "operator";
    /// Action kind (`setValue`, `notify`).
    pub const ACTION: &str = "action";
}

/// Well-known node kinds, stored as the text of a `nodeType` point.
pub mod node_type {
    /// A device (the root node of every store is one).
    pub const DEVICE: &str = "device";
    /// A user account.
    pub const USER: &str = "user";
    /// A grouping node.
    pub const GROUP: &str = "group";
    /// A rule; conditions and actions are its children.
    pub const RULE: &str = "rule";
    /// A rule condition.
    pub const CONDITION: &str = "condition";
    /// A rule action.
    pub const ACTION: &str = "action";
}

// =============================================================================
// POINT
// =============================================================================

/// A timestamped typed fact attached to a node or an edge.
///
/// Identity within its owner is `(point_type, key)`; `time` decides which
/// of two points with the same identity survives a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Point type, e.g. `temp` or `description`.
    #[serde(rename = "type")]
    pub point_type: String,
    /// Index within the type. `""` and `"0"` address the same point.
    #[serde(default)]
    pub key: String,
    /// Time the fact was observed. The Unix epoch means "unset".
    #[serde(default = "unset_time")]
    pub time: DateTime<Utc>,
    /// Numeric payload.
    #[serde(default)]
    pub value: f64,
    /// Text payload.
    #[serde(default)]
    pub text: String,
    /// Producer of the point, used to suppress replication echoes.
    #[serde(default)]
    pub origin: String,
}

fn unset_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Point {
    /// Create a numeric point stamped with the current time.
    #[must_use]
    pub fn new(point_type: impl Into<String>, value: f64) -> Self {
        Self {
            point_type: point_type.into(),
            key: String::new(),
            time: Utc::now(),
            value,
            text: String::new(),
            origin: String::new(),
        }
    }

    /// Create a text point stamped with the current time.
    #[must_use]
    pub fn text(point_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::new(point_type, 0.0)
        }
    }

    /// Set the key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Set the observation time.
    #[must_use]
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Set the origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// The merge identity of this point.
    #[must_use]
    pub fn point_key(&self) -> PointKey {
        PointKey::new(&self.point_type, &self.key)
    }

    /// True when the time was never set by the producer.
    #[must_use]
    pub fn has_unset_time(&self) -> bool {
        self.time == DateTime::<Utc>::UNIX_EPOCH
    }

    /// Numeric payload read as a boolean.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        self.value != 0.0
    }

    /// The key read as an array index (`""` is index 0).
    #[must_use]
    pub fn index(&self) -> Option<i64> {
        let key = self.key.trim();
        if key.is_empty() {
            Some(0)
        } else {
            key.parse().ok()
        }
    }
}

/// Encode a boolean the way points carry it.
#[must_use]
pub fn bool_to_value(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

/// Merge identity of a point within its owner.
///
/// The key is normalised so that `""` and `"0"` collide, which lets a
/// scalar point grow into an array without rewriting stored data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PointKey {
    /// Point type.
    pub point_type: String,
    /// Normalised key.
    pub key: String,
}

impl PointKey {
    /// Build a normalised key.
    #[must_use]
    pub fn new(point_type: &str, key: &str) -> Self {
        let key = if key.is_empty() { "0" } else { key };
        Self {
            point_type: point_type.to_string(),
            key: key.to_string(),
        }
    }
}

// =============================================================================
// OWNER
// =============================================================================

/// The thing a point set belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Owner {
    /// A graph node.
    Node(String),
    /// A directed edge `up -> down`.
    Edge {
        /// Parent node ID (or [`ROOT`]).
        up: String,
        /// Child node ID.
        down: String,
    },
}

impl Owner {
    /// Node owner.
    #[must_use]
    pub fn node(id: impl Into<String>) -> Self {
        Self::Node(id.into())
    }

    /// Edge owner.
    #[must_use]
    pub fn edge(up: impl Into<String>, down: impl Into<String>) -> Self {
        Self::Edge {
            up: up.into(),
            down: down.into(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "{id}"),
            Self::Edge { up, down } => write!(f, "{up}->{down}"),
        }
    }
}

// =============================================================================
// NODE EDGE
// =============================================================================

/// A node's point snapshot joined with one specific edge's point snapshot.
///
/// A node with two parents shows up as two `NodeEdge`s that share `id` and
/// `points` but differ in `parent` and `edge_points`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEdge {
    /// Node ID.
    pub id: String,
    /// Parent on this edge ([`ROOT`] for top-level nodes).
    pub parent: String,
    /// Kind, copied from the `nodeType` point (empty when unset).
    pub node_type: String,
    /// Node points ordered by `(Type, Key)`.
    pub points: Vec<Point>,
    /// Edge points ordered by `(Type, Key)`.
    pub edge_points: Vec<Point>,
}

impl NodeEdge {
    /// First node point of the given type.
    #[must_use]
    pub fn point(&self, point_type: &str) -> Option<&Point> {
        self.points.iter().find(|p| p.point_type == point_type)
    }

    /// First edge point of the given type.
    #[must_use]
    pub fn edge_point(&self, point_type: &str) -> Option<&Point> {
        self.edge_points.iter().find(|p| p.point_type == point_type)
    }

    /// Description of the node, falling back to its ID.
    #[must_use]
    pub fn desc(&self) -> String {
        match self.point(point_type::DESCRIPTION) {
            Some(p) if !p.text.is_empty() => p.text.clone(),
            _ => self.id.clone(),
        }
    }

    /// True when this edge carries a truthy tombstone.
    #[must_use]
    pub fn is_tombstoned(&self) -> bool {
        self.edge_point(point_type::TOMBSTONE)
            .is_some_and(Point::is_truthy)
    }
}

/// Kind of a node as recorded in its point set.
#[must_use]
pub fn node_type_of(points: &[Point]) -> String {
    points
        .iter()
        .find(|p| p.point_type == point_type::NODE_TYPE)
        .map(|p| p.text.clone())
        .unwrap_or_default()
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in pointgraph.
///
/// Merge conflicts are not errors: they always resolve by timestamp.
#[derive(Debug, Error)]
pub enum PointGraphError {
    /// The requested owner has never been written.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// The storage backend failed; the whole batch was rejected.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A batch could not be acknowledged by a remote peer after all retries.
    #[error("Propagation to {peer} failed after {attempts} attempts: {last}")]
    Propagation {
        /// Peer that failed.
        peer: String,
        /// Attempts made.
        attempts: u32,
        /// Last transport error.
        last: TransportError,
    },

    /// A client is already registered for this owner.
    #[error("Already registered: {0}")]
    DuplicateRegistration(String),

    /// A background component has shut down.
    #[error("Channel closed: {0}")]
    Closed(String),
}

/// Failure of a single request/acknowledge attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No acknowledgement within the attempt timeout.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// The connection could not be made or broke mid-exchange.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The peer answered but refused the batch.
    #[error("rejected by peer: {0}")]
    Rejected(String),
}

/// Result alias for pointgraph operations.
pub type Result<T, E = PointGraphError> = std::result::Result<T, E>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_zero_keys_collide() {
        let a = Point::new("value", 1.0);
        let b = Point::new("value", 2.0).with_key("0");
        assert_eq!(a.point_key(), b.point_key());
        assert_ne!(a.point_key(), Point::new("value", 2.0).with_key("1").point_key());
    }

    #[test]
    fn point_index_parsing() {
        assert_eq!(Point::new("t", 0.0).index(), Some(0));
        assert_eq!(Point::new("t", 0.0).with_key("3").index(), Some(3));
        assert_eq!(Point::new("t", 0.0).with_key("eth0").index(), None);
    }

    #[test]
    fn json_defaults_leave_time_unset() {
        let p: Point = serde_json::from_str(r#"{"type":"temp","value":21.5}"#).unwrap();
        assert!(p.has_unset_time());
        assert_eq!(p.value, 21.5);
        assert!(p.key.is_empty());
    }

    #[test]
    fn node_edge_desc_falls_back_to_id() {
        let mut ne = NodeEdge {
            id: "n1".to_string(),
            parent: ROOT.to_string(),
            node_type: String::new(),
            points: Vec::new(),
            edge_points: Vec::new(),
        };
        assert_eq!(ne.desc(), "n1");
        ne.points.push(Point::text(point_type::DESCRIPTION, "boiler"));
        assert_eq!(ne.desc(), "boiler");
    }

    #[test]
    fn tombstone_truthiness() {
        let mut ne = NodeEdge {
            id: "n1".to_string(),
            parent: "p".to_string(),
            node_type: String::new(),
            points: Vec::new(),
            edge_points: vec![Point::new(point_type::TOMBSTONE, 0.0)],
        };
        assert!(!ne.is_tombstoned());
        ne.edge_points[0].value = 1.0;
        assert!(ne.is_tombstoned());
    }

    #[test]
    fn owner_display() {
        assert_eq!(Owner::node("a").to_string(), "a");
        assert_eq!(Owner::edge("a", "b").to_string(), "a->b");
    }
}
