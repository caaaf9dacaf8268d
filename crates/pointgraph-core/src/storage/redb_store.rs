//! # redb-backed Point Storage
//!
//! A disk-backed point store using the redb embedded database.
//!
//! Layout:
//! - `node_points`: `(node, type, key)` -> encoded point
//! - `edge_points`: `(up, down, type, key)` -> encoded point
//! - `edges`: `(up, down)` -> creation sequence
//! - `metadata`: string settings (`root_id`)
//!
//! Keys use the normalised point key, so a second write to the same
//! `(Type, Key)` overwrites the row. One `persist` call is one redb write
//! transaction: a failed commit leaves nothing behind.

use super::{PointBackend, StoredEdge, StoredState};
use crate::types::{Owner, Point, PointGraphError, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Table for node points: (node_id, type, key) -> encoded `StoredPoint`
const NODE_POINTS: TableDefinition<(&str, &str, &str), &[u8]> =
    TableDefinition::new("node_points");

/// Table for edge points: (up, down, type, key) -> encoded `StoredPoint`
const EDGE_POINTS: TableDefinition<(&str, &str, &str, &str), &[u8]> =
    TableDefinition::new("edge_points");

/// Table for edges: (up, down) -> creation sequence
const EDGES: TableDefinition<(&str, &str), u64> = TableDefinition::new("edges");

/// Table for metadata: key string -> value string
const METADATA: TableDefinition<&str, &str> = TableDefinition::new("metadata");

const ROOT_ID_KEY: &str = "root_id";

/// On-disk row. Type and normalised key live in the table key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredPoint {
    key: String,
    time_secs: i64,
    time_subsec_nanos: u32,
    value: f64,
    text: String,
    origin: String,
}

impl StoredPoint {
    fn encode(point: &Point) -> Result<Vec<u8>> {
        let row = Self {
            key: point.key.clone(),
            time_secs: point.time.timestamp(),
            time_subsec_nanos: point.time.timestamp_subsec_nanos(),
            value: point.value,
            text: point.text.clone(),
            origin: point.origin.clone(),
        };
        postcard::to_allocvec(&row).map_err(|e| PointGraphError::Serialization(e.to_string()))
    }

    fn decode(point_type: &str, bytes: &[u8]) -> Result<Point> {
        let row: Self = postcard::from_bytes(bytes)
            .map_err(|e| PointGraphError::Serialization(e.to_string()))?;
        let time = DateTime::<Utc>::from_timestamp(row.time_secs, row.time_subsec_nanos)
            .ok_or_else(|| {
                PointGraphError::Serialization(format!(
                    "time out of range: {}s {}ns",
                    row.time_secs, row.time_subsec_nanos
                ))
            })?;
        Ok(Point {
            point_type: point_type.to_string(),
            key: row.key,
            time,
            value: row.value,
            text: row.text,
            origin: row.origin,
        })
    }
}

fn storage_err(e: impl std::fmt::Display) -> PointGraphError {
    PointGraphError::Storage(e.to_string())
}

/// A disk-backed point store using redb.
pub struct RedbBackend {
    db: Database,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend").finish_non_exhaustive()
    }
}

impl RedbBackend {
    /// Open or create a point database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(|e| PointGraphError::Io(e.to_string()))?;

        // Initialize tables if they don't exist
        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            write_txn.open_table(NODE_POINTS).map_err(storage_err)?;
            write_txn.open_table(EDGE_POINTS).map_err(storage_err)?;
            write_txn.open_table(EDGES).map_err(storage_err)?;
            write_txn.open_table(METADATA).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;

        Ok(Self { db })
    }
}

impl PointBackend for RedbBackend {
    fn load(&self) -> Result<StoredState> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;

        let root_id = {
            let table = read_txn.open_table(METADATA).map_err(storage_err)?;
            table
                .get(ROOT_ID_KEY)
                .map_err(storage_err)?
                .map(|v| v.value().to_string())
        };

        let mut nodes: BTreeMap<String, crate::merge::PointSet> = BTreeMap::new();
        {
            let table = read_txn.open_table(NODE_POINTS).map_err(storage_err)?;
            for entry in table.iter().map_err(storage_err)? {
                let (key, value) = entry.map_err(storage_err)?;
                let (node_id, point_type, _) = key.value();
                let point = StoredPoint::decode(point_type, value.value())?;
                nodes
                    .entry(node_id.to_string())
                    .or_default()
                    .insert(point.point_key(), point);
            }
        }

        let mut edges: BTreeMap<(String, String), StoredEdge> = BTreeMap::new();
        {
            let table = read_txn.open_table(EDGES).map_err(storage_err)?;
            for entry in table.iter().map_err(storage_err)? {
                let (key, value) = entry.map_err(storage_err)?;
                let (up, down) = key.value();
                edges.insert(
                    (up.to_string(), down.to_string()),
                    StoredEdge {
                        up: up.to_string(),
                        down: down.to_string(),
                        seq: value.value(),
                        points: Default::default(),
                    },
                );
            }
        }
        {
            let table = read_txn.open_table(EDGE_POINTS).map_err(storage_err)?;
            for entry in table.iter().map_err(storage_err)? {
                let (key, value) = entry.map_err(storage_err)?;
                let (up, down, point_type, _) = key.value();
                let point = StoredPoint::decode(point_type, value.value())?;
                if let Some(edge) = edges.get_mut(&(up.to_string(), down.to_string())) {
                    edge.points.insert(point.point_key(), point);
                } else {
                    tracing::warn!(up, down, "edge points without edge row, skipping");
                }
            }
        }

        let mut edges: Vec<StoredEdge> = edges.into_values().collect();
        edges.sort_by_key(|e| e.seq);

        Ok(StoredState {
            root_id,
            nodes,
            edges,
        })
    }

    fn persist(&self, owner: &Owner, new_edge_seq: Option<u64>, points: &[Point]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            match owner {
                Owner::Node(id) => {
                    let mut table = write_txn.open_table(NODE_POINTS).map_err(storage_err)?;
                    for point in points {
                        let pk = point.point_key();
                        let bytes = StoredPoint::encode(point)?;
                        table
                            .insert(
                                (id.as_str(), pk.point_type.as_str(), pk.key.as_str()),
                                bytes.as_slice(),
                            )
                            .map_err(storage_err)?;
                    }
                }
                Owner::Edge { up, down } => {
                    if let Some(seq) = new_edge_seq {
                        let mut edges = write_txn.open_table(EDGES).map_err(storage_err)?;
                        edges
                            .insert((up.as_str(), down.as_str()), seq)
                            .map_err(storage_err)?;
                    }
                    let mut table = write_txn.open_table(EDGE_POINTS).map_err(storage_err)?;
                    for point in points {
                        let pk = point.point_key();
                        let bytes = StoredPoint::encode(point)?;
                        table
                            .insert(
                                (
                                    up.as_str(),
                                    down.as_str(),
                                    pk.point_type.as_str(),
                                    pk.key.as_str(),
                                ),
                                bytes.as_slice(),
                            )
                            .map_err(storage_err)?;
                    }
                }
            }
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn set_root_id(&self, id: &str) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(METADATA).map_err(storage_err)?;
            table.insert(ROOT_ID_KEY, id).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }
}
