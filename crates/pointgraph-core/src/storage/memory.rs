//! In-memory backend.

use super::{PointBackend, StoredEdge, StoredState};
use crate::types::{Owner, Point, PointGraphError, Result};
use std::sync::Mutex;

/// Volatile backend that keeps its state in a mutex.
///
/// Share it through an `Arc` to hand the same state to a second store,
/// which is how tests simulate a reopen without touching disk.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<StoredState>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> PointGraphError {
    PointGraphError::Storage("memory backend lock poisoned".to_string())
}

impl PointBackend for MemoryBackend {
    fn load(&self) -> Result<StoredState> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        Ok(state.clone())
    }

    fn persist(&self, owner: &Owner, new_edge_seq: Option<u64>, points: &[Point]) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let set = match owner {
            Owner::Node(id) => state.nodes.entry(id.clone()).or_default(),
            Owner::Edge { up, down } => {
                let pos = state
                    .edges
                    .iter()
                    .position(|e| &e.up == up && &e.down == down);
                let pos = match (pos, new_edge_seq) {
                    (Some(pos), _) => pos,
                    (None, seq) => {
                        state.edges.push(StoredEdge {
                            up: up.clone(),
                            down: down.clone(),
                            seq: seq.unwrap_or_default(),
                            points: Default::default(),
                        });
                        state.edges.len() - 1
                    }
                };
                &mut state.edges[pos].points
            }
        };
        for point in points {
            set.insert(point.point_key(), point.clone());
        }
        Ok(())
    }

    fn set_root_id(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.root_id = Some(id.to_string());
        Ok(())
    }
}
