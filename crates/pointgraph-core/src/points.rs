//! # Point Store
//!
//! The durable merge engine. Every owner (node or edge) has its own slot:
//! a mutex around its latest `PointSet`. Writes to one owner queue on that
//! mutex, writes to different owners run in parallel.
//!
//! A write merges against a copy of the slot, persists the winners, and
//! only then swaps the copy in. A backend failure therefore leaves both
//! disk and memory exactly as they were.

use crate::merge::{PointSet, merge_points, snapshot, stamp_unset};
use crate::storage::{PointBackend, StoredState};
use crate::types::{Owner, Point, PointGraphError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

type Slot = Arc<Mutex<PointSet>>;

/// What a successful write changed, handed to the caller's hook while the
/// owner is still locked.
#[derive(Debug)]
pub struct ApplyReport<'a> {
    /// Owner written.
    pub owner: &'a Owner,
    /// Points that won the merge.
    pub applied: &'a [Point],
    /// Creation sequence when this write created an edge.
    pub new_edge_seq: Option<u64>,
}

/// Per-owner last-write-wins point storage.
pub struct PointStore {
    backend: Arc<dyn PointBackend>,
    slots: RwLock<HashMap<Owner, Slot>>,
    next_edge_seq: AtomicU64,
}

impl std::fmt::Debug for PointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointStore")
            .field("backend", &self.backend)
            .field("next_edge_seq", &self.next_edge_seq.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn poisoned(what: &str) -> PointGraphError {
    PointGraphError::Storage(format!("{what} lock poisoned"))
}

impl PointStore {
    /// Build a store from a backend's persisted state.
    ///
    /// Returns the store together with the loaded state so the caller can
    /// rebuild its indexes from the same snapshot.
    pub fn load(backend: Arc<dyn PointBackend>) -> Result<(Self, StoredState)> {
        let state = backend.load()?;

        let mut slots: HashMap<Owner, Slot> = HashMap::new();
        for (id, set) in &state.nodes {
            slots.insert(Owner::node(id.clone()), Arc::new(Mutex::new(set.clone())));
        }
        let mut next_edge_seq = 0;
        for edge in &state.edges {
            slots.insert(
                Owner::edge(edge.up.clone(), edge.down.clone()),
                Arc::new(Mutex::new(edge.points.clone())),
            );
            next_edge_seq = next_edge_seq.max(edge.seq.saturating_add(1));
        }

        let store = Self {
            backend,
            slots: RwLock::new(slots),
            next_edge_seq: AtomicU64::new(next_edge_seq),
        };
        Ok((store, state))
    }

    /// The backend this store persists to.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn PointBackend> {
        &self.backend
    }

    fn slot(&self, owner: &Owner) -> Result<Slot> {
        {
            let slots = self.slots.read().map_err(|_| poisoned("slot table"))?;
            if let Some(slot) = slots.get(owner) {
                return Ok(Arc::clone(slot));
            }
        }
        let mut slots = self.slots.write().map_err(|_| poisoned("slot table"))?;
        Ok(Arc::clone(slots.entry(owner.clone()).or_default()))
    }

    fn existing_slot(&self, owner: &Owner) -> Result<Option<Slot>> {
        let slots = self.slots.read().map_err(|_| poisoned("slot table"))?;
        Ok(slots.get(owner).map(Arc::clone))
    }

    /// Merge a batch into `owner`, creating the owner if unknown.
    ///
    /// Points with an unset time are stamped with the current time. Each
    /// point is applied iff strictly newer than the stored point with the
    /// same `(Type, Key)`. The winners are persisted in one backend call;
    /// on failure nothing is applied and the error is returned.
    ///
    /// `on_applied` runs after the commit, still under the owner lock, and
    /// only when at least one point was applied. It must not block.
    pub fn upsert_points<F>(&self, owner: &Owner, mut points: Vec<Point>, on_applied: F) -> Result<Vec<Point>>
    where
        F: FnOnce(&ApplyReport<'_>),
    {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        stamp_unset(&mut points, Utc::now());

        let slot = self.slot(owner)?;
        let mut current = slot.lock().map_err(|_| poisoned("owner"))?;

        let was_empty = current.is_empty();
        let mut merged = current.clone();
        let applied = merge_points(&mut merged, &points);
        if applied.is_empty() {
            tracing::trace!(owner = %owner, "batch fully stale");
            return Ok(applied);
        }

        let new_edge_seq = match owner {
            Owner::Edge { .. } if was_empty => {
                Some(self.next_edge_seq.fetch_add(1, Ordering::SeqCst))
            }
            _ => None,
        };

        if let Err(e) = self.backend.persist(owner, new_edge_seq, &applied) {
            tracing::error!(owner = %owner, error = %e, "batch rejected by storage");
            return Err(e);
        }
        *current = merged;

        on_applied(&ApplyReport {
            owner,
            applied: &applied,
            new_edge_seq,
        });
        Ok(applied)
    }

    /// Snapshot of an owner's points ordered by `(Type, Key)`.
    pub fn get_points(&self, owner: &Owner) -> Result<Vec<Point>> {
        let slot = self
            .existing_slot(owner)?
            .ok_or_else(|| PointGraphError::NotFound(owner.to_string()))?;
        let current = slot.lock().map_err(|_| poisoned("owner"))?;
        if current.is_empty() {
            return Err(PointGraphError::NotFound(owner.to_string()));
        }
        Ok(snapshot(&current))
    }

    /// Like `get_points`, but an unknown owner yields an empty snapshot.
    pub fn points_or_empty(&self, owner: &Owner) -> Result<Vec<Point>> {
        match self.get_points(owner) {
            Err(PointGraphError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    /// True when the owner holds at least one point.
    pub fn contains(&self, owner: &Owner) -> Result<bool> {
        match self.existing_slot(owner)? {
            Some(slot) => Ok(!slot.lock().map_err(|_| poisoned("owner"))?.is_empty()),
            None => Ok(false),
        }
    }

    /// Every owner holding points, nodes first, each group sorted.
    pub fn owners(&self) -> Result<Vec<Owner>> {
        let slots: Vec<(Owner, Slot)> = {
            let slots = self.slots.read().map_err(|_| poisoned("slot table"))?;
            slots
                .iter()
                .map(|(owner, slot)| (owner.clone(), Arc::clone(slot)))
                .collect()
        };
        let mut owners = Vec::with_capacity(slots.len());
        for (owner, slot) in slots {
            if !slot.lock().map_err(|_| poisoned("owner"))?.is_empty() {
                owners.push(owner);
            }
        }
        owners.sort();
        Ok(owners)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, StoredState};
    use chrono::{DateTime, Duration};
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn at(point_type: &str, value: f64, secs: i64) -> Point {
        Point::new(point_type, value).at(DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs))
    }

    fn memory_store() -> PointStore {
        PointStore::load(Arc::new(MemoryBackend::new())).unwrap().0
    }

    /// Backend that fails every persist while `fail` is set.
    #[derive(Debug, Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail: AtomicBool,
    }

    impl PointBackend for FlakyBackend {
        fn load(&self) -> Result<StoredState> {
            self.inner.load()
        }

        fn persist(&self, owner: &Owner, seq: Option<u64>, points: &[Point]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PointGraphError::Storage("disk full".to_string()));
            }
            self.inner.persist(owner, seq, points)
        }

        fn set_root_id(&self, id: &str) -> Result<()> {
            self.inner.set_root_id(id)
        }
    }

    #[test]
    fn write_creates_unknown_owner() {
        let store = memory_store();
        let owner = Owner::node("n1");
        assert!(!store.contains(&owner).unwrap());
        store
            .upsert_points(&owner, vec![at("temp", 20.0, 1)], |_| {})
            .unwrap();
        assert!(store.contains(&owner).unwrap());
        assert_eq!(store.get_points(&owner).unwrap().len(), 1);
    }

    #[test]
    fn read_of_unknown_owner_is_not_found() {
        let store = memory_store();
        let err = store.get_points(&Owner::node("ghost")).unwrap_err();
        assert!(matches!(err, PointGraphError::NotFound(_)));
        assert!(store.points_or_empty(&Owner::node("ghost")).unwrap().is_empty());
    }

    #[test]
    fn identical_batch_twice_is_idempotent() {
        let store = memory_store();
        let owner = Owner::node("n1");
        let batch = vec![at("temp", 20.0, 1), at("hum", 40.0, 1)];
        let first = store.upsert_points(&owner, batch.clone(), |_| {}).unwrap();
        let before = store.get_points(&owner).unwrap();
        let second = store.upsert_points(&owner, batch, |_| {}).unwrap();
        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(store.get_points(&owner).unwrap(), before);
    }

    #[test]
    fn stale_point_does_not_fire_hook() {
        let store = memory_store();
        let owner = Owner::node("n1");
        store.upsert_points(&owner, vec![at("temp", 20.0, 10)], |_| {}).unwrap();
        let mut fired = false;
        store
            .upsert_points(&owner, vec![at("temp", 5.0, 5)], |_| fired = true)
            .unwrap();
        assert!(!fired);
        assert_eq!(store.get_points(&owner).unwrap()[0].value, 20.0);
    }

    #[test]
    fn first_edge_write_gets_sequence() {
        let store = memory_store();
        let mut seqs = Vec::new();
        for (up, down) in [("a", "b"), ("a", "c"), ("a", "b")] {
            store
                .upsert_points(&Owner::edge(up, down), vec![Point::new("tombstone", 0.0)], |r| {
                    seqs.push(r.new_edge_seq);
                })
                .unwrap();
        }
        assert_eq!(seqs, vec![Some(0), Some(1), None]);
    }

    #[test]
    fn storage_failure_rejects_whole_batch() {
        let backend = Arc::new(FlakyBackend::default());
        let (store, _) = PointStore::load(Arc::clone(&backend) as Arc<dyn PointBackend>).unwrap();
        let owner = Owner::node("n1");
        store.upsert_points(&owner, vec![at("a", 1.0, 1)], |_| {}).unwrap();

        backend.fail.store(true, Ordering::SeqCst);
        let err = store
            .upsert_points(&owner, vec![at("a", 2.0, 2), at("b", 2.0, 2)], |_| {})
            .unwrap_err();
        assert!(matches!(err, PointGraphError::Storage(_)));

        let points = store.get_points(&owner).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 1.0);

        backend.fail.store(false, Ordering::SeqCst);
        let applied = store
            .upsert_points(&owner, vec![at("a", 2.0, 2), at("b", 2.0, 2)], |_| {})
            .unwrap();
        assert_eq!(applied.len(), 2);
    }

    #[test]
    fn concurrent_writers_on_distinct_owners() {
        let store = Arc::new(memory_store());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let owner = Owner::node(format!("n{i}"));
                    for t in 0..50 {
                        store
                            .upsert_points(&owner, vec![at("v", t as f64, t)], |_| {})
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..8 {
            let points = store.get_points(&Owner::node(format!("n{i}"))).unwrap();
            assert_eq!(points[0].value, 49.0);
        }
    }

    #[test]
    fn concurrent_writers_on_same_owner_keep_newest() {
        let store = Arc::new(memory_store());
        let owner = Owner::node("shared");
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                let owner = owner.clone();
                thread::spawn(move || {
                    for t in 0..100 {
                        let secs = t * 4 + i;
                        store
                            .upsert_points(&owner, vec![at("v", secs as f64, secs)], |_| {})
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get_points(&owner).unwrap()[0].value, 399.0);
    }

    #[test]
    fn reload_restores_points_and_sequence() {
        let backend: Arc<dyn PointBackend> = Arc::new(MemoryBackend::new());
        {
            let (store, _) = PointStore::load(Arc::clone(&backend)).unwrap();
            store
                .upsert_points(&Owner::edge("root", "a"), vec![Point::new("tombstone", 0.0)], |_| {})
                .unwrap();
            store
                .upsert_points(&Owner::node("a"), vec![at("temp", 3.0, 3)], |_| {})
                .unwrap();
        }
        let (store, state) = PointStore::load(backend).unwrap();
        assert_eq!(state.edges.len(), 1);
        assert_eq!(store.get_points(&Owner::node("a")).unwrap()[0].value, 3.0);
        let mut seq = None;
        store
            .upsert_points(&Owner::edge("a", "b"), vec![Point::new("tombstone", 0.0)], |r| {
                seq = r.new_edge_seq;
            })
            .unwrap();
        assert_eq!(seq, Some(1));
    }

    #[test]
    fn owners_lists_nodes_before_edges() {
        let store = memory_store();
        store
            .upsert_points(&Owner::edge("root", "b"), vec![Point::new("tombstone", 0.0)], |_| {})
            .unwrap();
        store.upsert_points(&Owner::node("b"), vec![Point::new("v", 1.0)], |_| {}).unwrap();
        store.upsert_points(&Owner::node("a"), vec![Point::new("v", 1.0)], |_| {}).unwrap();
        let owners = store.owners().unwrap();
        assert_eq!(
            owners,
            vec![Owner::node("a"), Owner::node("b"), Owner::edge("root", "b")]
        );
    }
}
