//! # Graph Index
//!
//! Bidirectional adjacency over edges, in edge creation order.
//!
//! The index only knows edge identities `(up, down)` and their creation
//! sequence. Points (tombstones, node kinds) are read from the
//! `PointStore` at query time, after the candidate edges have been copied
//! out from under the read lock, so a query never holds the index lock
//! while waiting on an owner.

use crate::points::PointStore;
use crate::types::{ALL, NodeEdge, Owner, PointGraphError, ROOT, Result, node_type_of, point_type};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Adjacency {
    /// Creation sequence -> (up, down)
    by_seq: BTreeMap<u64, (String, String)>,
    /// Parent -> sequences of its child edges
    by_up: HashMap<String, BTreeSet<u64>>,
    /// Child -> sequences of its parent edges
    by_down: HashMap<String, BTreeSet<u64>>,
}

impl Adjacency {
    fn resolve(&self, seqs: impl IntoIterator<Item = u64>) -> Vec<(String, String)> {
        seqs.into_iter()
            .filter_map(|seq| self.by_seq.get(&seq).cloned())
            .collect()
    }
}

/// The directed edge set of the graph.
#[derive(Debug, Default)]
pub struct GraphIndex {
    adjacency: RwLock<Adjacency>,
}

fn poisoned() -> PointGraphError {
    PointGraphError::Storage("graph index lock poisoned".to_string())
}

impl GraphIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edge. Re-inserting a known sequence is a no-op.
    pub fn insert_edge(&self, up: &str, down: &str, seq: u64) -> Result<()> {
        let mut adj = self.adjacency.write().map_err(|_| poisoned())?;
        if adj.by_seq.contains_key(&seq) {
            return Ok(());
        }
        adj.by_seq.insert(seq, (up.to_string(), down.to_string()));
        adj.by_up.entry(up.to_string()).or_default().insert(seq);
        adj.by_down.entry(down.to_string()).or_default().insert(seq);
        Ok(())
    }

    /// Edges matching `(up == parent or parent == "all")` and
    /// `(down == id or id == "all")`, in creation order.
    pub fn candidates(&self, parent: &str, id: &str) -> Result<Vec<(String, String)>> {
        let adj = self.adjacency.read().map_err(|_| poisoned())?;
        let edges = match (parent == ALL, id == ALL) {
            (true, true) => adj.by_seq.values().cloned().collect(),
            (false, true) => adj
                .by_up
                .get(parent)
                .map(|seqs| adj.resolve(seqs.iter().copied()))
                .unwrap_or_default(),
            (true, false) => adj
                .by_down
                .get(id)
                .map(|seqs| adj.resolve(seqs.iter().copied()))
                .unwrap_or_default(),
            (false, false) => adj
                .by_down
                .get(id)
                .map(|seqs| {
                    adj.resolve(seqs.iter().copied())
                        .into_iter()
                        .filter(|(up, _)| up == parent)
                        .collect()
                })
                .unwrap_or_default(),
        };
        Ok(edges)
    }

    fn parents_of(&self, id: &str) -> Result<Vec<String>> {
        let adj = self.adjacency.read().map_err(|_| poisoned())?;
        Ok(adj
            .by_down
            .get(id)
            .map(|seqs| adj.resolve(seqs.iter().copied()))
            .unwrap_or_default()
            .into_iter()
            .map(|(up, _)| up)
            .collect())
    }

    fn edge_deleted(store: &PointStore, up: &str, down: &str) -> Result<bool> {
        let points = store.points_or_empty(&Owner::edge(up, down))?;
        Ok(points
            .iter()
            .any(|p| p.point_type == point_type::TOMBSTONE && p.is_truthy()))
    }

    /// Resolve a hierarchical query into node/edge views.
    ///
    /// `parent` and `id` accept an explicit ID, `"all"`, or `"root"`.
    /// Tombstoned edges are skipped unless `include_deleted`. A non-empty
    /// `type_filter` keeps only nodes of that kind. Results follow edge
    /// creation order.
    pub fn get_nodes(
        &self,
        store: &PointStore,
        parent: &str,
        id: &str,
        type_filter: &str,
        include_deleted: bool,
    ) -> Result<Vec<NodeEdge>> {
        let mut nodes = Vec::new();
        for (up, down) in self.candidates(parent, id)? {
            let edge_points = store.points_or_empty(&Owner::edge(up.clone(), down.clone()))?;
            let deleted = edge_points
                .iter()
                .any(|p| p.point_type == point_type::TOMBSTONE && p.is_truthy());
            if deleted && !include_deleted {
                continue;
            }

            let points = store.points_or_empty(&Owner::node(down.clone()))?;
            let mut kind = node_type_of(&points);
            if kind.is_empty() {
                kind = node_type_of(&edge_points);
            }
            if !type_filter.is_empty() && kind != type_filter {
                continue;
            }

            nodes.push(NodeEdge {
                id: down,
                parent: up,
                node_type: kind,
                points,
                edge_points,
            });
        }
        Ok(nodes)
    }

    /// Ancestors of `node_id`, nearest first.
    ///
    /// Every parent path is followed: the walk is breadth-first, each
    /// ancestor appears once, and parents of one level keep edge creation
    /// order. The `"root"` sentinel is included when reached. Tombstoned
    /// edges are not followed unless `include_deleted`.
    pub fn up(&self, store: &PointStore, node_id: &str, include_deleted: bool) -> Result<Vec<String>> {
        if self.parents_of(node_id)?.is_empty() && !store.contains(&Owner::node(node_id))? {
            return Err(PointGraphError::NotFound(node_id.to_string()));
        }

        let mut ancestors = Vec::new();
        let mut seen: HashSet<String> = HashSet::from([node_id.to_string()]);
        let mut frontier = vec![node_id.to_string()];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for child in &frontier {
                for up in self.parents_of(child)? {
                    if !include_deleted && Self::edge_deleted(store, &up, child)? {
                        continue;
                    }
                    if seen.insert(up.clone()) {
                        ancestors.push(up.clone());
                        if up != ROOT {
                            next.push(up);
                        }
                    }
                }
            }
            frontier = next;
        }
        Ok(ancestors)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use crate::types::{Point, node_type};
    use chrono::{DateTime, Duration, Utc};
    use std::cell::Cell;
    use std::sync::Arc;

    struct Fixture {
        store: PointStore,
        graph: GraphIndex,
        clock: Cell<i64>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: PointStore::load(Arc::new(MemoryBackend::new())).unwrap().0,
                graph: GraphIndex::new(),
                clock: Cell::new(0),
            }
        }

        /// Strictly increasing timestamps so every write wins its merge.
        fn tick(&self) -> DateTime<Utc> {
            self.clock.set(self.clock.get() + 1);
            DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(self.clock.get())
        }

        fn edge(&self, up: &str, down: &str, points: Vec<Point>) {
            let now = self.tick();
            let points = points.into_iter().map(|p| p.at(now)).collect();
            let graph = &self.graph;
            self.store
                .upsert_points(&Owner::edge(up, down), points, |r| {
                    if let (Some(seq), Owner::Edge { up, down }) = (r.new_edge_seq, r.owner) {
                        graph.insert_edge(up, down, seq).unwrap();
                    }
                })
                .unwrap();
        }

        fn attach(&self, up: &str, down: &str) {
            self.edge(up, down, vec![Point::new(point_type::TOMBSTONE, 0.0)]);
        }

        fn node(&self, id: &str, kind: &str) {
            self.store
                .upsert_points(
                    &Owner::node(id),
                    vec![Point::text(point_type::NODE_TYPE, kind).at(self.tick())],
                    |_| {},
                )
                .unwrap();
        }

        fn ids(&self, parent: &str, id: &str, filter: &str, deleted: bool) -> Vec<String> {
            self.graph
                .get_nodes(&self.store, parent, id, filter, deleted)
                .unwrap()
                .into_iter()
                .map(|ne| format!("{}/{}", ne.parent, ne.id))
                .collect()
        }
    }

    #[test]
    fn wildcard_parent_returns_every_parent_edge() {
        let f = Fixture::new();
        f.attach("g1", "x");
        f.attach("g2", "x");
        f.attach("g1", "y");
        assert_eq!(f.ids(ALL, "x", "", false), vec!["g1/x", "g2/x"]);
    }

    #[test]
    fn wildcard_child_returns_every_child_edge() {
        let f = Fixture::new();
        f.attach("g1", "x");
        f.attach("g2", "x");
        f.attach("g1", "y");
        assert_eq!(f.ids("g1", ALL, "", false), vec!["g1/x", "g1/y"]);
    }

    #[test]
    fn results_follow_creation_order_not_id_order() {
        let f = Fixture::new();
        f.attach("p", "zeta");
        f.attach("p", "alpha");
        f.attach("p", "mid");
        assert_eq!(f.ids("p", ALL, "", false), vec!["p/zeta", "p/alpha", "p/mid"]);
        assert_eq!(f.ids(ALL, ALL, "", false).len(), 3);
    }

    #[test]
    fn root_sentinel_lists_top_level_nodes() {
        let f = Fixture::new();
        f.attach(ROOT, "dev");
        f.attach("dev", "sensor");
        assert_eq!(f.ids(ROOT, ALL, "", false), vec!["root/dev"]);
    }

    #[test]
    fn tombstone_hides_and_restores_edge() {
        let f = Fixture::new();
        f.attach("parent", "child");
        f.edge("parent", "child", vec![Point::new(point_type::TOMBSTONE, 1.0)]);
        assert!(f.ids("parent", "child", "", false).is_empty());
        assert_eq!(f.ids("parent", "child", "", true), vec!["parent/child"]);

        f.edge("parent", "child", vec![Point::new(point_type::TOMBSTONE, 0.0)]);
        assert_eq!(f.ids("parent", "child", "", false), vec!["parent/child"]);
    }

    #[test]
    fn tombstone_on_one_parent_keeps_other() {
        let f = Fixture::new();
        f.attach("a", "x");
        f.attach("b", "x");
        f.edge("a", "x", vec![Point::new(point_type::TOMBSTONE, 1.0)]);
        assert_eq!(f.ids(ALL, "x", "", false), vec!["b/x"]);
    }

    #[test]
    fn type_filter_uses_node_kind() {
        let f = Fixture::new();
        f.attach("p", "r1");
        f.attach("p", "d1");
        f.node("r1", node_type::RULE);
        f.node("d1", node_type::DEVICE);
        assert_eq!(f.ids("p", ALL, node_type::RULE, false), vec!["p/r1"]);
    }

    #[test]
    fn kind_falls_back_to_edge_point() {
        let f = Fixture::new();
        f.edge(
            "p",
            "g",
            vec![
                Point::new(point_type::TOMBSTONE, 0.0),
                Point::text(point_type::NODE_TYPE, node_type::GROUP),
            ],
        );
        let nodes = f.graph.get_nodes(&f.store, "p", ALL, node_type::GROUP, false).unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].points.is_empty());
    }

    #[test]
    fn up_walks_all_paths_breadth_first() {
        let f = Fixture::new();
        f.attach(ROOT, "site");
        f.attach("site", "g1");
        f.attach("site", "g2");
        f.attach("g1", "leaf");
        f.attach("g2", "leaf");
        let ups = f.graph.up(&f.store, "leaf", false).unwrap();
        assert_eq!(ups, vec!["g1", "g2", "site", ROOT]);
    }

    #[test]
    fn up_of_top_level_node_is_root() {
        let f = Fixture::new();
        f.attach(ROOT, "dev");
        assert_eq!(f.graph.up(&f.store, "dev", false).unwrap(), vec![ROOT]);
    }

    #[test]
    fn up_skips_deleted_edges_unless_asked() {
        let f = Fixture::new();
        f.attach(ROOT, "a");
        f.attach("a", "leaf");
        f.attach(ROOT, "b");
        f.attach("b", "leaf");
        f.edge("a", "leaf", vec![Point::new(point_type::TOMBSTONE, 1.0)]);
        assert_eq!(f.graph.up(&f.store, "leaf", false).unwrap(), vec!["b", ROOT]);
        assert_eq!(
            f.graph.up(&f.store, "leaf", true).unwrap(),
            vec!["a", "b", ROOT]
        );
    }

    #[test]
    fn up_tolerates_cycles() {
        let f = Fixture::new();
        f.attach("a", "b");
        f.attach("b", "a");
        assert_eq!(f.graph.up(&f.store, "a", false).unwrap(), vec!["b"]);
    }

    #[test]
    fn up_of_unknown_node_is_not_found() {
        let f = Fixture::new();
        let err = f.graph.up(&f.store, "ghost", false).unwrap_err();
        assert!(matches!(err, PointGraphError::NotFound(_)));
    }
}
