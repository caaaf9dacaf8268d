//! # Store Tier Tests
//!
//! ## Tiers
//! - T0: Ingress and merge
//! - T1: Hierarchical queries
//! - T2: Reactive rules, end to end
//! - T3: Reopen durability

use pointgraph_core::{
    ALL, Db, DbConfig, Owner, Point, PointGraphError, ROOT, RuleEngine, Topic, node_type,
    point_type,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn memory_db() -> Db {
    Db::in_memory(DbConfig::default()).expect("in-memory db")
}

fn attach(db: &Db, parent: &str, id: &str, kind: &str, mut points: Vec<Point>) {
    db.submit_edge_points(parent, id, vec![Point::new(point_type::TOMBSTONE, 0.0)])
        .expect("edge");
    points.push(Point::text(point_type::NODE_TYPE, kind));
    db.submit_points(id, points).expect("node");
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn at(ty: &str, value: f64, secs: i64) -> Point {
    Point::new(ty, value).at(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(secs))
}

fn point_value(db: &Db, node: &str, ty: &str) -> Option<f64> {
    db.get_points(&Owner::node(node))
        .ok()?
        .into_iter()
        .find(|p| p.point_type == ty)
        .map(|p| p.value)
}

// =============================================================================
// TIER T0: INGRESS AND MERGE
// =============================================================================

mod t0_ingress {
    use super::*;

    /// T0.1: Unknown point types are stored opaquely.
    #[test]
    fn unknown_point_types_are_accepted() {
        let db = memory_db();
        db.submit_points("n1", vec![Point::text("firmwareBlob", "abc")])
            .expect("submit");
        let points = db.get_points(&Owner::node("n1")).expect("points");
        assert_eq!(points[0].text, "abc");
    }

    /// T0.2: Unknown owners are NotFound.
    #[test]
    fn unknown_owner_is_not_found() {
        let db = memory_db();
        assert!(matches!(
            db.get_points(&Owner::node("ghost")),
            Err(PointGraphError::NotFound(_))
        ));
    }

    /// T0.3: Equal-time writes are no-ops and emit nothing.
    #[test]
    fn equal_time_write_is_silent() {
        let db = memory_db();
        let sub = db.subscribe(Topic::Owner(Owner::node("n1"))).expect("subscribe");
        let p = Point::new("temp", 1.0);
        db.submit_points("n1", vec![p.clone()]).expect("first");
        let applied = db
            .submit_points("n1", vec![Point { value: 99.0, ..p }])
            .expect("second");
        assert!(applied.is_empty());
        assert!(sub.recv_timeout(WAIT).expect("recv").is_some());
        assert!(sub.recv_timeout(Duration::from_millis(50)).expect("recv").is_none());
        assert_eq!(point_value(&db, "n1", "temp"), Some(1.0));
    }

    /// T0.4: Per-owner event order follows apply order under concurrency.
    #[test]
    fn per_owner_order_is_preserved() {
        let db = Arc::new(memory_db());
        let sub = db
            .subscribe_lossless(Topic::Owner(Owner::node("hot")))
            .expect("subscribe");

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    for i in 0..50 {
                        let owner = if w == 0 { "hot".to_string() } else { format!("cold{w}") };
                        db.submit_points(&owner, vec![at("seq", f64::from(i), i64::from(i) + 1)])
                            .expect("submit");
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().expect("writer");
        }

        let mut last = -1.0;
        for _ in 0..50 {
            let ev = sub.recv_timeout(WAIT).expect("recv").expect("event");
            let v = ev.points[0].value;
            assert!(v > last, "event {v} after {last}");
            last = v;
        }
    }
}

// =============================================================================
// TIER T1: HIERARCHICAL QUERIES
// =============================================================================

mod t1_queries {
    use super::*;

    /// T1.1: The root sentinel lists the store's root device.
    #[test]
    fn root_query_returns_root_node() {
        let db = memory_db();
        let nodes = db.get_nodes(ROOT, ALL, "", false).expect("nodes");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, db.root_id());
        assert_eq!(db.up(db.root_id(), false).expect("up"), vec![ROOT]);
    }

    /// T1.2: A node with two parents appears once per edge.
    #[test]
    fn multi_parent_node_appears_per_edge() {
        let db = memory_db();
        let root = db.root_id().to_string();
        attach(&db, &root, "g1", node_type::GROUP, vec![]);
        attach(&db, &root, "g2", node_type::GROUP, vec![]);
        attach(&db, "g1", "dev", node_type::DEVICE, vec![]);
        attach(&db, "g2", "dev", node_type::DEVICE, vec![]);

        let edges = db.get_nodes(ALL, "dev", "", false).expect("nodes");
        let parents: Vec<_> = edges.iter().map(|e| e.parent.as_str()).collect();
        assert_eq!(parents, vec!["g1", "g2"]);
        assert_eq!(edges[0].points, edges[1].points);

        let ups = db.up("dev", false).expect("up");
        assert_eq!(ups, vec!["g1".to_string(), "g2".to_string(), root, ROOT.to_string()]);
    }

    /// T1.3: Deletion is a reversible tombstone.
    #[test]
    fn tombstone_is_reversible() {
        let db = memory_db();
        let root = db.root_id().to_string();
        attach(&db, &root, "dev", node_type::DEVICE, vec![]);

        db.submit_edge_points(&root, "dev", vec![Point::new(point_type::TOMBSTONE, 1.0)])
            .expect("delete");
        assert!(db.children(&root, "").expect("children").is_empty());
        assert_eq!(db.get_nodes(&root, ALL, "", true).expect("deleted").len(), 1);
        assert!(db.get_points(&Owner::node("dev")).is_ok());

        db.submit_edge_points(&root, "dev", vec![Point::new(point_type::TOMBSTONE, 0.0)])
            .expect("restore");
        assert_eq!(db.children(&root, "").expect("children").len(), 1);
    }

    /// T1.4: Type filter selects by node kind.
    #[test]
    fn type_filter() {
        let db = memory_db();
        let root = db.root_id().to_string();
        attach(&db, &root, "r", node_type::RULE, vec![]);
        attach(&db, &root, "u", node_type::USER, vec![]);
        let rules = db.get_nodes(ALL, ALL, node_type::RULE, false).expect("rules");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "r");
    }
}

// =============================================================================
// TIER T2: REACTIVE RULES
// =============================================================================

mod t2_rules {
    use super::*;

    fn threshold_rule(db: &Db) {
        threshold_rule_setting(db, "alarm", "alarm", 1.0);
    }

    /// `temp > 30` on any node sets `target.ty = value`.
    fn threshold_rule_setting(db: &Db, target: &str, ty: &str, value: f64) {
        let root = db.root_id().to_string();
        attach(db, &root, "sensor", node_type::DEVICE, vec![]);
        attach(db, &root, "alarm", node_type::DEVICE, vec![]);
        attach(
            db,
            &root,
            "rule",
            node_type::RULE,
            vec![Point::text(point_type::DESCRIPTION, "Too hot")],
        );
        attach(
            db,
            "rule",
            "cond",
            node_type::CONDITION,
            vec![
                Point::text(point_type::POINT_TYPE, "temp"),
                Point::text(point_type::VALUE_TYPE, "number"),
                Point::text(point_type::OPERATOR, ">"),
                Point::new(point_type::VALUE, 30.0),
            ],
        );
        attach(
            db,
            "rule",
            "act",
            node_type::ACTION,
            vec![
                Point::text(point_type::ACTION, "setValue"),
                Point::text(point_type::NODE_ID, target),
                Point::text(point_type::POINT_TYPE, ty),
                Point::new(point_type::VALUE, value),
            ],
        );
    }

    /// T2.1: temp 25 -> nothing; 35 -> latch, activation, alarm; 20 -> release.
    #[test]
    fn threshold_scenario_end_to_end() {
        let db = Arc::new(memory_db());
        threshold_rule(&db);
        let engine = RuleEngine::start(Arc::clone(&db)).expect("engine");
        let alarm = db
            .subscribe_lossless(Topic::Owner(Owner::node("alarm")))
            .expect("subscribe");

        db.submit_points("sensor", vec![Point::new("temp", 25.0)]).expect("25");
        wait_until("temp 25 evaluated", || engine.stats().events_evaluated >= 1);
        assert_eq!(engine.stats().active_writes, 0);
        assert_eq!(engine.stats().actions_run, 0);

        db.submit_points("sensor", vec![Point::new("temp", 35.0)]).expect("35");
        let ev = alarm.recv_timeout(WAIT).expect("recv").expect("alarm write");
        assert_eq!(ev.points[0].point_type, "alarm");
        assert_eq!(ev.points[0].value, 1.0);
        assert_eq!(point_value(&db, "cond", point_type::ACTIVE), Some(1.0));
        assert_eq!(point_value(&db, "rule", point_type::ACTIVE), Some(1.0));
        assert_eq!(engine.stats().active_writes, 2);
        wait_until("action counted", || engine.stats().actions_run == 1);

        db.submit_points("sensor", vec![Point::new("temp", 20.0)]).expect("20");
        wait_until("rule released", || {
            point_value(&db, "rule", point_type::ACTIVE) == Some(0.0)
        });
        assert_eq!(point_value(&db, "cond", point_type::ACTIVE), Some(0.0));
        assert_eq!(engine.stats().active_writes, 4);
        assert_eq!(engine.stats().actions_run, 1);
        assert_eq!(point_value(&db, "alarm", "alarm"), Some(1.0));
    }

    /// T2.2: Repeating a matching value does not rewrite latches.
    #[test]
    fn unchanged_boolean_writes_nothing() {
        let db = Arc::new(memory_db());
        threshold_rule(&db);
        let engine = RuleEngine::start(Arc::clone(&db)).expect("engine");

        db.submit_points("sensor", vec![Point::new("temp", 40.0)]).expect("40");
        wait_until("activation", || engine.stats().active_writes == 2);
        let evaluated = engine.stats().events_evaluated;

        db.submit_points("sensor", vec![Point::new("temp", 41.0)]).expect("41");
        wait_until("second reading", || engine.stats().events_evaluated > evaluated);
        assert_eq!(engine.stats().active_writes, 2);
        assert_eq!(engine.stats().actions_run, 1);
    }

    /// Wait until the engine's counters stop moving.
    fn assert_quiet(engine: &RuleEngine) {
        let deadline = Instant::now() + WAIT;
        loop {
            let before = engine.stats();
            thread::sleep(Duration::from_millis(100));
            if engine.stats() == before {
                return;
            }
            assert!(Instant::now() < deadline, "rule engine never settled");
        }
    }

    /// T2.3: An action writing a different point to the watched node fires once
    /// and the engine goes quiet.
    #[test]
    fn action_on_watched_node_settles() {
        let db = Arc::new(memory_db());
        threshold_rule_setting(&db, "sensor", "fan", 1.0);
        let engine = RuleEngine::start(Arc::clone(&db)).expect("engine");

        db.submit_points("sensor", vec![Point::new("temp", 35.0)]).expect("35");
        wait_until("fan on", || point_value(&db, "sensor", "fan") == Some(1.0));
        wait_until("action counted", || engine.stats().actions_run == 1);
        assert_quiet(&engine);
        assert_eq!(engine.stats().actions_run, 1);
        assert_eq!(engine.stats().active_writes, 2);
        assert_eq!(point_value(&db, "rule", point_type::ACTIVE), Some(1.0));

        let evaluated = engine.stats().events_evaluated;
        db.submit_points("sensor", vec![Point::new("temp", 36.0)]).expect("36");
        wait_until("second reading", || engine.stats().events_evaluated > evaluated);
        assert_quiet(&engine);
        assert_eq!(engine.stats().actions_run, 1);
    }

    /// T2.4: An action that resets the watched point releases its own rule
    /// and does not fire again.
    #[test]
    fn action_resetting_watched_point_releases_rule() {
        let db = Arc::new(memory_db());
        threshold_rule_setting(&db, "sensor", "temp", 0.0);
        let engine = RuleEngine::start(Arc::clone(&db)).expect("engine");

        db.submit_points("sensor", vec![Point::new("temp", 35.0)]).expect("35");
        wait_until("temp reset", || point_value(&db, "sensor", "temp") == Some(0.0));
        wait_until("rule released", || {
            point_value(&db, "rule", point_type::ACTIVE) == Some(0.0)
        });
        assert_quiet(&engine);
        assert_eq!(point_value(&db, "cond", point_type::ACTIVE), Some(0.0));
        assert_eq!(engine.stats().actions_run, 1);
        assert_eq!(engine.stats().active_writes, 4);
        assert_eq!(point_value(&db, "sensor", "temp"), Some(0.0));
    }
}

// =============================================================================
// TIER T3: DURABILITY
// =============================================================================

mod t3_durability {
    use super::*;
    use tempfile::tempdir;

    /// T3.1: Root identity and latest values survive a reopen.
    #[test]
    fn reopen_preserves_root_and_points() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("store.redb");

        let root = {
            let db = Db::open(&path, DbConfig::default()).expect("open");
            db.submit_points("n1", vec![at("temp", 1.0, 1)]).expect("t1");
            db.submit_points("n1", vec![at("temp", 2.0, 2)]).expect("t2");
            db.submit_edge_points(db.root_id(), "n1", vec![Point::new(point_type::TOMBSTONE, 0.0)])
                .expect("edge");
            db.root_id().to_string()
        };

        let db = Db::open(&path, DbConfig::default()).expect("reopen");
        assert_eq!(db.root_id(), root);
        assert_eq!(point_value(&db, "n1", "temp"), Some(2.0));
        assert_eq!(db.children(&root, "").expect("children")[0].id, "n1");
        assert_eq!(db.get_nodes(ROOT, ALL, "", false).expect("root").len(), 1);
    }
}
