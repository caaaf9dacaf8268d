//! The rule engine service.
//!
//! Two threads:
//! - the evaluator reads every change event from a lossless bus
//!   subscription, keeps the decoded rules and their latches, and queues
//!   the writes it wants on a bounded feedback channel
//! - the feedback writer drains that channel into `Db::submit`
//!
//! The evaluator never calls back into the write path itself, so a rule
//! that writes to the node it watches cannot deadlock or recurse.

use super::eval::evaluate;
use super::model::{Action, ActionKind, Condition, Rule};
use super::notify::{Notification, NotificationHub};
use super::RULE_ORIGIN;
use crate::bus::{ChangeEvent, Topic};
use crate::codec::decode;
use crate::db::Db;
use crate::types::{
    ALL, Owner, Point, PointGraphError, Result, bool_to_value, node_type, point_type,
};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Rule engine queue sizes.
#[derive(Debug, Clone)]
pub struct RuleEngineConfig {
    /// Pending feedback writes before the evaluator waits.
    pub feedback_capacity: usize,
    /// Per-rule notification channel capacity.
    pub notification_capacity: usize,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            feedback_capacity: 4096,
            notification_capacity: 64,
        }
    }
}

/// Counters exposed for monitoring and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Change events run through the rules.
    pub events_evaluated: u64,
    /// Latch writes queued.
    pub active_writes: u64,
    /// Actions that completed.
    pub actions_run: u64,
    /// Actions that failed.
    pub action_failures: u64,
    /// Rule reloads.
    pub reloads: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_evaluated: AtomicU64,
    active_writes: AtomicU64,
    actions_run: AtomicU64,
    action_failures: AtomicU64,
    reloads: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            events_evaluated: self.events_evaluated.load(Ordering::Relaxed),
            active_writes: self.active_writes.load(Ordering::Relaxed),
            actions_run: self.actions_run.load(Ordering::Relaxed),
            action_failures: self.action_failures.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
        }
    }
}

/// A queued write produced by the evaluator.
#[derive(Debug)]
struct Feedback {
    node_id: String,
    points: Vec<Point>,
}

/// Handle to a running rule engine. Dropping it stops both threads.
#[derive(Debug)]
pub struct RuleEngine {
    stop_tx: Option<Sender<()>>,
    notifications: Arc<NotificationHub>,
    counters: Arc<Counters>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl RuleEngine {
    /// Subscribe to `db` and start evaluating.
    ///
    /// The subscription is taken before this returns, so every write
    /// submitted afterwards is seen.
    pub fn start(db: Arc<Db>) -> Result<Self> {
        let cfg = db.config().rules.clone();
        let sub = db.subscribe_lossless(Topic::All)?;
        let (feedback_tx, feedback_rx) = bounded::<Feedback>(cfg.feedback_capacity.max(1));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let notifications = Arc::new(NotificationHub::new(cfg.notification_capacity));
        let counters = Arc::new(Counters::default());

        let writer_db = Arc::clone(&db);
        let writer = thread::Builder::new()
            .name("pointgraph-rule-writer".to_string())
            .spawn(move || feedback_loop(&writer_db, &feedback_rx))
            .map_err(|e| PointGraphError::Io(e.to_string()))?;

        let mut evaluator = Evaluator {
            db,
            rules: Vec::new(),
            own_nodes: HashSet::new(),
            feedback: feedback_tx,
            notifications: Arc::clone(&notifications),
            counters: Arc::clone(&counters),
        };
        let engine = thread::Builder::new()
            .name("pointgraph-rules".to_string())
            .spawn(move || {
                evaluator.reload();
                loop {
                    let next = select! {
                        recv(stop_rx) -> _ => None,
                        recv(sub.receiver()) -> msg => msg.ok(),
                    };
                    let Some(event) = next else { break };
                    evaluator.handle(&event);
                }
                tracing::debug!("rule engine stopped");
            })
            .map_err(|e| PointGraphError::Io(e.to_string()))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            notifications,
            counters,
            joins: Mutex::new(vec![engine, writer]),
        })
    }

    /// Per-rule notification channels.
    #[must_use]
    pub fn notifications(&self) -> &Arc<NotificationHub> {
        &self.notifications
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }
}

impl Drop for RuleEngine {
    fn drop(&mut self) {
        // Closing the stop channel ends the evaluator, which drops the
        // feedback sender and lets the writer drain and exit.
        drop(self.stop_tx.take());
        if let Ok(mut joins) = self.joins.lock() {
            for handle in joins.drain(..) {
                if handle.join().is_err() {
                    tracing::error!("rule engine thread panicked");
                }
            }
        }
    }
}

fn feedback_loop(db: &Db, rx: &Receiver<Feedback>) {
    while let Ok(fb) = rx.recv() {
        if let Err(e) = db.submit_points(&fb.node_id, fb.points) {
            tracing::error!(node = %fb.node_id, error = %e, "rule write rejected");
        }
    }
}

/// Load every live rule with its conditions and actions.
///
/// A rule attached under several parents is loaded once.
pub fn load_rules(db: &Db) -> Result<Vec<Rule>> {
    let mut seen = HashSet::new();
    let mut rules = Vec::new();
    for node in db.get_nodes(ALL, ALL, node_type::RULE, false)? {
        if !seen.insert(node.id.clone()) {
            continue;
        }
        let mut rule: Rule = decode(&node);
        rule.conditions = db
            .children(&node.id, node_type::CONDITION)?
            .iter()
            .map(decode::<Condition>)
            .collect();
        rule.actions = db
            .children(&node.id, node_type::ACTION)?
            .iter()
            .map(decode::<Action>)
            .collect();
        rules.push(rule);
    }
    Ok(rules)
}

struct Evaluator {
    db: Arc<Db>,
    rules: Vec<Rule>,
    own_nodes: HashSet<String>,
    feedback: Sender<Feedback>,
    notifications: Arc<NotificationHub>,
    counters: Arc<Counters>,
}

impl Evaluator {
    fn reload(&mut self) {
        match load_rules(&self.db) {
            Ok(mut rules) => {
                for rule in &mut rules {
                    if let Some(old) = self.rules.iter().find(|o| o.id == rule.id) {
                        rule.inherit_latches(old);
                    }
                }
                self.own_nodes = rules
                    .iter()
                    .flat_map(Rule::node_ids)
                    .map(str::to_string)
                    .collect();
                tracing::info!(rules = rules.len(), "rules loaded");
                self.rules = rules;
                Counters::bump(&self.counters.reloads);
            }
            Err(e) => tracing::error!(error = %e, "rule reload failed, keeping previous rules"),
        }
    }

    fn needs_reload(&self, event: &ChangeEvent) -> bool {
        match &event.owner {
            Owner::Edge { .. } => true,
            Owner::Node(id) => event.points.iter().any(|p| {
                p.point_type == point_type::NODE_TYPE
                    || (self.own_nodes.contains(id) && p.point_type != point_type::ACTIVE)
            }),
        }
    }

    fn handle(&mut self, event: &ChangeEvent) {
        if self.needs_reload(event) {
            self.reload();
        }
        let Owner::Node(node_id) = &event.owner else {
            return;
        };
        if self.own_nodes.contains(node_id) {
            return;
        }

        let mut rules = std::mem::take(&mut self.rules);
        for rule in &mut rules {
            let outcome = evaluate(rule, node_id, &event.points);
            for write in &outcome.writes {
                let point = Point::new(point_type::ACTIVE, bool_to_value(write.active))
                    .with_origin(RULE_ORIGIN);
                match self.emit(&write.node_id, point) {
                    Ok(()) => Counters::bump(&self.counters.active_writes),
                    Err(e) => tracing::error!(node = %write.node_id, error = %e, "latch write lost"),
                }
            }
            if outcome.fired {
                tracing::info!(rule = %rule.id, trigger = %node_id, "rule fired");
                self.run_actions(rule, node_id);
            }
        }
        self.rules = rules;
        Counters::bump(&self.counters.events_evaluated);
    }

    fn emit(&self, node_id: &str, point: Point) -> Result<()> {
        self.feedback
            .send(Feedback {
                node_id: node_id.to_string(),
                points: vec![point],
            })
            .map_err(|_| PointGraphError::Closed("rule feedback writer".to_string()))
    }

    /// Run actions in order. A failing action is logged and the next one
    /// still runs.
    fn run_actions(&self, rule: &Rule, trigger: &str) {
        for action in &rule.actions {
            match self.run_action(rule, action, trigger) {
                Ok(()) => Counters::bump(&self.counters.actions_run),
                Err(e) => {
                    Counters::bump(&self.counters.action_failures);
                    tracing::warn!(rule = %rule.id, action = %action.id, error = %e, "rule action failed");
                }
            }
        }
    }

    fn run_action(&self, rule: &Rule, action: &Action, trigger: &str) -> Result<()> {
        match action.kind {
            ActionKind::SetValue => {
                if action.node_id.is_empty() {
                    return Err(PointGraphError::NotFound(format!(
                        "target node of action {}",
                        action.id
                    )));
                }
                let point = Point {
                    text: action.point_text_value.clone(),
                    ..Point::new(action.point_type.clone(), action.point_value)
                }
                .with_origin(RULE_ORIGIN);
                self.emit(&action.node_id, point)
            }
            ActionKind::Notify => {
                let trigger = self.db.node(trigger)?;
                self.notifications.publish(Notification::new(
                    &rule.id,
                    &rule.description,
                    &action.node_id,
                    &trigger.desc(),
                ))
            }
            ActionKind::Unknown => Err(PointGraphError::NotFound(format!(
                "handler for action {}",
                action.id
            ))),
        }
    }
}
