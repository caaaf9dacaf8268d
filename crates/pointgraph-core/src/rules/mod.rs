//! # Rule Engine
//!
//! Reactive condition/action rules stored as ordinary graph nodes.
//!
//! - `model`: `Rule`, `Condition`, `Action` and their decode tables
//! - `eval`: pure, incremental, edge-triggered evaluation
//! - `notify`: per-rule notification channels
//! - `engine`: the service wiring evaluation to the change bus

mod engine;
mod eval;
mod model;
mod notify;

pub use engine::{EngineStats, RuleEngine, RuleEngineConfig, load_rules};
pub use eval::{LatchWrite, Outcome, evaluate};
pub use model::{Action, ActionKind, Condition, Operator, Rule, ValueType};
pub use notify::{Notification, NotificationHub};

/// Origin stamped on points written by the rule engine.
pub const RULE_ORIGIN: &str = "rule";
