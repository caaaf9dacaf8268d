//! Incremental, edge-triggered rule evaluation.
//!
//! Evaluation is pure: it updates the latches held in the `Rule` and
//! reports which latch writes and which activation the caller must carry
//! out. Only conditions whose scope matches an incoming point are
//! recomputed; the others keep their last value.

use super::model::{Condition, Operator, Rule, ValueType};
use crate::types::Point;

/// A latch flip that must be written back as an `active` point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatchWrite {
    /// Condition or rule node ID.
    pub node_id: String,
    /// New latch value.
    pub active: bool,
}

/// Result of running one change event through one rule.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Latch flips, in the order they happened.
    pub writes: Vec<LatchWrite>,
    /// True when the rule transitioned to active and its actions must run.
    pub fired: bool,
}

impl Condition {
    /// True when the point falls inside this condition's scope.
    #[must_use]
    pub fn matches(&self, node_id: &str, point: &Point) -> bool {
        if !self.node_id.is_empty() && self.node_id != node_id {
            return false;
        }
        if !self.point_type.is_empty() && self.point_type != point.point_type {
            return false;
        }
        self.point_index == -1 || point.index() == Some(self.point_index)
    }

    /// Compute the condition's boolean for a matched point.
    #[must_use]
    pub fn test(&self, point: &Point) -> bool {
        match self.value_type {
            ValueType::Number => match self.operator {
                Operator::GreaterThan => point.value > self.point_value,
                Operator::LessThan => point.value < self.point_value,
                Operator::Equal => point.value == self.point_value,
                Operator::NotEqual => point.value != self.point_value,
                Operator::Contains | Operator::Unknown => {
                    tracing::warn!(condition = %self.id, operator = ?self.operator, "operator not valid for numbers");
                    false
                }
            },
            ValueType::OnOff => (self.point_value != 0.0) == point.is_truthy(),
            ValueType::Text => match self.operator {
                Operator::Equal => point.text == self.point_text_value,
                Operator::NotEqual => point.text != self.point_text_value,
                Operator::Contains => point.text.contains(&self.point_text_value),
                Operator::GreaterThan | Operator::LessThan | Operator::Unknown => {
                    tracing::warn!(condition = %self.id, operator = ?self.operator, "operator not valid for text");
                    false
                }
            },
            ValueType::Unknown => {
                tracing::warn!(condition = %self.id, "condition has no value type");
                false
            }
        }
    }
}

/// Run the points applied to `node_id` through `rule`.
///
/// For each point in order, every condition in scope is recomputed and a
/// write is emitted only when its latch flips. If any condition was in
/// scope, the rule latch becomes the AND of the conditions recomputed for
/// that point, again written only on a flip. A flip to active fires the
/// rule and stops evaluation of the remaining points.
pub fn evaluate(rule: &mut Rule, node_id: &str, points: &[Point]) -> Outcome {
    let mut outcome = Outcome::default();

    for point in points {
        let mut touched = false;
        let mut all_active = true;

        for cond in &mut rule.conditions {
            if !cond.matches(node_id, point) {
                continue;
            }
            touched = true;
            let active = cond.test(point);
            all_active &= active;
            if active != cond.active {
                cond.active = active;
                outcome.writes.push(LatchWrite {
                    node_id: cond.id.clone(),
                    active,
                });
            }
        }

        if !touched || all_active == rule.active {
            continue;
        }
        rule.active = all_active;
        outcome.writes.push(LatchWrite {
            node_id: rule.id.clone(),
            active: all_active,
        });
        if all_active {
            outcome.fired = true;
            break;
        }
    }

    outcome
}
