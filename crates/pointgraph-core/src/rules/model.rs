//! Rule, condition and action records decoded from graph nodes.
//!
//! A rule is a node of kind `rule`; its conditions and actions are child
//! nodes of kind `condition` and `action`. All configuration lives in
//! ordinary points, so rules follow the same lifecycle as any node.

use crate::codec::{Decode, Field};
use crate::types::point_type;

/// How a condition interprets the matched point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValueType {
    /// Compare `Point.value` numerically.
    Number,
    /// Compare `Point.value != 0` for equality.
    OnOff,
    /// Compare `Point.text`.
    Text,
    /// Unrecognised or missing; never matches.
    #[default]
    Unknown,
}

impl ValueType {
    /// Parse the text of a `valueType` point.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "number" => Self::Number,
            "onOff" => Self::OnOff,
            "text" => Self::Text,
            _ => Self::Unknown,
        }
    }

    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::OnOff => "onOff",
            Self::Text => "text",
            Self::Unknown => "",
        }
    }
}

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Operator {
    /// `>`
    GreaterThan,
    /// `<`
    LessThan,
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// Substring test, text only.
    Contains,
    /// Unrecognised or missing.
    #[default]
    Unknown,
}

impl Operator {
    /// Parse the text of an `operator` point.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            ">" => Self::GreaterThan,
            "<" => Self::LessThan,
            "=" => Self::Equal,
            "!=" => Self::NotEqual,
            "contains" => Self::Contains,
            _ => Self::Unknown,
        }
    }

    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Contains => "contains",
            Self::Unknown => "",
        }
    }
}

/// What an action does when its rule fires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ActionKind {
    /// Write a point to the target node.
    SetValue,
    /// Publish a notification on the rule's channel.
    Notify,
    /// Anything else; logged and skipped.
    #[default]
    Unknown,
}

impl ActionKind {
    /// Parse the text of an `action` point.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "setValue" => Self::SetValue,
            "notify" => Self::Notify,
            _ => Self::Unknown,
        }
    }
}

/// A rule condition with its activity latch.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Condition node ID.
    pub id: String,
    /// Node to watch; empty matches any node.
    pub node_id: String,
    /// Point type to watch; empty matches any type.
    pub point_type: String,
    /// Point index to watch; `-1` matches any index.
    pub point_index: i64,
    /// Comparison domain.
    pub value_type: ValueType,
    /// Comparison operator.
    pub operator: Operator,
    /// Numeric operand.
    pub point_value: f64,
    /// Text operand.
    pub point_text_value: String,
    /// Latch.
    pub active: bool,
}

impl Default for Condition {
    fn default() -> Self {
        Self {
            id: String::new(),
            node_id: String::new(),
            point_type: String::new(),
            point_index: -1,
            value_type: ValueType::Unknown,
            operator: Operator::Unknown,
            point_value: 0.0,
            point_text_value: String::new(),
            active: false,
        }
    }
}

impl Condition {
    /// True when both conditions are configured identically, latch aside.
    #[must_use]
    pub fn same_config(&self, other: &Self) -> bool {
        self.id == other.id
            && self.node_id == other.node_id
            && self.point_type == other.point_type
            && self.point_index == other.point_index
            && self.value_type == other.value_type
            && self.operator == other.operator
            && self.point_value == other.point_value
            && self.point_text_value == other.point_text_value
    }
}

impl Decode for Condition {
    const FIELDS: &'static [Field<Self>] = &[
        Field {
            point_type: point_type::NODE_ID,
            apply: |c, p| c.node_id = p.text.clone(),
        },
        Field {
            point_type: point_type::POINT_TYPE,
            apply: |c, p| c.point_type = p.text.clone(),
        },
        Field {
            point_type: point_type::POINT_INDEX,
            apply: |c, p| c.point_index = p.value as i64,
        },
        Field {
            point_type: point_type::VALUE_TYPE,
            apply: |c, p| c.value_type = ValueType::parse(&p.text),
        },
        Field {
            point_type: point_type::OPERATOR,
            apply: |c, p| c.operator = Operator::parse(&p.text),
        },
        Field {
            point_type: point_type::VALUE,
            apply: |c, p| {
                c.point_value = p.value;
                c.point_text_value = p.text.clone();
            },
        },
        Field {
            point_type: point_type::ACTIVE,
            apply: |c, p| c.active = p.is_truthy(),
        },
    ];

    fn set_id(&mut self, id: &str) {
        self.id = id.to_string();
    }
}

/// A rule action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Action {
    /// Action node ID.
    pub id: String,
    /// Target node (`SetValue`) or notification source (`Notify`).
    pub node_id: String,
    /// What to do.
    pub kind: ActionKind,
    /// Point type written by `SetValue`.
    pub point_type: String,
    /// Value written by `SetValue`.
    pub point_value: f64,
    /// Text written by `SetValue`.
    pub point_text_value: String,
}

impl Decode for Action {
    const FIELDS: &'static [Field<Self>] = &[
        Field {
            point_type: point_type::NODE_ID,
            apply: |a, p| a.node_id = p.text.clone(),
        },
        Field {
            point_type: point_type::ACTION,
            apply: |a, p| a.kind = ActionKind::parse(&p.text),
        },
        Field {
            point_type: point_type::POINT_TYPE,
            apply: |a, p| a.point_type = p.text.clone(),
        },
        Field {
            point_type: point_type::VALUE,
            apply: |a, p| {
                a.point_value = p.value;
                a.point_text_value = p.text.clone();
            },
        },
    ];

    fn set_id(&mut self, id: &str) {
        self.id = id.to_string();
    }
}

/// A rule with its conditions and actions, in child creation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rule {
    /// Rule node ID.
    pub id: String,
    /// Human readable description, used in notifications.
    pub description: String,
    /// Conditions, ANDed.
    pub conditions: Vec<Condition>,
    /// Actions run on activation, in order.
    pub actions: Vec<Action>,
    /// Latch.
    pub active: bool,
}

impl Decode for Rule {
    const FIELDS: &'static [Field<Self>] = &[
        Field {
            point_type: point_type::DESCRIPTION,
            apply: |r, p| r.description = p.text.clone(),
        },
        Field {
            point_type: point_type::ACTIVE,
            apply: |r, p| r.active = p.is_truthy(),
        },
    ];

    fn set_id(&mut self, id: &str) {
        self.id = id.to_string();
    }
}

impl Rule {
    /// True when conditions and actions are configured identically.
    #[must_use]
    pub fn same_config(&self, other: &Self) -> bool {
        self.id == other.id
            && self.description == other.description
            && self.actions == other.actions
            && self.conditions.len() == other.conditions.len()
            && self
                .conditions
                .iter()
                .zip(&other.conditions)
                .all(|(a, b)| a.same_config(b))
    }

    /// Copy latches from a previous load of the same rule.
    ///
    /// The rule latch survives only if the whole configuration is
    /// unchanged; a condition latch survives if that condition is.
    pub fn inherit_latches(&mut self, previous: &Self) {
        if self.same_config(previous) {
            self.active = previous.active;
        }
        for cond in &mut self.conditions {
            if let Some(old) = previous.conditions.iter().find(|o| o.id == cond.id) {
                if cond.same_config(old) {
                    cond.active = old.active;
                }
            }
        }
    }

    /// IDs of the rule node and all its condition and action nodes.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id.as_str())
            .chain(self.conditions.iter().map(|c| c.id.as_str()))
            .chain(self.actions.iter().map(|a| a.id.as_str()))
    }
}
