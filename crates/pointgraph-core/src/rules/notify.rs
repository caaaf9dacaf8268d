//! Per-rule notification channels.

use crate::registry::Registry;
use crate::types::{PointGraphError, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};

/// Message produced by a `notify` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique message ID.
    pub id: String,
    /// Node named by the action.
    pub source_node: String,
    /// Rule that fired.
    pub rule_id: String,
    /// `"<rule description> fired at <trigger description>"`.
    pub message: String,
}

impl Notification {
    /// Compose a notification for a rule firing.
    #[must_use]
    pub fn new(rule_id: &str, rule_desc: &str, source_node: &str, trigger_desc: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_node: source_node.to_string(),
            rule_id: rule_id.to_string(),
            message: format!("{rule_desc} fired at {trigger_desc}"),
        }
    }
}

/// Notification channels keyed by rule ID, one listener per rule.
#[derive(Debug)]
pub struct NotificationHub {
    channels: Registry<Sender<Notification>>,
    capacity: usize,
}

impl NotificationHub {
    /// Create a hub whose channels hold `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Registry::new(),
            capacity: capacity.max(1),
        }
    }

    /// Listen to a rule's notifications.
    pub fn subscribe(&self, rule_id: &str) -> Result<Receiver<Notification>> {
        let (tx, rx) = bounded(self.capacity);
        self.channels.register(rule_id, tx)?;
        Ok(rx)
    }

    /// Stop listening to a rule.
    pub fn unsubscribe(&self, rule_id: &str) -> Result<()> {
        self.channels.unregister(rule_id)?;
        Ok(())
    }

    /// Publish on the rule's channel. Without a listener this is a no-op.
    pub fn publish(&self, notification: Notification) -> Result<()> {
        let Some(tx) = self.channels.get(&notification.rule_id)? else {
            tracing::debug!(rule = %notification.rule_id, "no notification listener");
            return Ok(());
        };
        match tx.try_send(notification) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(n)) => Err(PointGraphError::Closed(format!(
                "notification channel for {} is full",
                n.rule_id
            ))),
            Err(TrySendError::Disconnected(n)) => {
                self.channels.unregister(&n.rule_id)?;
                Err(PointGraphError::Closed(format!(
                    "notification listener for {} went away",
                    n.rule_id
                )))
            }
        }
    }
}
