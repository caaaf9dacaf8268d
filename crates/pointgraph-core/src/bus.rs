//! # Change Bus
//!
//! In-process publish/subscribe for applied point changes.
//!
//! Writers enqueue a `ChangeEvent` on an unbounded ingress channel while
//! they still hold the owner lock, so events for one owner enter the bus in
//! commit order. A single dispatcher thread fans events out to subscribers,
//! which keeps that order per subscriber.
//!
//! Subscribers have bounded queues:
//! - `Delivery::Lossy`: a full queue drops the newest event and counts it
//! - `Delivery::Lossless`: never drops (used by the rule engine). Each lossless
//!   subscriber has its own forwarder thread that waits for room in the
//!   bounded queue, so the dispatcher itself never blocks.

use crate::types::{Owner, Point, PointGraphError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded, unbounded};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Queue sizes for the bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-subscriber queue capacity for lossy subscribers.
    pub subscriber_capacity: usize,
    /// Queue capacity for lossless subscribers.
    pub rule_queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            rule_queue_capacity: 8192,
        }
    }
}

/// Points that were just applied to one owner.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Owner that changed.
    pub owner: Owner,
    /// The applied points, in batch order.
    pub points: Vec<Point>,
}

/// What a subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// Every owner.
    All,
    /// One node or edge.
    Owner(Owner),
}

impl Topic {
    fn matches(&self, owner: &Owner) -> bool {
        match self {
            Self::All => true,
            Self::Owner(o) => o == owner,
        }
    }
}

/// Back-pressure policy of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Drop events the subscriber has no room for.
    Lossy,
    /// Never drop; the subscriber's forwarder waits for room.
    Lossless,
}

#[derive(Debug)]
struct Entry {
    topic: Topic,
    delivery: Delivery,
    tx: Sender<ChangeEvent>,
    dropped: Arc<AtomicU64>,
}

type Subscribers = Arc<Mutex<HashMap<u64, Entry>>>;

/// Change notification hub.
#[derive(Debug)]
pub struct ChangeBus {
    cfg: BusConfig,
    ingress: Sender<ChangeEvent>,
    subscribers: Subscribers,
    next_id: AtomicU64,
    dropped: Arc<AtomicU64>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeBus {
    /// Start the bus and its dispatcher thread.
    pub fn new(cfg: BusConfig) -> Result<Self> {
        let (ingress, rx) = unbounded::<ChangeEvent>();
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let dropped = Arc::new(AtomicU64::new(0));

        let thread_subs = Arc::clone(&subscribers);
        let thread_dropped = Arc::clone(&dropped);
        let join = thread::Builder::new()
            .name("pointgraph-bus".to_string())
            .spawn(move || dispatch_loop(&rx, &thread_subs, &thread_dropped))
            .map_err(|e| PointGraphError::Io(e.to_string()))?;

        Ok(Self {
            cfg,
            ingress,
            subscribers,
            next_id: AtomicU64::new(1),
            dropped,
            join: Mutex::new(Some(join)),
        })
    }

    /// Enqueue an event. Never blocks.
    pub fn publish(&self, event: ChangeEvent) {
        if self.ingress.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("change bus closed, event dropped");
        }
    }

    /// Lossy subscription.
    pub fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        self.register(topic, Delivery::Lossy, self.cfg.subscriber_capacity)
    }

    /// Lossless subscription. A slow consumer only delays itself; its
    /// backlog grows in the forwarder's ingress queue.
    pub fn subscribe_lossless(&self, topic: Topic) -> Result<Subscription> {
        self.register(topic, Delivery::Lossless, self.cfg.rule_queue_capacity)
    }

    fn register(&self, topic: Topic, delivery: Delivery, capacity: usize) -> Result<Subscription> {
        let (out_tx, rx) = bounded(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));

        let tx = match delivery {
            Delivery::Lossy => out_tx,
            Delivery::Lossless => {
                let (in_tx, in_rx) = unbounded::<ChangeEvent>();
                thread::Builder::new()
                    .name(format!("pointgraph-bus-fwd-{id}"))
                    .spawn(move || forward_loop(&in_rx, &out_tx))
                    .map_err(|e| PointGraphError::Io(e.to_string()))?;
                in_tx
            }
        };
        self.subscribers
            .lock()
            .map_err(|_| PointGraphError::Closed("bus subscribers".to_string()))?
            .insert(
                id,
                Entry {
                    topic,
                    delivery,
                    tx,
                    dropped: Arc::clone(&dropped),
                },
            );
        tracing::debug!(id, ?delivery, "subscriber registered");
        Ok(Subscription {
            id,
            rx,
            dropped,
            subscribers: Arc::clone(&self.subscribers),
        })
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Events dropped because a lossy subscriber was full or the bus was closed.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for ChangeBus {
    fn drop(&mut self) {
        // Close ingress so the dispatcher drains and exits.
        let (dummy, _) = unbounded::<ChangeEvent>();
        drop(std::mem::replace(&mut self.ingress, dummy));

        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                if handle.join().is_err() {
                    tracing::error!("change bus dispatcher panicked");
                }
            }
        }
    }
}

fn dispatch_loop(rx: &Receiver<ChangeEvent>, subscribers: &Subscribers, dropped: &AtomicU64) {
    while let Ok(event) = rx.recv() {
        let targets: Vec<(u64, Delivery, Sender<ChangeEvent>, Arc<AtomicU64>)> = match subscribers.lock() {
            Ok(subs) => subs
                .iter()
                .filter(|(_, e)| e.topic.matches(&event.owner))
                .map(|(id, e)| (*id, e.delivery, e.tx.clone(), Arc::clone(&e.dropped)))
                .collect(),
            Err(_) => {
                tracing::error!("bus subscriber table poisoned, dispatcher exiting");
                return;
            }
        };

        let mut gone = Vec::new();
        for (id, delivery, tx, sub_dropped) in targets {
            match delivery {
                Delivery::Lossy => match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        sub_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(id, owner = %event.owner, "subscriber full, event dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => gone.push(id),
                },
                // Unbounded forwarder ingress: never blocks.
                Delivery::Lossless => {
                    if tx.send(event.clone()).is_err() {
                        gone.push(id);
                    }
                }
            }
        }

        if !gone.is_empty() {
            if let Ok(mut subs) = subscribers.lock() {
                for id in gone {
                    subs.remove(&id);
                }
            }
        }
    }
    tracing::debug!("change bus dispatcher stopped");
}

/// Moves a lossless subscriber's events into its bounded queue. Ends when the
/// subscription is removed from the table or its receiver is dropped.
fn forward_loop(rx: &Receiver<ChangeEvent>, tx: &Sender<ChangeEvent>) {
    while let Ok(event) = rx.recv() {
        if tx.send(event).is_err() {
            break;
        }
    }
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: Receiver<ChangeEvent>,
    dropped: Arc<AtomicU64>,
    subscribers: Subscribers,
}

fn closed() -> PointGraphError {
    PointGraphError::Closed("subscription".to_string())
}

impl Subscription {
    /// Events this subscriber missed because its queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the next event; `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<ChangeEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(closed()),
        }
    }

    /// Next queued event, if any.
    pub fn try_recv(&self) -> Result<Option<ChangeEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(closed()),
        }
    }

    /// The underlying channel, for use with `crossbeam_channel::select!`.
    #[must_use]
    pub fn receiver(&self) -> &Receiver<ChangeEvent> {
        &self.rx
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.remove(&self.id);
        }
    }
}
