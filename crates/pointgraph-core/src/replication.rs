//! # Replication
//!
//! Pushes applied changes to upstream peers with a request/acknowledge
//! exchange.
//!
//! Each batch gets one attempt plus `retries` retries, every attempt bounded
//! by `timeout`. Exhausting them is a `PropagationError`: it is logged, the
//! batch is abandoned, and the peer is marked for resync. The next time the
//! replicator has something for that peer it first pushes a full snapshot,
//! which also covers whatever was abandoned.
//!
//! Points whose `origin` is the peer's ID came from that peer and are not
//! sent back to it.

use crate::bus::{ChangeEvent, Topic};
use crate::db::Db;
use crate::registry::Registry;
use crate::types::{Owner, Point, PointGraphError, Result, TransportError};
use crossbeam_channel::{Sender, bounded, select};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Timeouts and retries for upstream propagation.
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Bound on a single request/ack attempt.
    pub timeout: Duration,
    /// Retries after the first failed attempt.
    pub retries: u32,
    /// Base delay before a retry, doubled for each further retry.
    pub backoff: Duration,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl PropagationConfig {
    /// Delay before retry number `retry` (0 is the first retry).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Unit of replication: the points of one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointBatch {
    /// Owner the points belong to.
    pub owner: Owner,
    /// Points to merge on the receiving side.
    pub points: Vec<Point>,
}

/// A remote store that acknowledges point batches.
pub trait Upstream: Send + Sync + std::fmt::Debug {
    /// Stable peer ID, also used as the origin of points received from it.
    fn peer_id(&self) -> &str;

    /// Send one batch and wait for its acknowledgement, at most `timeout`.
    fn send(&self, batch: &PointBatch, timeout: Duration) -> Result<(), TransportError>;
}

/// Bounded-retry sender.
#[derive(Debug, Clone, Default)]
pub struct Propagator {
    cfg: PropagationConfig,
}

impl Propagator {
    /// Create a propagator.
    #[must_use]
    pub fn new(cfg: PropagationConfig) -> Self {
        Self { cfg }
    }

    /// Deliver a batch, retrying up to the configured limit.
    pub fn propagate(&self, upstream: &dyn Upstream, batch: &PointBatch) -> Result<()> {
        let attempts = self.cfg.retries.saturating_add(1);
        let mut last = TransportError::Connection("no attempt made".to_string());
        for attempt in 0..attempts {
            if attempt > 0 {
                thread::sleep(self.cfg.delay(attempt - 1));
            }
            match upstream.send(batch, self.cfg.timeout) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(peer = upstream.peer_id(), owner = %batch.owner, attempt, error = %e, "propagation attempt failed");
                    last = e;
                }
            }
        }
        let err = PointGraphError::Propagation {
            peer: upstream.peer_id().to_string(),
            attempts,
            last,
        };
        tracing::error!(owner = %batch.owner, error = %err, "batch abandoned");
        Err(err)
    }
}

/// Replication counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    /// Batches acknowledged by a peer.
    pub batches_sent: u64,
    /// Batches abandoned after all retries.
    pub batches_failed: u64,
    /// Completed full resyncs.
    pub resyncs: u64,
}

#[derive(Debug)]
struct Shared {
    db: Arc<Db>,
    peers: Registry<Arc<dyn Upstream>>,
    pending_resync: Mutex<HashSet<String>>,
    propagator: Propagator,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    resyncs: AtomicU64,
}

impl Shared {
    fn mark_pending(&self, peer: &str) {
        if let Ok(mut pending) = self.pending_resync.lock() {
            pending.insert(peer.to_string());
        }
    }

    fn is_pending(&self, peer: &str) -> bool {
        self.pending_resync
            .lock()
            .map(|p| p.contains(peer))
            .unwrap_or(true)
    }

    fn clear_pending(&self, peer: &str) {
        if let Ok(mut pending) = self.pending_resync.lock() {
            pending.remove(peer);
        }
    }

    fn send(&self, peer: &dyn Upstream, batch: &PointBatch) -> Result<()> {
        match self.propagator.propagate(peer, batch) {
            Ok(()) => {
                self.batches_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.batches_failed.fetch_add(1, Ordering::Relaxed);
                self.mark_pending(peer.peer_id());
                Err(e)
            }
        }
    }

    /// Push every owner's current points to one peer.
    fn resync(&self, peer: &dyn Upstream) -> Result<()> {
        self.mark_pending(peer.peer_id());
        let mut sent = 0usize;
        for owner in self.db.owners()? {
            let points = without_echo(self.db.get_points(&owner)?, peer.peer_id());
            if points.is_empty() {
                continue;
            }
            self.send(peer, &PointBatch { owner, points })?;
            sent += 1;
        }
        self.clear_pending(peer.peer_id());
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        tracing::info!(peer = peer.peer_id(), batches = sent, "resync complete");
        Ok(())
    }

    fn forward(&self, event: &ChangeEvent) {
        let peers = match self.peers.clients() {
            Ok(peers) => peers,
            Err(e) => {
                tracing::error!(error = %e, "peer registry unavailable");
                return;
            }
        };
        for (id, peer) in peers {
            if self.is_pending(&id) {
                // The snapshot already contains this event.
                if let Err(e) = self.resync(peer.as_ref()) {
                    tracing::warn!(peer = %id, error = %e, "resync failed, will retry on next change");
                }
                continue;
            }
            let points = without_echo(event.points.clone(), &id);
            if points.is_empty() {
                continue;
            }
            let batch = PointBatch {
                owner: event.owner.clone(),
                points,
            };
            // Failure is logged by the propagator and marks the peer.
            let _ = self.send(peer.as_ref(), &batch);
        }
    }
}

fn without_echo(mut points: Vec<Point>, peer: &str) -> Vec<Point> {
    points.retain(|p| p.origin != peer);
    points
}

/// Background replication of one store to its upstream peers.
///
/// New peers start in resync-pending state, so their first exchange is a
/// full snapshot.
#[derive(Debug)]
pub struct Replicator {
    shared: Arc<Shared>,
    stop_tx: Option<Sender<()>>,
}

impl Replicator {
    /// Subscribe to `db` and start forwarding.
    pub fn start(db: Arc<Db>) -> Result<Self> {
        let sub = db.subscribe(Topic::All)?;
        let propagator = Propagator::new(db.config().propagation.clone());
        let shared = Arc::new(Shared {
            db,
            peers: Registry::new(),
            pending_resync: Mutex::new(HashSet::new()),
            propagator,
            batches_sent: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
        });
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name("pointgraph-replicator".to_string())
            .spawn(move || {
                let mut seen_dropped = 0;
                loop {
                    let next = select! {
                        recv(stop_rx) -> _ => None,
                        recv(sub.receiver()) -> msg => msg.ok(),
                    };
                    let Some(event) = next else { break };
                    let dropped = sub.dropped();
                    if dropped > seen_dropped {
                        seen_dropped = dropped;
                        tracing::warn!(dropped, "replicator fell behind, resyncing all peers");
                        if let Ok(ids) = worker.peers.ids() {
                            for id in ids {
                                worker.mark_pending(&id);
                            }
                        }
                    }
                    worker.forward(&event);
                }
                tracing::debug!("replicator stopped");
            })
            .map_err(|e| PointGraphError::Io(e.to_string()))?;

        Ok(Self {
            shared,
            stop_tx: Some(stop_tx),
        })
    }

    /// Register an upstream peer. Its first exchange is a full resync.
    pub fn add_peer(&self, peer: Arc<dyn Upstream>) -> Result<()> {
        let id = peer.peer_id().to_string();
        self.shared.peers.register(id.clone(), peer)?;
        self.shared.mark_pending(&id);
        tracing::info!(peer = %id, "upstream peer added");
        Ok(())
    }

    /// Remove a peer.
    pub fn remove_peer(&self, id: &str) -> Result<()> {
        self.shared.peers.unregister(id)?;
        self.shared.clear_pending(id);
        Ok(())
    }

    /// Registered peer IDs.
    pub fn peers(&self) -> Result<Vec<String>> {
        self.shared.peers.ids()
    }

    /// Push a full snapshot to a peer now, on the calling thread.
    pub fn resync(&self, peer_id: &str) -> Result<()> {
        let peer = self
            .shared
            .peers
            .get(peer_id)?
            .ok_or_else(|| PointGraphError::NotFound(format!("peer {peer_id}")))?;
        self.shared.resync(peer.as_ref())
    }

    /// True while a peer waits for a resync.
    #[must_use]
    pub fn resync_pending(&self, peer_id: &str) -> bool {
        self.shared.is_pending(peer_id)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            batches_sent: self.shared.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.shared.batches_failed.load(Ordering::Relaxed),
            resyncs: self.shared.resyncs.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        // The worker may be inside a retry loop bounded only by the
        // propagation timeouts, so it is not joined.
        drop(self.stop_tx.take());
    }
}
