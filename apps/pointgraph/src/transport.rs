//! # Replication Transport
//!
//! Newline-delimited JSON over TCP. A sender writes one
//! [`ReplicationRequest`] per line and waits for one [`ReplicationAck`]
//! line in return. The listener merges each batch into the local store
//! before acknowledging it, so an ack means the points are durable.

use pointgraph_core::{Db, PointBatch, PointGraphError, TransportError, Upstream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;

// =============================================================================
// WIRE TYPES
// =============================================================================

/// One batch from a downstream node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRequest {
    /// ID of the sending node. Stamped as origin on points that have none.
    pub peer: String,
    /// Points for one owner.
    pub batch: PointBatch,
}

/// Reply to a [`ReplicationRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplicationAck {
    /// The batch was merged.
    pub fn accepted() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    /// The batch was refused.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(reason.into()),
        }
    }
}

// =============================================================================
// LISTENER
// =============================================================================

/// Accept downstream connections until the task is dropped.
pub async fn run_listener(listener: TcpListener, db: Arc<Db>) -> Result<(), PointGraphError> {
    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| PointGraphError::Io(format!("Accept failed: {}", e)))?;
        tracing::debug!(%addr, "replication peer connected");

        let db = Arc::clone(&db);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, db).await {
                tracing::warn!(%addr, error = %e, "replication connection dropped");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, db: Arc<Db>) -> Result<(), PointGraphError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| PointGraphError::Io(format!("Read failed: {}", e)))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let ack = match serde_json::from_str::<ReplicationRequest>(&line) {
            Ok(request) => apply(&db, request).await,
            Err(e) => ReplicationAck::rejected(format!("malformed request: {}", e)),
        };

        let mut reply = serde_json::to_string(&ack)
            .map_err(|e| PointGraphError::Serialization(e.to_string()))?;
        reply.push('\n');
        write
            .write_all(reply.as_bytes())
            .await
            .map_err(|e| PointGraphError::Io(format!("Write failed: {}", e)))?;
    }
    Ok(())
}

async fn apply(db: &Arc<Db>, request: ReplicationRequest) -> ReplicationAck {
    let ReplicationRequest { peer, batch } = request;
    let owner = batch.owner;
    let points: Vec<_> = batch
        .points
        .into_iter()
        .map(|mut p| {
            if p.origin.is_empty() {
                p.origin.clone_from(&peer);
            }
            p
        })
        .collect();

    let db = Arc::clone(db);
    let log_owner = owner.clone();
    match tokio::task::spawn_blocking(move || db.submit(&owner, points)).await {
        Ok(Ok(applied)) => {
            tracing::debug!(peer = %peer, owner = %log_owner, applied = applied.len(), "batch merged");
            ReplicationAck::accepted()
        }
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, owner = %log_owner, error = %e, "batch rejected");
            ReplicationAck::rejected(e.to_string())
        }
        Err(e) => ReplicationAck::rejected(format!("submit task failed: {}", e)),
    }
}

// =============================================================================
// UPSTREAM CLIENT
// =============================================================================

/// An upstream node reached over TCP, one connection per batch.
///
/// `send` blocks on the runtime behind `handle`, so it must be called from
/// a thread outside that runtime's async context (the replicator thread or
/// `spawn_blocking`).
#[derive(Debug)]
pub struct TcpUpstream {
    peer_id: String,
    local_id: String,
    addr: String,
    handle: Handle,
}

impl TcpUpstream {
    /// `peer_id` names the remote node; `local_id` is announced to it.
    pub fn new(
        peer_id: impl Into<String>,
        local_id: impl Into<String>,
        addr: impl Into<String>,
        handle: Handle,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            local_id: local_id.into(),
            addr: addr.into(),
            handle,
        }
    }
}

impl Upstream for TcpUpstream {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn send(&self, batch: &PointBatch, timeout: Duration) -> Result<(), TransportError> {
        let request = ReplicationRequest {
            peer: self.local_id.clone(),
            batch: batch.clone(),
        };
        let exchange = exchange(&self.addr, &request);
        match self.handle.block_on(tokio::time::timeout(timeout, exchange)) {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

async fn exchange(addr: &str, request: &ReplicationRequest) -> Result<(), TransportError> {
    let mut line = serde_json::to_string(request)
        .map_err(|e| TransportError::Rejected(format!("encode failed: {}", e)))?;
    line.push('\n');

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    let (read, mut write) = stream.into_split();
    write
        .write_all(line.as_bytes())
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    let mut reply = String::new();
    let n = BufReader::new(read)
        .read_line(&mut reply)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    if n == 0 {
        return Err(TransportError::Connection(
            "peer closed before acknowledging".to_string(),
        ));
    }

    let ack: ReplicationAck = serde_json::from_str(reply.trim_end())
        .map_err(|e| TransportError::Rejected(format!("malformed ack: {}", e)))?;
    if ack.ok {
        Ok(())
    } else {
        Err(TransportError::Rejected(ack.error.unwrap_or_default()))
    }
}

// =============================================================================
// TESTS
// =============================================================================
