//! Primary-side replication: replica registry, write propagation, offset
//! accounting, and `WAIT` coordination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::parse_buffer;
use crate::frame::Frame;

pub mod replica;

/// Per-replica inbound channel capacity. ACKs beyond this while a `WAIT` is
/// draining are dropped, which only costs a recount on the next `WAIT`.
const INBOUND_ACK_CAPACITY: usize = 32;

/// Pause between ACK-channel sweeps while `WAIT` is pending.
const WAIT_SWEEP_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// A promoted replica connection as the registry sees it: the socket's write
/// half for propagation and the inbound channel its reader task feeds.
struct ReplicaHandle {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    acks: Arc<Mutex<mpsc::Receiver<Frame>>>,
}

/// Process-wide replication state, shared by every connection task.
pub struct ReplicationState {
    role: Role,
    replication_id: std::sync::Mutex<String>,
    offset: AtomicU64,
    need_acks: AtomicBool,
    redirect: AtomicBool,
    replicas: Mutex<HashMap<u64, ReplicaHandle>>,
    next_replica_id: AtomicU64,
}

impl ReplicationState {
    pub fn new(role: Role, replication_id: String) -> ReplicationState {
        ReplicationState {
            role,
            replication_id: std::sync::Mutex::new(replication_id),
            offset: AtomicU64::new(0),
            need_acks: AtomicBool::new(false),
            redirect: AtomicBool::new(false),
            replicas: Mutex::new(HashMap::new()),
            next_replica_id: AtomicU64::new(1),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn role_name(&self) -> &'static str {
        match self.role {
            Role::Primary => "master",
            Role::Replica => "slave",
        }
    }

    pub fn replication_id(&self) -> String {
        self.replication_id.lock().unwrap().clone()
    }

    /// A replica adopts the id its primary announces in `FULLRESYNC`.
    pub fn set_replication_id(&self, id: String) {
        *self.replication_id.lock().unwrap() = id;
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub fn add_offset(&self, n: u64) {
        self.offset.fetch_add(n, Ordering::SeqCst);
    }

    /// Marks that a write happened since the last `WAIT`, so the next `WAIT`
    /// has to collect fresh ACKs.
    pub fn note_write(&self) {
        self.need_acks.store(true, Ordering::SeqCst);
    }

    pub(crate) fn redirect_enabled(&self) -> bool {
        self.redirect.load(Ordering::SeqCst)
    }

    pub async fn replica_count(&self) -> usize {
        self.replicas.lock().await.len()
    }

    /// Registers a promoted connection and returns its registry id together
    /// with the sender its reader task must feed ACK frames into.
    pub(crate) async fn register_replica(
        &self,
        writer: OwnedWriteHalf,
    ) -> (u64, mpsc::Sender<Frame>) {
        let (acks_tx, acks_rx) = mpsc::channel(INBOUND_ACK_CAPACITY);
        let id = self.next_replica_id.fetch_add(1, Ordering::SeqCst);

        self.replicas.lock().await.insert(
            id,
            ReplicaHandle {
                writer: Arc::new(Mutex::new(writer)),
                acks: Arc::new(Mutex::new(acks_rx)),
            },
        );

        (id, acks_tx)
    }

    pub(crate) async fn remove_replica(&self, id: u64) {
        if self.replicas.lock().await.remove(&id).is_some() {
            info!(replica_id = id, "replica removed from registry");
        }
    }

    /// Fans a marshaled write out to every replica, advancing the offset by
    /// the frame's length once. A replica whose socket write fails is
    /// dropped; there are no retries.
    pub async fn propagate(&self, raw: Bytes) {
        let mut replicas = self.replicas.lock().await;
        if replicas.is_empty() {
            return;
        }

        // The increment must be visible to WAIT before the bytes can reach
        // any replica.
        self.add_offset(raw.len() as u64);

        let mut dead = Vec::new();
        for (id, handle) in replicas.iter() {
            if let Err(err) = handle.writer.lock().await.write_all(&raw).await {
                warn!(replica_id = *id, %err, "dropping replica after failed propagation");
                dead.push(*id);
            }
        }

        for id in dead {
            replicas.remove(&id);
        }
    }

    /// `WAIT numreplicas timeout_ms`: counts replicas that have acknowledged
    /// the propagated-write high-water mark, bounded by the timeout. Never
    /// fails; a timeout just returns the count so far.
    pub async fn wait(&self, numreplicas: u64, timeout_ms: u64) -> u64 {
        if !self.need_acks.load(Ordering::SeqCst) {
            return self.replica_count().await as u64;
        }

        // ACKs must reach at least the bytes propagated so far; the GETACK
        // frame itself is accounted after the mark is taken, so a caught-up
        // replica passes under either side's bookkeeping.
        let target = self.offset();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        self.redirect.store(true, Ordering::SeqCst);
        self.broadcast_getack().await;

        let mut acked = 0u64;
        'collect: loop {
            // The count may already satisfy the caller (WAIT 0 in
            // particular) without a single ACK arriving.
            if acked >= numreplicas {
                break;
            }

            let channels: Vec<_> = {
                let replicas = self.replicas.lock().await;
                replicas.values().map(|h| h.acks.clone()).collect()
            };

            for channel in channels {
                while let Ok(frame) = channel.lock().await.try_recv() {
                    let Some(ack_offset) = parse_ack(&frame) else {
                        debug!(?frame, "ignoring non-ACK frame from replica");
                        continue;
                    };

                    if ack_offset >= target {
                        acked += 1;
                    }
                    if acked >= numreplicas {
                        break 'collect;
                    }
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline.min(Instant::now() + WAIT_SWEEP_INTERVAL)).await;
        }

        self.need_acks.store(false, Ordering::SeqCst);
        self.redirect.store(false, Ordering::SeqCst);

        acked
    }

    async fn broadcast_getack(&self) {
        let getack = getack_frame().encode();

        let mut replicas = self.replicas.lock().await;
        if replicas.is_empty() {
            return;
        }

        self.add_offset(getack.len() as u64);

        let mut dead = Vec::new();
        for (id, handle) in replicas.iter() {
            if let Err(err) = handle.writer.lock().await.write_all(&getack).await {
                warn!(replica_id = *id, %err, "dropping replica after failed GETACK");
                dead.push(*id);
            }
        }

        for id in dead {
            replicas.remove(&id);
        }
    }
}

pub(crate) fn getack_frame() -> Frame {
    let mut frame = Frame::array();
    frame.push_bulk(Bytes::from_static(b"REPLCONF"));
    frame.push_bulk(Bytes::from_static(b"GETACK"));
    frame.push_bulk(Bytes::from_static(b"*"));

    frame
}

/// Extracts the offset from a `REPLCONF ACK <n>` frame.
fn parse_ack(frame: &Frame) -> Option<u64> {
    let Frame::Array(parts) = frame else {
        return None;
    };

    match &parts[..] {
        [Frame::Bulk(cmd), Frame::Bulk(sub), Frame::Bulk(offset)]
            if cmd.eq_ignore_ascii_case(b"REPLCONF") && sub.eq_ignore_ascii_case(b"ACK") =>
        {
            atoi::atoi(offset)
        }
        _ => None,
    }
}

/// Reader task for a promoted replica connection. ACK frames are forwarded
/// into the bounded inbound channel while a `WAIT` has routing enabled and
/// discarded otherwise, so stale ACKs cannot clog the channel.
pub(crate) async fn run_replica_reader(
    mut read_half: OwnedReadHalf,
    mut buffer: BytesMut,
    acks: mpsc::Sender<Frame>,
    state: Arc<ReplicationState>,
    replica_id: u64,
) -> crate::Result<()> {
    loop {
        loop {
            match parse_buffer(&mut buffer) {
                Ok(Some((frame, _len))) => {
                    if state.redirect_enabled() {
                        if acks.try_send(frame).is_err() {
                            debug!(replica_id, "inbound ACK channel full; dropping frame");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    state.remove_replica(replica_id).await;
                    return Err(err);
                }
            }
        }

        match read_half.read_buf(&mut buffer).await {
            Ok(0) => {
                info!(replica_id, "replica disconnected");
                state.remove_replica(replica_id).await;
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => {
                state.remove_replica(replica_id).await;
                return Err(err.into());
            }
        }
    }
}
