use std::future::Future;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cmd::Command;
use crate::config::{generate_replication_id, Config};
use crate::connection::Connection;
use crate::db::{Db, DbHolder};
use crate::frame::Frame;
use crate::replication::{self, ReplicationState, Role};
use crate::snapshot;

struct Listener {
    listener: TcpListener,
    shared: Shared,
}

struct Handler {
    connection: Connection,
    shared: Shared,
}

/// Handle threaded into every connection task: the keyspace, the replication
/// state, and the two config values `CONFIG GET` exposes. Connections refer
/// to the server only through this, never the other way around.
#[derive(Clone)]
pub struct Shared {
    pub db: Db,
    pub replication: Arc<ReplicationState>,
    pub dir: String,
    pub dbfilename: String,
}

/// Runs the server until `shutdown` resolves. Seeds the keyspace from the
/// snapshot file when one exists, and in replica mode also drives the
/// replication link against the configured primary.
pub async fn run(
    listener: TcpListener,
    config: Config,
    shutdown: impl Future,
) -> crate::Result<()> {
    let db_holder = DbHolder::new();

    let role = if config.is_replica() {
        Role::Replica
    } else {
        Role::Primary
    };
    let replication = Arc::new(ReplicationState::new(role, generate_replication_id()));

    let shared = Shared {
        db: db_holder.db(),
        replication,
        dir: config.dir.clone(),
        dbfilename: config.dbfilename.clone(),
    };

    match snapshot::load_from_disk(&shared.db, &config.dir, &config.dbfilename) {
        Ok(true) => info!(keys = shared.db.len(), "loaded snapshot from disk"),
        Ok(false) => debug!("no snapshot file; starting with an empty keyspace"),
        Err(err) => warn!(%err, "snapshot load failed; starting with an empty keyspace"),
    }

    let replication_shutdown = CancellationToken::new();

    if let Some(primary_addr) = config.primary_addr()? {
        let shared = shared.clone();
        let port = config.port;
        let token = replication_shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                res = replication::replica::run(shared, primary_addr, port) => {
                    if let Err(err) = res {
                        error!(%err, "replication link failed");
                    }
                }
                _ = token.cancelled() => {}
            }
        });
    }

    let mut server = Listener { listener, shared };

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(%err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutting down");
            replication_shutdown.cancel();
        }
    }

    Ok(())
}

impl Listener {
    async fn run(&mut self) -> crate::Result<()> {
        loop {
            let socket = self.accept().await?;

            let handler = Handler {
                connection: Connection::new(socket),
                shared: self.shared.clone(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    debug!(%err, "connection closed on error");
                }
            });
        }
    }

    async fn accept(&mut self) -> crate::Result<TcpStream> {
        match self.listener.accept().await {
            Ok((tcp_stream, _)) => Ok(tcp_stream),
            Err(err) => Err(err.into()),
        }
    }
}

impl Handler {
    /// Per-connection loop: frames are processed in arrival order and
    /// replies leave in the same order. Returns when the peer goes away, a
    /// frame fails to decode, or the connection turns into a replica link.
    async fn run(mut self) -> crate::Result<()> {
        loop {
            let maybe_frame = self.connection.read_frame().await?;

            let frame = match maybe_frame {
                Some(frame) => frame,
                None => return Ok(()),
            };

            if !matches!(frame, Frame::Array(_)) {
                let response = Frame::Error("ERR protocol error; expected array".to_string());
                self.connection.write_frame(&response).await?;
                continue;
            }

            match Command::from_frame(frame)? {
                // PSYNC replies, then the connection stops being a client
                // for good: its halves move into the replication engine.
                Command::Psync(psync) => {
                    psync.apply(&mut self.connection, &self.shared).await?;
                    return self.promote().await;
                }
                cmd => cmd.apply(&mut self.connection, &self.shared).await?,
            }
        }
    }

    /// Splits the socket: the write half joins the replica registry for
    /// propagation, the read half becomes a task feeding ACK frames into the
    /// connection's inbound channel.
    async fn promote(self) -> crate::Result<()> {
        let Handler { connection, shared } = self;

        let (stream, residual) = connection.into_parts();
        let (read_half, write_half) = stream.into_split();

        let (replica_id, acks_tx) = shared.replication.register_replica(write_half).await;
        info!(replica_id, "connection promoted to replica");

        replication::run_replica_reader(
            read_half,
            residual,
            acks_tx,
            shared.replication.clone(),
            replica_id,
        )
        .await
    }
}
