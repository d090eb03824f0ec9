//! Replica-side startup: handshake against the configured primary, snapshot
//! bootstrap, then the propagated-command apply loop.

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::cmd::{Command, Ping, Replconf};
use crate::connection::Connection;
use crate::frame::Frame;
use crate::server::Shared;
use crate::snapshot;

/// Connects to the primary, performs the four-step handshake, loads the
/// transmitted snapshot, and then applies propagated commands until the link
/// drops. Runs for the lifetime of the replica.
pub async fn run(shared: Shared, primary_addr: String, listening_port: u16) -> crate::Result<()> {
    let socket = TcpStream::connect(&primary_addr).await?;
    let mut conn = Connection::new(socket);

    handshake(&mut conn, &shared, listening_port).await?;

    let snapshot_bytes = conn.read_snapshot().await?;
    match snapshot::load(&shared.db, &snapshot_bytes) {
        Ok(()) => info!(
            bytes = snapshot_bytes.len(),
            "loaded snapshot from primary"
        ),
        Err(err) => warn!(%err, "snapshot from primary failed to load; continuing with current keyspace"),
    }

    info!(%primary_addr, "replication link established");
    apply_loop(&mut conn, &shared).await
}

async fn handshake(
    conn: &mut Connection,
    shared: &Shared,
    listening_port: u16,
) -> crate::Result<()> {
    conn.write_frame(&Ping::new(None).into_frame()).await?;
    expect_simple(conn.read_frame().await?, "PONG")?;

    let replconf = Replconf::new("listening-port", listening_port);
    conn.write_frame(&replconf.into_frame()).await?;
    expect_simple(conn.read_frame().await?, "OK")?;

    let replconf = Replconf::new("capa", "psync2");
    conn.write_frame(&replconf.into_frame()).await?;
    expect_simple(conn.read_frame().await?, "OK")?;

    let mut psync = Frame::array();
    psync.push_bulk(Bytes::from_static(b"PSYNC"));
    psync.push_bulk(Bytes::from_static(b"?"));
    psync.push_bulk(Bytes::from_static(b"-1"));
    conn.write_frame(&psync).await?;

    let reply = conn.read_frame().await?;
    let Some(Frame::Simple(header)) = reply else {
        return Err(format!("handshake failed; expected FULLRESYNC, got {:?}", reply).into());
    };

    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("FULLRESYNC"), Some(id), Some(_offset)) => {
            shared.replication.set_replication_id(id.to_string());
            Ok(())
        }
        _ => Err(format!("handshake failed; malformed FULLRESYNC header `{}`", header).into()),
    }
}

fn expect_simple(frame: Option<Frame>, want: &str) -> crate::Result<()> {
    match frame {
        Some(Frame::Simple(s)) if s == want => Ok(()),
        other => Err(format!("handshake failed; expected +{}, got {:?}", want, other).into()),
    }
}

/// Every frame after the snapshot is a command from the primary. Writes are
/// applied silently; only `REPLCONF GETACK *` is answered, with the offset
/// accumulated *before* that frame, which is why the wire length is added
/// after handling.
async fn apply_loop(conn: &mut Connection, shared: &Shared) -> crate::Result<()> {
    while let Some((frame, wire_len)) = conn.read_frame_counted().await? {
        match Command::from_frame(frame)? {
            Command::Set(set) => set.execute(shared),
            Command::Replconf(replconf) if replconf.is_getack() => {
                replconf.apply(conn, shared).await?;
            }
            Command::Ping(_) => {}
            other => debug!(?other, "ignoring command from primary"),
        }

        shared.replication.add_offset(wire_len as u64);
    }

    warn!("primary closed the replication link");
    Ok(())
}
