//! End-to-end scenarios over real sockets: wire-level command replies, the
//! replica handshake, write propagation, and WAIT coordination.

use std::future::pending;
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use kv_repl::client::Client;
use kv_repl::config::Config;
use kv_repl::frame::Frame;
use kv_repl::{server, snapshot};

/// Binds an ephemeral port and runs a server on it with the given extra CLI
/// arguments.
async fn start_server(extra_args: &[&str]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut argv = vec![
        "kv-repl-server".to_string(),
        "--port".to_string(),
        addr.port().to_string(),
    ];
    argv.extend(extra_args.iter().map(|arg| arg.to_string()));
    let config = Config::parse_from(argv);

    tokio::spawn(async move {
        server::run(listener, config, pending::<()>()).await.unwrap();
    });

    addr
}

/// Raw socket with frame-boundary-aware reads, for driving the server at the
/// byte level.
struct TestConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TestConn {
    async fn connect(addr: SocketAddr) -> TestConn {
        TestConn {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "peer closed while awaiting data");
        self.buf.extend_from_slice(&chunk[..n]);
    }

    /// Reads exactly one frame and returns its wire bytes; later frames stay
    /// buffered.
    async fn read_frame(&mut self) -> Vec<u8> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor = Cursor::new(&self.buf[..]);
                if Frame::check(&mut cursor).is_ok() {
                    let len = cursor.position() as usize;
                    return self.buf.drain(..len).collect();
                }
            }

            self.fill().await;
        }
    }

    /// Reads one CRLF-terminated line, e.g. the `$<len>` snapshot header.
    async fn read_line(&mut self) -> Vec<u8> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                return line;
            }

            self.fill().await;
        }
    }

    async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            self.fill().await;
        }

        self.buf.drain(..n).collect()
    }

    /// Runs the replica side of the handshake, leaving the connection
    /// promoted on the server.
    async fn handshake_as_replica(&mut self) {
        self.send(b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(self.read_frame().await, b"+PONG\r\n");

        self.send(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n")
            .await;
        assert_eq!(self.read_frame().await, b"+OK\r\n");

        self.send(b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n")
            .await;
        assert_eq!(self.read_frame().await, b"+OK\r\n");

        self.send(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n").await;

        let fullresync = self.read_frame().await;
        let text = String::from_utf8(fullresync).unwrap();
        assert!(text.starts_with("+FULLRESYNC "), "got {:?}", text);

        let header = String::from_utf8(self.read_line().await).unwrap();
        assert!(header.starts_with('$'), "got {:?}", header);
        let len: usize = header[1..header.len() - 2].parse().unwrap();

        let payload = self.read_exact(len).await;
        assert_eq!(payload, snapshot::empty_snapshot());

        // Promotion happens right after the snapshot is written; give the
        // registry a moment before relying on propagation.
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn echo_round_trip_at_the_byte_level() {
    let addr = start_server(&[]).await;
    let mut conn = TestConn::connect(addr).await;

    conn.send(b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n").await;

    assert_eq!(conn.read_frame().await, b"+hey\r\n");
}

#[tokio::test]
async fn ping_with_and_without_payload() {
    let addr = start_server(&[]).await;
    let mut conn = TestConn::connect(addr).await;

    conn.send(b"*1\r\n$4\r\nPING\r\n").await;
    assert_eq!(conn.read_frame().await, b"+PONG\r\n");

    conn.send(b"*2\r\n$4\r\nPING\r\n$5\r\nhello\r\n").await;
    assert_eq!(conn.read_frame().await, b"+hello\r\n");
}

#[tokio::test]
async fn set_then_get_replies_ok_then_value() {
    let addr = start_server(&[]).await;
    let mut conn = TestConn::connect(addr).await;

    conn.send(b"*3\r\n$3\r\nSET\r\n$1\r\nx\r\n$1\r\n1\r\n").await;
    assert_eq!(conn.read_frame().await, b"+OK\r\n");

    conn.send(b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n").await;
    assert_eq!(conn.read_frame().await, b"$1\r\n1\r\n");
}

#[tokio::test]
async fn get_of_missing_key_is_null_bulk() {
    let addr = start_server(&[]).await;
    let mut conn = TestConn::connect(addr).await;

    conn.send(b"*2\r\n$3\r\nGET\r\n$7\r\nmissing\r\n").await;

    assert_eq!(conn.read_frame().await, b"$-1\r\n");
}

#[tokio::test]
async fn set_with_px_expires() {
    let addr = start_server(&[]).await;
    let mut client = Client::connect(addr).await.unwrap();

    client.set_px("k", "v".into(), 100).await.unwrap();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(client.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn command_errors_keep_the_connection_usable() {
    let addr = start_server(&[]).await;
    let mut conn = TestConn::connect(addr).await;

    conn.send(b"*2\r\n$3\r\nSET\r\n$1\r\nk\r\n").await;
    assert_eq!(
        conn.read_frame().await,
        b"-ERR wrong number of arguments for 'set' command\r\n"
    );

    conn.send(b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nEX\r\n$2\r\n10\r\n")
        .await;
    assert_eq!(conn.read_frame().await, b"-ERR syntax error\r\n");

    conn.send(b"*1\r\n$3\r\nFOO\r\n").await;
    assert_eq!(conn.read_frame().await, b"-Unknown command FOO\r\n");

    // Still alive after three error replies.
    conn.send(b"*1\r\n$4\r\nPING\r\n").await;
    assert_eq!(conn.read_frame().await, b"+PONG\r\n");
}

#[tokio::test]
async fn keys_lists_live_keys() {
    let addr = start_server(&[]).await;
    let mut conn = TestConn::connect(addr).await;

    conn.send(b"*3\r\n$3\r\nSET\r\n$5\r\napple\r\n$1\r\n1\r\n")
        .await;
    conn.read_frame().await;
    conn.send(b"*3\r\n$3\r\nSET\r\n$5\r\ngrape\r\n$1\r\n2\r\n")
        .await;
    conn.read_frame().await;

    conn.send(b"*2\r\n$4\r\nKEYS\r\n$1\r\n*\r\n").await;
    let reply = String::from_utf8(conn.read_frame().await).unwrap();

    assert!(reply.starts_with("*2\r\n"), "got {:?}", reply);
    assert!(reply.contains("apple"));
    assert!(reply.contains("grape"));

    // Substring filtering, no glob.
    conn.send(b"*2\r\n$4\r\nKEYS\r\n$3\r\napp\r\n").await;
    let reply = String::from_utf8(conn.read_frame().await).unwrap();
    assert!(reply.starts_with("*1\r\n"));
    assert!(reply.contains("apple"));
}

#[tokio::test]
async fn config_get_exposes_dir_and_dbfilename() {
    let addr = start_server(&["--dir", "/tmp/data", "--dbfilename", "snap.rdb"]).await;
    let mut conn = TestConn::connect(addr).await;

    conn.send(b"*3\r\n$6\r\nCONFIG\r\n$3\r\nGET\r\n$3\r\ndir\r\n")
        .await;
    assert_eq!(conn.read_frame().await, b"*2\r\n+dir\r\n+/tmp/data\r\n");

    conn.send(b"*3\r\n$6\r\nCONFIG\r\n$3\r\nGET\r\n$10\r\ndbfilename\r\n")
        .await;
    assert_eq!(conn.read_frame().await, b"*2\r\n+dbfilename\r\n+snap.rdb\r\n");

    conn.send(b"*3\r\n$6\r\nCONFIG\r\n$3\r\nSET\r\n$3\r\ndir\r\n")
        .await;
    assert_eq!(
        conn.read_frame().await,
        b"-ERR unknown subcommand or wrong number of arguments\r\n"
    );
}

#[tokio::test]
async fn info_replication_reports_primary_identity() {
    let addr = start_server(&[]).await;
    let mut conn = TestConn::connect(addr).await;

    conn.send(b"*2\r\n$4\r\nINFO\r\n$11\r\nreplication\r\n").await;
    let reply = String::from_utf8(conn.read_frame().await).unwrap();

    assert!(reply.contains("# Replication\n"));
    assert!(reply.contains("role:master\n"));
    assert!(reply.contains("master_repl_offset:0\n"));

    let replid_line = reply
        .lines()
        .find_map(|line| line.strip_prefix("master_replid:"))
        .expect("missing master_replid line");
    assert_eq!(replid_line.len(), 40);
    assert!(replid_line.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn replica_handshake_emits_fullresync_and_snapshot() {
    let addr = start_server(&[]).await;
    let mut replica = TestConn::connect(addr).await;

    replica.send(b"*1\r\n$4\r\nPING\r\n").await;
    assert_eq!(replica.read_frame().await, b"+PONG\r\n");

    replica
        .send(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n")
        .await;
    assert_eq!(replica.read_frame().await, b"+OK\r\n");

    replica
        .send(b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n")
        .await;
    assert_eq!(replica.read_frame().await, b"+OK\r\n");

    replica
        .send(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
        .await;

    let fullresync = String::from_utf8(replica.read_frame().await).unwrap();
    let parts: Vec<&str> = fullresync
        .trim_start_matches('+')
        .trim_end()
        .split(' ')
        .collect();
    assert_eq!(parts[0], "FULLRESYNC");
    assert_eq!(parts[1].len(), 40);
    assert_eq!(parts[2], "0");

    let expected = snapshot::empty_snapshot();
    let header = String::from_utf8(replica.read_line().await).unwrap();
    assert_eq!(header, format!("${}\r\n", expected.len()));

    // The payload is raw bytes with no trailing CRLF; exactly `len` bytes
    // arrive and the buffer is empty afterwards.
    let payload = replica.read_exact(expected.len()).await;
    assert_eq!(payload, expected);
    assert!(replica.buf.is_empty());
}

#[tokio::test]
async fn writes_propagate_to_replicas_verbatim() {
    let addr = start_server(&[]).await;

    let mut replica = TestConn::connect(addr).await;
    replica.handshake_as_replica().await;

    let mut client = TestConn::connect(addr).await;
    client.send(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n").await;
    assert_eq!(client.read_frame().await, b"+OK\r\n");

    let propagated = replica.read_frame().await;
    assert_eq!(propagated, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");

    // The primary's offset advanced by exactly the propagated byte count.
    client.send(b"*2\r\n$4\r\nINFO\r\n$11\r\nreplication\r\n").await;
    let info = String::from_utf8(client.read_frame().await).unwrap();
    assert!(
        info.contains(&format!("master_repl_offset:{}\n", propagated.len())),
        "got {:?}",
        info
    );
}

#[tokio::test]
async fn wait_with_no_pending_write_returns_replica_count_immediately() {
    let addr = start_server(&[]).await;

    let mut replica = TestConn::connect(addr).await;
    replica.handshake_as_replica().await;

    let mut client = Client::connect(addr).await.unwrap();

    let started = std::time::Instant::now();
    let acked = client.wait(3, 1000).await.unwrap();

    assert_eq!(acked, 1);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn wait_collects_acks_from_replicas() {
    let addr = start_server(&[]).await;

    let mut replica = TestConn::connect(addr).await;
    replica.handshake_as_replica().await;

    let mut client = Client::connect(addr).await.unwrap();
    client.set("k", "v".into()).await.unwrap();

    let propagated = replica.read_frame().await;
    let write_offset = propagated.len();

    let waiter = tokio::spawn(async move { client.wait(1, 2000).await.unwrap() });

    // The GETACK broadcast arrives once WAIT starts coordinating.
    let getack = replica.read_frame().await;
    assert_eq!(
        getack,
        b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n"
    );

    let ack = format!(
        "*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n${}\r\n{}\r\n",
        write_offset.to_string().len(),
        write_offset
    );
    replica.send(ack.as_bytes()).await;

    assert_eq!(waiter.await.unwrap(), 1);
}

#[tokio::test]
async fn wait_for_zero_replicas_returns_immediately_despite_pending_writes() {
    let addr = start_server(&[]).await;

    let mut replica = TestConn::connect(addr).await;
    replica.handshake_as_replica().await;

    let mut client = Client::connect(addr).await.unwrap();
    client.set("k", "v".into()).await.unwrap();

    // A target of zero is satisfied before any replica answers the GETACK.
    let started = std::time::Instant::now();
    assert_eq!(client.wait(0, 1000).await.unwrap(), 0);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn wait_times_out_when_acks_fall_short() {
    let addr = start_server(&[]).await;

    let mut replica = TestConn::connect(addr).await;
    replica.handshake_as_replica().await;

    let mut client = Client::connect(addr).await.unwrap();
    client.set("k", "v".into()).await.unwrap();

    // The replica never answers the GETACK.
    let started = std::time::Instant::now();
    let acked = client.wait(1, 300).await.unwrap();

    assert_eq!(acked, 0);
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn full_replication_between_two_servers() {
    let primary = start_server(&[]).await;
    let replicaof = format!("127.0.0.1 {}", primary.port());
    let replica = start_server(&["--replicaof", &replicaof]).await;

    // Let the handshake and snapshot transfer finish.
    sleep(Duration::from_millis(300)).await;

    let mut primary_client = Client::connect(primary).await.unwrap();
    primary_client.set("k", "v".into()).await.unwrap();

    sleep(Duration::from_millis(200)).await;

    let mut replica_client = Client::connect(replica).await.unwrap();
    assert_eq!(
        replica_client.get("k").await.unwrap().as_deref(),
        Some(&b"v"[..])
    );

    // The replica is caught up, so its ACK satisfies WAIT.
    assert_eq!(primary_client.wait(1, 1000).await.unwrap(), 1);

    let mut conn = TestConn::connect(replica).await;
    conn.send(b"*2\r\n$4\r\nINFO\r\n$11\r\nreplication\r\n").await;
    let info = String::from_utf8(conn.read_frame().await).unwrap();
    assert!(info.contains("role:slave\n"), "got {:?}", info);
}

#[tokio::test]
async fn array_with_a_simple_head_is_not_dispatched_as_a_command() {
    let addr = start_server(&[]).await;
    let mut conn = TestConn::connect(addr).await;

    // A command invocation requires a Bulk head; `+PING` in head position
    // must not be treated as PING.
    conn.send(b"*1\r\n+PING\r\n").await;
    assert_eq!(conn.read_frame().await, b"-Unknown command \r\n");

    conn.send(b"*1\r\n$4\r\nPING\r\n").await;
    assert_eq!(conn.read_frame().await, b"+PONG\r\n");
}

#[tokio::test]
async fn non_array_frames_get_an_error_reply() {
    let addr = start_server(&[]).await;
    let mut conn = TestConn::connect(addr).await;

    conn.send(b"+PING\r\n").await;
    let reply = conn.read_frame().await;

    assert!(reply.starts_with(b"-"), "got {:?}", reply);

    // And the connection stays open.
    conn.send(b"*1\r\n$4\r\nPING\r\n").await;
    assert_eq!(conn.read_frame().await, b"+PONG\r\n");
}
