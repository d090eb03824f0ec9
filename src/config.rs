use clap::Parser;
use rand::Rng;

use crate::DEFAULT_PORT;

/// Server configuration, parsed from the command line by the binary and
/// threaded into the core as plain data.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-repl-server", version, about = "In-memory key-value server with replication")]
pub struct Config {
    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// "<host> <port>" of a primary to replicate from. Absent means this
    /// server is itself the primary.
    #[arg(long)]
    pub replicaof: Option<String>,

    /// Directory holding the snapshot file.
    #[arg(long, default_value = ".")]
    pub dir: String,

    /// Snapshot filename inside `dir`.
    #[arg(long, default_value = "dump.rdb")]
    pub dbfilename: String,
}

impl Config {
    pub fn is_replica(&self) -> bool {
        self.replicaof.is_some()
    }

    /// Address of the configured primary, if any.
    pub fn primary_addr(&self) -> crate::Result<Option<String>> {
        let Some(replicaof) = &self.replicaof else {
            return Ok(None);
        };

        let mut parts = replicaof.split_whitespace();
        let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("invalid --replicaof value `{}`; expected \"<host> <port>\"", replicaof).into());
        };

        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid --replicaof port `{}`", port))?;

        Ok(Some(format!("{}:{}", host, port)))
    }
}

/// 40 lowercase hex characters identifying this primary's replication stream.
pub fn generate_replication_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";

    let mut rng = rand::thread_rng();

    (0..40)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}
