pub mod client;
pub mod cmd;
pub mod config;
pub mod connection;
pub mod db;
pub mod frame;
pub mod replication;
pub mod server;
pub mod snapshot;

pub const DEFAULT_PORT: u16 = 6379;

pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;
