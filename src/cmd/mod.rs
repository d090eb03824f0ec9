use bytes::Bytes;
use thiserror::Error;

mod parse;

use crate::connection::Connection;
use crate::frame::Frame;
use crate::server::Shared;
use crate::snapshot;
use parse::{Parse, ParseError};

#[derive(Debug)]
pub enum Command {
    Ping(Ping),
    Echo(Echo),
    Get(Get),
    Set(Set),
    Keys(Keys),
    Info(Info),
    ConfigGet(ConfigGet),
    CommandDocs(CommandDocs),
    Replconf(Replconf),
    Psync(Psync),
    Wait(Wait),
    /// A recognized command whose arguments failed validation; replies with
    /// an error frame and keeps the connection open.
    Invalid(Invalid),
    Unknown(Unknown),
}

/// Argument-level failures for recognized commands. These become `-ERR`
/// replies, never connection errors.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR unknown subcommand or wrong number of arguments")]
    UnknownSubcommand,
}

impl CommandError {
    fn wrong_arity(name: &str) -> CommandError {
        CommandError::WrongArity(name.to_lowercase())
    }
}

#[derive(Debug, Default)]
pub struct Ping {
    msg: Option<String>,
}

#[derive(Debug)]
pub struct Echo {
    msg: Option<String>,
}

#[derive(Debug)]
pub struct Get {
    pub key: String,
}

#[derive(Debug)]
pub struct Set {
    pub key: String,
    pub value: Bytes,
    pub ttl_ms: Option<u64>,
    /// Wire bytes of the request, kept for verbatim propagation to replicas.
    raw: Bytes,
}

#[derive(Debug)]
pub struct Keys {
    pattern: String,
}

#[derive(Debug)]
pub struct Info {
    sections: Vec<String>,
}

#[derive(Debug)]
pub struct ConfigGet {
    parameter: String,
}

#[derive(Debug)]
pub struct CommandDocs;

#[derive(Debug)]
pub struct Replconf {
    subcommand: String,
    arg: String,
}

#[derive(Debug)]
pub struct Psync {
    // Replicas currently always request a full resync with `? -1`; the
    // fields are carried for the day partial resync shows up.
    pub replication_id: String,
    pub offset: String,
}

#[derive(Debug)]
pub struct Wait {
    numreplicas: u64,
    timeout_ms: u64,
}

#[derive(Debug)]
pub struct Invalid {
    message: String,
}

#[derive(Debug)]
pub struct Unknown {
    name: String,
}

impl Command {
    /// Turns a decoded request frame into a command. Argument problems in
    /// recognized commands come back as `Command::Invalid` so the caller can
    /// reply instead of dropping the connection; only a non-array frame is a
    /// hard error.
    pub fn from_frame(frame: Frame) -> crate::Result<Command> {
        let raw = frame.encode();
        let mut parse = Parse::new(frame)?;

        // Only a Bulk in the head position denotes a command invocation; an
        // empty array or any other head frame yields an empty command name
        // and no arguments.
        let command_name = match parse.next_frame() {
            Some(Frame::Bulk(name)) => String::from_utf8_lossy(&name).to_uppercase(),
            _ => return Ok(Command::Unknown(Unknown::new(String::new()))),
        };

        let parsed: Result<Command, CommandError> = match command_name.as_str() {
            "PING" => Ping::parse_frames(&mut parse).map(Command::Ping),
            "ECHO" => Echo::parse_frames(&mut parse).map(Command::Echo),
            "GET" => Get::parse_frames(&mut parse).map(Command::Get),
            "SET" => Set::parse_frames(&mut parse, raw).map(Command::Set),
            "KEYS" => Keys::parse_frames(&mut parse).map(Command::Keys),
            "INFO" => Info::parse_frames(&mut parse).map(Command::Info),
            "CONFIG" => ConfigGet::parse_frames(&mut parse).map(Command::ConfigGet),
            "COMMAND" => CommandDocs::parse_frames(&mut parse).map(Command::CommandDocs),
            "REPLCONF" => Replconf::parse_frames(&mut parse).map(Command::Replconf),
            "PSYNC" => Psync::parse_frames(&mut parse).map(Command::Psync),
            "WAIT" => Wait::parse_frames(&mut parse).map(Command::Wait),
            _ => return Ok(Command::Unknown(Unknown::new(command_name))),
        };

        let command = match parsed {
            Ok(command) => command,
            Err(err) => return Ok(Command::Invalid(Invalid::new(err.to_string()))),
        };

        if parse.finish().is_err() {
            let err = CommandError::wrong_arity(&command_name);
            return Ok(Command::Invalid(Invalid::new(err.to_string())));
        }

        Ok(command)
    }

    pub(crate) async fn apply(self, conn: &mut Connection, shared: &Shared) -> crate::Result<()> {
        use Command::*;

        match self {
            Ping(cmd) => cmd.apply(conn).await,
            Echo(cmd) => cmd.apply(conn).await,
            Get(cmd) => cmd.apply(conn, shared).await,
            Set(cmd) => cmd.apply(conn, shared).await,
            Keys(cmd) => cmd.apply(conn, shared).await,
            Info(cmd) => cmd.apply(conn, shared).await,
            ConfigGet(cmd) => cmd.apply(conn, shared).await,
            CommandDocs(cmd) => cmd.apply(conn).await,
            Replconf(cmd) => cmd.apply(conn, shared).await,
            Psync(cmd) => cmd.apply(conn, shared).await,
            Wait(cmd) => cmd.apply(conn, shared).await,
            Invalid(cmd) => cmd.apply(conn).await,
            Unknown(cmd) => cmd.apply(conn).await,
        }
    }
}

impl Ping {
    pub fn new(msg: Option<String>) -> Ping {
        Ping { msg }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_bulk(Bytes::from_static(b"PING"));
        if let Some(msg) = self.msg {
            frame.push_bulk(Bytes::from(msg.into_bytes()));
        }

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Ping, CommandError> {
        match parse.next_string() {
            Ok(msg) => Ok(Ping::new(Some(msg))),
            Err(ParseError::EndOfStream) => Ok(Ping::default()),
            Err(_) => Err(CommandError::Syntax),
        }
    }

    async fn apply(self, conn: &mut Connection) -> crate::Result<()> {
        let response = match self.msg {
            Some(msg) => Frame::Simple(msg),
            None => Frame::Simple("PONG".to_string()),
        };

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Echo {
    pub fn new(msg: impl ToString) -> Echo {
        Echo {
            msg: Some(msg.to_string()),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_bulk(Bytes::from_static(b"ECHO"));
        if let Some(msg) = self.msg {
            frame.push_bulk(Bytes::from(msg.into_bytes()));
        }

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Echo, CommandError> {
        match parse.next_string() {
            Ok(msg) => Ok(Echo { msg: Some(msg) }),
            Err(ParseError::EndOfStream) => Ok(Echo { msg: None }),
            Err(_) => Err(CommandError::Syntax),
        }
    }

    async fn apply(self, conn: &mut Connection) -> crate::Result<()> {
        let response = Frame::Simple(self.msg.unwrap_or_default());

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Get {
    pub fn new(key: impl ToString) -> Get {
        Get {
            key: key.to_string(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_bulk(Bytes::from_static(b"GET"));
        frame.push_bulk(Bytes::from(self.key.into_bytes()));

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Get, CommandError> {
        let key = parse
            .next_string()
            .map_err(|_| CommandError::wrong_arity("get"))?;

        Ok(Get { key })
    }

    async fn apply(self, conn: &mut Connection, shared: &Shared) -> crate::Result<()> {
        let response = match shared.db.get(&self.key) {
            Some(value) => Frame::Bulk(value),
            None => Frame::Null,
        };

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Set {
    pub fn new(key: impl ToString, value: Bytes, ttl_ms: Option<u64>) -> Set {
        let mut set = Set {
            key: key.to_string(),
            value,
            ttl_ms,
            raw: Bytes::new(),
        };
        set.raw = set.request_frame().encode();

        set
    }

    pub fn into_frame(self) -> Frame {
        self.request_frame()
    }

    fn request_frame(&self) -> Frame {
        let mut frame = Frame::array();

        frame.push_bulk(Bytes::from_static(b"SET"));
        frame.push_bulk(Bytes::from(self.key.clone().into_bytes()));
        frame.push_bulk(self.value.clone());
        if let Some(ttl_ms) = self.ttl_ms {
            frame.push_bulk(Bytes::from_static(b"PX"));
            frame.push_bulk(Bytes::from(ttl_ms.to_string().into_bytes()));
        }

        frame
    }

    fn parse_frames(parse: &mut Parse, raw: Bytes) -> Result<Set, CommandError> {
        let key = parse
            .next_string()
            .map_err(|_| CommandError::wrong_arity("set"))?;
        let value = parse
            .next_bytes()
            .map_err(|_| CommandError::wrong_arity("set"))?;

        let ttl_ms = match parse.next_string() {
            Ok(option) => {
                // PX is the only supported expiry option; notably EX is not.
                if !option.eq_ignore_ascii_case("px") {
                    return Err(CommandError::Syntax);
                }

                match parse.next_int() {
                    Ok(ms) => Some(ms),
                    Err(ParseError::EndOfStream) => {
                        return Err(CommandError::wrong_arity("set"));
                    }
                    Err(_) => return Err(CommandError::NotAnInteger),
                }
            }
            Err(ParseError::EndOfStream) => None,
            Err(_) => return Err(CommandError::Syntax),
        };

        Ok(Set {
            key,
            value,
            ttl_ms,
            raw,
        })
    }

    /// The keyspace mutation alone, shared between the primary handler and
    /// the replica apply loop.
    pub(crate) fn execute(&self, shared: &Shared) {
        shared
            .db
            .set(self.key.clone(), self.value.clone(), self.ttl_ms);
    }

    async fn apply(self, conn: &mut Connection, shared: &Shared) -> crate::Result<()> {
        shared.replication.note_write();
        shared.replication.propagate(self.raw.clone()).await;
        self.execute(shared);

        let response = Frame::Simple("OK".to_string());
        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Keys {
    fn parse_frames(parse: &mut Parse) -> Result<Keys, CommandError> {
        let pattern = parse
            .next_string()
            .map_err(|_| CommandError::wrong_arity("keys"))?;

        Ok(Keys { pattern })
    }

    async fn apply(self, conn: &mut Connection, shared: &Shared) -> crate::Result<()> {
        let mut response = Frame::array();
        for key in shared.db.keys(&self.pattern) {
            response.push_bulk(Bytes::from(key.into_bytes()));
        }

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Info {
    fn parse_frames(parse: &mut Parse) -> Result<Info, CommandError> {
        let mut sections = Vec::new();
        loop {
            match parse.next_string() {
                Ok(section) => sections.push(section),
                Err(ParseError::EndOfStream) => break,
                Err(_) => return Err(CommandError::Syntax),
            }
        }

        Ok(Info { sections })
    }

    async fn apply(self, conn: &mut Connection, shared: &Shared) -> crate::Result<()> {
        let response = match &self.sections[..] {
            [section] if section.eq_ignore_ascii_case("replication") => {
                let replication = &shared.replication;
                let body = format!(
                    "# Replication\nrole:{}\nmaster_replid:{}\nmaster_repl_offset:{}\n",
                    replication.role_name(),
                    replication.replication_id(),
                    replication.offset(),
                );

                Frame::Bulk(Bytes::from(body.into_bytes()))
            }
            _ => Frame::Null,
        };

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl ConfigGet {
    fn parse_frames(parse: &mut Parse) -> Result<ConfigGet, CommandError> {
        let subcommand = parse
            .next_string()
            .map_err(|_| CommandError::UnknownSubcommand)?;

        if !subcommand.eq_ignore_ascii_case("get") {
            return Err(CommandError::UnknownSubcommand);
        }

        let parameter = parse
            .next_string()
            .map_err(|_| CommandError::UnknownSubcommand)?;

        Ok(ConfigGet { parameter })
    }

    async fn apply(self, conn: &mut Connection, shared: &Shared) -> crate::Result<()> {
        let value = match self.parameter.to_lowercase().as_str() {
            "dir" => shared.dir.clone(),
            "dbfilename" => shared.dbfilename.clone(),
            _ => {
                let err = CommandError::UnknownSubcommand;
                conn.write_frame(&Frame::Error(err.to_string())).await?;
                return Ok(());
            }
        };

        let mut response = Frame::array();
        response.push_string(self.parameter.to_lowercase());
        response.push_string(value);

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl CommandDocs {
    fn parse_frames(parse: &mut Parse) -> Result<CommandDocs, CommandError> {
        // COMMAND takes arbitrary subcommands; all of them get the
        // placeholder reply.
        while parse.next_bytes().is_ok() {}

        Ok(CommandDocs)
    }

    async fn apply(self, conn: &mut Connection) -> crate::Result<()> {
        conn.write_frame(&Frame::Null).await?;

        Ok(())
    }
}

impl Replconf {
    pub fn new(subcommand: impl ToString, arg: impl ToString) -> Replconf {
        Replconf {
            subcommand: subcommand.to_string(),
            arg: arg.to_string(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_bulk(Bytes::from_static(b"REPLCONF"));
        frame.push_bulk(Bytes::from(self.subcommand.into_bytes()));
        frame.push_bulk(Bytes::from(self.arg.into_bytes()));

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Replconf, CommandError> {
        let subcommand = parse
            .next_string()
            .map_err(|_| CommandError::wrong_arity("replconf"))?;
        let arg = parse
            .next_string()
            .map_err(|_| CommandError::wrong_arity("replconf"))?;

        Ok(Replconf { subcommand, arg })
    }

    pub(crate) fn is_getack(&self) -> bool {
        self.subcommand.eq_ignore_ascii_case("getack") && self.arg == "*"
    }

    fn is_ack(&self) -> bool {
        self.subcommand.eq_ignore_ascii_case("ack")
    }

    pub(crate) async fn apply(self, conn: &mut Connection, shared: &Shared) -> crate::Result<()> {
        if self.is_getack() {
            // Replica side: report how many bytes of the primary's stream
            // have been processed so far.
            let mut response = Frame::array();
            response.push_bulk(Bytes::from_static(b"REPLCONF"));
            response.push_bulk(Bytes::from_static(b"ACK"));
            response.push_bulk(Bytes::from(
                shared.replication.offset().to_string().into_bytes(),
            ));

            conn.write_frame(&response).await?;
        } else if self.is_ack() {
            // Primary side: ACKs are consumed by the WAIT coordinator from
            // the replica connection's inbound channel, never answered.
        } else {
            // listening-port / capa during the handshake.
            conn.write_frame(&Frame::Simple("OK".to_string())).await?;
        }

        Ok(())
    }
}

impl Psync {
    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_bulk(Bytes::from_static(b"PSYNC"));
        frame.push_bulk(Bytes::from(self.replication_id.into_bytes()));
        frame.push_bulk(Bytes::from(self.offset.into_bytes()));

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Psync, CommandError> {
        let replication_id = parse
            .next_string()
            .map_err(|_| CommandError::wrong_arity("psync"))?;
        let offset = parse
            .next_string()
            .map_err(|_| CommandError::wrong_arity("psync"))?;

        Ok(Psync {
            replication_id,
            offset,
        })
    }

    /// Writes the full-resynchronization reply. The caller is responsible
    /// for promoting the connection to a replica afterwards.
    pub(crate) async fn apply(self, conn: &mut Connection, shared: &Shared) -> crate::Result<()> {
        let header = format!(
            "FULLRESYNC {} {}",
            shared.replication.replication_id(),
            shared.replication.offset(),
        );

        conn.write_frame(&Frame::Simple(header)).await?;
        conn.write_frame(&Frame::Snapshot(snapshot::empty_snapshot()))
            .await?;

        Ok(())
    }
}

impl Wait {
    pub fn new(numreplicas: u64, timeout_ms: u64) -> Wait {
        Wait {
            numreplicas,
            timeout_ms,
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_bulk(Bytes::from_static(b"WAIT"));
        frame.push_bulk(Bytes::from(self.numreplicas.to_string().into_bytes()));
        frame.push_bulk(Bytes::from(self.timeout_ms.to_string().into_bytes()));

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Wait, CommandError> {
        let numreplicas = match parse.next_int() {
            Ok(n) => n,
            Err(ParseError::EndOfStream) => return Err(CommandError::wrong_arity("wait")),
            Err(_) => return Err(CommandError::NotAnInteger),
        };
        let timeout_ms = match parse.next_int() {
            Ok(n) => n,
            Err(ParseError::EndOfStream) => return Err(CommandError::wrong_arity("wait")),
            Err(_) => return Err(CommandError::NotAnInteger),
        };

        Ok(Wait {
            numreplicas,
            timeout_ms,
        })
    }

    async fn apply(self, conn: &mut Connection, shared: &Shared) -> crate::Result<()> {
        let acked = shared
            .replication
            .wait(self.numreplicas, self.timeout_ms)
            .await;

        conn.write_frame(&Frame::Integer(acked)).await?;

        Ok(())
    }
}

impl Invalid {
    fn new(message: impl ToString) -> Invalid {
        Invalid {
            message: message.to_string(),
        }
    }

    async fn apply(self, conn: &mut Connection) -> crate::Result<()> {
        conn.write_frame(&Frame::Error(self.message)).await?;

        Ok(())
    }
}

impl Unknown {
    fn new(name: impl ToString) -> Unknown {
        Unknown {
            name: name.to_string(),
        }
    }

    async fn apply(self, conn: &mut Connection) -> crate::Result<()> {
        let response = Frame::Error(format!("Unknown command {}", self.name));

        conn.write_frame(&response).await?;

        Ok(())
    }
}
