use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::cmd::{Get, Ping, Set, Wait};
use crate::connection::Connection;
use crate::frame::Frame;

/// Minimal client over one persistent connection.
pub struct Client {
    connection: Connection,
}

impl Client {
    pub async fn connect<T: ToSocketAddrs>(addr: T) -> crate::Result<Client> {
        let socket = TcpStream::connect(addr).await?;
        let connection = Connection::new(socket);

        Ok(Client { connection })
    }

    pub async fn ping(&mut self) -> crate::Result<String> {
        let frame = Ping::new(None).into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Simple(string) => Ok(string),
            frame => Err(format!("unexpected reply to PING: {:?}", frame).into()),
        }
    }

    pub async fn get(&mut self, key: &str) -> crate::Result<Option<Bytes>> {
        let frame = Get::new(key).into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Bulk(value) => Ok(Some(value)),
            Frame::Null => Ok(None),
            frame => Err(format!("unexpected reply to GET: {:?}", frame).into()),
        }
    }

    pub async fn set(&mut self, key: &str, value: Bytes) -> crate::Result<()> {
        self.set_frame(Set::new(key, value, None).into_frame()).await
    }

    /// SET with a relative expiry; the server stores `now + ttl_ms`.
    pub async fn set_px(&mut self, key: &str, value: Bytes, ttl_ms: u64) -> crate::Result<()> {
        self.set_frame(Set::new(key, value, Some(ttl_ms)).into_frame())
            .await
    }

    async fn set_frame(&mut self, frame: Frame) -> crate::Result<()> {
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Simple(s) if s == "OK" => Ok(()),
            frame => Err(format!("unexpected reply to SET: {:?}", frame).into()),
        }
    }

    /// Blocks until `numreplicas` replicas acknowledged the latest write or
    /// the timeout passes; returns the acknowledged count.
    pub async fn wait(&mut self, numreplicas: u64, timeout_ms: u64) -> crate::Result<u64> {
        let frame = Wait::new(numreplicas, timeout_ms).into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Integer(n) => Ok(n),
            frame => Err(format!("unexpected reply to WAIT: {:?}", frame).into()),
        }
    }

    async fn read_response(&mut self) -> crate::Result<Frame> {
        match self.connection.read_frame().await? {
            Some(Frame::Error(message)) => Err(message.into()),
            Some(frame) => Ok(frame),
            None => Err("connection reset by server".into()),
        }
    }
}
