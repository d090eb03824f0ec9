use std::io::{self, Cursor};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use crate::frame::{self, Frame};

#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Reads one frame, waiting for more bytes as needed. `None` means the
    /// peer closed the connection cleanly between frames.
    pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
        Ok(self.read_frame_counted().await?.map(|(frame, _)| frame))
    }

    /// Like `read_frame` but also reports how many wire bytes the frame
    /// occupied. Replicas use the count to track their replication offset.
    pub async fn read_frame_counted(&mut self) -> crate::Result<Option<(Frame, usize)>> {
        loop {
            if let Some(parsed) = parse_buffer(&mut self.buffer)? {
                return Ok(Some(parsed));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err("connection reset by peer".into());
                }
            }
        }
    }

    /// Reads the snapshot payload a primary sends right after `FULLRESYNC`:
    /// `$<len>\r\n` followed by `len` raw bytes with no trailing CRLF, so it
    /// cannot go through the regular frame parser.
    pub async fn read_snapshot(&mut self) -> crate::Result<Bytes> {
        loop {
            if let Some(payload) = self.parse_snapshot()? {
                return Ok(payload);
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err("connection reset by peer during snapshot transfer".into());
            }
        }
    }

    fn parse_snapshot(&mut self) -> crate::Result<Option<Bytes>> {
        let Some(header_len) = self.buffer.windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };

        if self.buffer.first() != Some(&b'$') {
            return Err("protocol error; expected snapshot frame".into());
        }

        let len: usize = atoi::atoi(&self.buffer[1..header_len])
            .ok_or_else(|| crate::Error::from("protocol error; invalid snapshot length"))?;

        let frame_len = header_len + 2 + len;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(frame_len);
        let payload = frame.split_off(header_len + 2);

        Ok(Some(payload.freeze()))
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        // One marshaling path for replies, propagation, and offset
        // accounting keeps all three byte-for-byte identical.
        self.stream.write_all(&frame.encode()).await?;

        self.stream.flush().await
    }

    /// Tears the connection down into its socket and whatever bytes were
    /// read but not yet parsed. Used when a `PSYNC` promotes the connection
    /// to a replica and its halves move to the replication engine.
    pub fn into_parts(self) -> (TcpStream, BytesMut) {
        (self.stream.into_inner(), self.buffer)
    }
}

/// Tries to decode one frame from the front of `buffer`, consuming it and
/// returning its wire length. `None` means more bytes are needed.
pub(crate) fn parse_buffer(buffer: &mut BytesMut) -> crate::Result<Option<(Frame, usize)>> {
    use frame::Error::Incomplete;

    let mut buf = Cursor::new(&buffer[..]);

    match Frame::check(&mut buf) {
        Ok(()) => {
            let len = buf.position() as usize;

            buf.set_position(0);

            let frame = Frame::parse(&mut buf)?;

            buffer.advance(len);

            Ok(Some((frame, len)))
        }
        Err(Incomplete) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
