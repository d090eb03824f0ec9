use std::io::Cursor;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;
use std::{fmt, str::Utf8Error};

use bytes::{Buf, Bytes};

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),    // +
    Error(String),     // -
    Integer(u64),      // :
    Bulk(Bytes),       // $
    Null,              // $-1 / *-1
    Array(Vec<Frame>), // *
    /// Raw snapshot payload sent by a primary during full resynchronization.
    /// The only frame that is not CRLF-terminated on the wire.
    Snapshot(Bytes),
}

#[derive(Debug)]
pub enum Error {
    /// Not enough data to decode a full frame yet.
    Incomplete,
    Other(crate::Error),
}

impl Frame {
    pub fn array() -> Frame {
        Frame::Array(vec![])
    }

    pub fn push_bulk(&mut self, bytes: Bytes) {
        match self {
            Frame::Array(vec) => {
                vec.push(Frame::Bulk(bytes));
            }
            _ => panic!("Not an array frame"),
        }
    }

    pub fn push_string(&mut self, string: String) {
        match self {
            Frame::Array(vec) => {
                vec.push(Frame::Simple(string));
            }
            _ => panic!("Not an array frame"),
        }
    }

    /// Validates that a full frame can be decoded from `src`, advancing the
    /// cursor past it. `Error::Incomplete` means the caller should wait for
    /// more bytes and retry.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        match get_descriptor(src)? {
            b'+' => {
                get_line(src)?;
                Ok(())
            }
            b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                get_decimal(src)?;
                Ok(())
            }
            b'$' => {
                if peek_u8(src)? == b'-' {
                    // null bulk
                    get_line(src)?;
                    return Ok(());
                }
                let len = get_decimal(src)? as usize;

                // skip that number of bytes + 2 (\r\n).
                skip(src, len + 2)
            }
            b'*' => {
                if peek_u8(src)? == b'-' {
                    // null array
                    get_line(src)?;
                    return Ok(());
                }
                let len = get_decimal(src)?;

                for _ in 0..len {
                    Frame::check(src)?;
                }

                Ok(())
            }
            actual => Err(format!("protocol error; invalid frame type byte `{}`", actual).into()),
        }
    }

    /// Decodes one frame. The caller must have run `check` first, so the
    /// buffer is known to hold a complete frame.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match get_descriptor(src)? {
            b'+' => {
                let bytes_vec = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes_vec)?;

                Ok(Frame::Simple(string))
            }
            b'-' => {
                let bytes_vec = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes_vec)?;

                Ok(Frame::Error(string))
            }
            b':' => {
                let n = get_decimal(src)?;

                Ok(Frame::Integer(n))
            }
            b'$' => {
                if peek_u8(src)? == b'-' {
                    let line = get_line(src)?;

                    if line != b"-1" {
                        return Err("protocol error; invalid bulk length".into());
                    }

                    return Ok(Frame::Null);
                }

                let len = get_decimal(src)? as usize;
                let n = len + 2;

                if src.remaining() < n {
                    return Err(Error::Incomplete);
                }

                let data = Bytes::copy_from_slice(&src.chunk()[..len]);

                // skip that number of bytes + 2 (\r\n).
                skip(src, n)?;

                Ok(Frame::Bulk(data))
            }
            b'*' => {
                if peek_u8(src)? == b'-' {
                    let line = get_line(src)?;

                    if line != b"-1" {
                        return Err("protocol error; invalid array length".into());
                    }

                    return Ok(Frame::Null);
                }

                let len = get_decimal(src)?;
                let mut array: Vec<Frame> = Vec::with_capacity(len as usize);

                for _ in 0..len {
                    array.push(Frame::parse(src)?);
                }

                Ok(Frame::Array(array))
            }
            actual => Err(format!("protocol error; invalid frame type byte `{}`", actual).into()),
        }
    }

    /// Marshals the frame into its wire representation. The replication
    /// engine uses this to propagate requests verbatim and to account byte
    /// offsets, so the output must match what `Connection::write_frame`
    /// puts on the wire.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);

        Bytes::from(buf)
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Simple(string) => {
                buf.push(b'+');
                buf.extend_from_slice(string.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Error(string) => {
                buf.push(b'-');
                buf.extend_from_slice(string.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Bulk(val) => {
                buf.push(b'$');
                buf.extend_from_slice(val.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(val);
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Null => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            Frame::Array(frames) => {
                buf.push(b'*');
                buf.extend_from_slice(frames.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");

                for frame in frames {
                    frame.encode_into(buf);
                }
            }
            // The recipient knows the payload length, so no trailing CRLF.
            Frame::Snapshot(val) => {
                buf.push(b'$');
                buf.extend_from_slice(val.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(val);
            }
        }
    }
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<u64, Error> {
    use atoi::atoi;

    let line = get_line(src)?;

    atoi::<u64>(line).ok_or_else(|| "protocol error; invalid frame format".into())
}

/// A "line" refers to a sequence of bytes that is terminated by a carriage return
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = src.get_ref().len().saturating_sub(1);

    for i in start..end {
        if src.get_ref()[i] == b'\r' && src.get_ref()[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);

            return Ok(&src.get_ref()[start..i]);
        }
    }

    Err(Error::Incomplete)
}

fn get_descriptor(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.get_u8())
}

fn peek_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.chunk()[0])
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    src.advance(n);
    Ok(())
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Other(src.into())
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl From<Utf8Error> for Error {
    fn from(_src: Utf8Error) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl From<TryFromIntError> for Error {
    fn from(_src: TryFromIntError) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Incomplete => "stream ended early".fmt(fmt),
            Error::Other(err) => err.fmt(fmt),
        }
    }
}

impl std::error::Error for Error {}
