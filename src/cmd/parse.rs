use std::{fmt, str, vec};

use bytes::Bytes;

use crate::frame::Frame;

/// Walks the elements of a decoded `Array` frame so command constructors can
/// pull typed arguments off it one at a time.
pub struct Parse {
    parts: vec::IntoIter<Frame>,
}

#[derive(Debug)]
pub enum ParseError {
    /// Asked for another argument when the array was exhausted.
    EndOfStream,
    Other(crate::Error),
}

impl Parse {
    /// Fails unless `frame` is an array; commands only ever arrive as one.
    pub fn new(frame: Frame) -> Result<Parse, ParseError> {
        let array = match frame {
            Frame::Array(array) => array,
            frame => return Err(format!("protocol error; expected array, got {:?}", frame).into()),
        };

        Ok(Parse {
            parts: array.into_iter(),
        })
    }

    fn next(&mut self) -> Result<Frame, ParseError> {
        self.parts.next().ok_or(ParseError::EndOfStream)
    }

    /// Returns the next frame untyped, for positions with frame-kind rules
    /// of their own (the command-name head position).
    pub(crate) fn next_frame(&mut self) -> Option<Frame> {
        self.parts.next()
    }

    pub fn next_string(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(data) => str::from_utf8(&data[..])
                .map(|s| s.to_string())
                .map_err(|_| "protocol error; invalid string".into()),
            frame => Err(format!(
                "protocol error; expected simple or bulk frame, got {:?}",
                frame
            )
            .into()),
        }
    }

    pub fn next_bytes(&mut self) -> Result<Bytes, ParseError> {
        match self.next()? {
            Frame::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            Frame::Bulk(data) => Ok(data),
            frame => Err(format!(
                "protocol error; expected simple or bulk frame, got {:?}",
                frame
            )
            .into()),
        }
    }

    pub fn next_int(&mut self) -> Result<u64, ParseError> {
        use atoi::atoi;

        const INVALID: &str = "protocol error; invalid number";

        match self.next()? {
            Frame::Integer(n) => Ok(n),
            Frame::Simple(s) => atoi::<u64>(s.as_bytes()).ok_or_else(|| INVALID.into()),
            Frame::Bulk(data) => atoi::<u64>(&data).ok_or_else(|| INVALID.into()),
            frame => Err(format!("protocol error; expected int frame, got {:?}", frame).into()),
        }
    }

    /// Asserts that every argument has been consumed.
    pub fn finish(&mut self) -> Result<(), ParseError> {
        if self.parts.next().is_none() {
            Ok(())
        } else {
            Err("protocol error; expected end of frame".into())
        }
    }
}

impl From<String> for ParseError {
    fn from(src: String) -> ParseError {
        ParseError::Other(src.into())
    }
}

impl From<&str> for ParseError {
    fn from(src: &str) -> ParseError {
        src.to_string().into()
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::EndOfStream => "protocol error; unexpected end of stream".fmt(f),
            ParseError::Other(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ParseError {}
