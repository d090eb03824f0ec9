use std::io::Cursor;
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes};
use thiserror::Error;

use crate::db::Db;

/// Snapshot a primary transmits to a freshly attached replica: a valid file
/// with a metadata section and no database sections.
const EMPTY_SNAPSHOT_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a7265\
6469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c0\
00fff06e3bfec0ff5aa2";

const OP_METADATA: u8 = 0xFA;
const OP_EXPIRY_MS: u8 = 0xFC;
const OP_EXPIRY_SECONDS: u8 = 0xFD;
const OP_DATABASE: u8 = 0xFE;
const OP_RESIZE: u8 = 0xFB;
const OP_EOF: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is truncated")]
    Truncated,

    #[error("invalid snapshot header")]
    InvalidHeader,

    #[error("malformed database section")]
    MalformedSection,

    #[error("invalid size encoding")]
    InvalidSize,

    #[error("invalid string encoding")]
    InvalidString,

    #[error("LZF compression not supported")]
    LzfUnsupported,

    #[error("snapshot key is not valid UTF-8")]
    InvalidKey,

    #[error("failed to read snapshot file: {0}")]
    Io(#[from] std::io::Error),
}

pub fn empty_snapshot() -> Bytes {
    Bytes::from(hex::decode(EMPTY_SNAPSHOT_HEX).expect("embedded snapshot literal is valid hex"))
}

pub fn snapshot_path(dir: &str, dbfilename: &str) -> PathBuf {
    Path::new(dir).join(dbfilename)
}

/// Seeds `db` from a snapshot file on disk. A missing file is not an error;
/// the server just starts empty.
pub fn load_from_disk(db: &Db, dir: &str, dbfilename: &str) -> Result<bool, SnapshotError> {
    let path = snapshot_path(dir, dbfilename);

    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };

    load(db, &data)?;
    Ok(true)
}

/// Parses snapshot bytes and inserts every entry into `db`. Entries whose
/// expiry already passed are inserted anyway; the next read evicts them.
pub fn load(db: &Db, data: &[u8]) -> Result<(), SnapshotError> {
    let mut src = Cursor::new(data);

    read_header(&mut src)?;
    skip_metadata(&mut src)?;

    loop {
        match peek_u8(&mut src)? {
            OP_EOF => break,
            OP_DATABASE => {
                src.advance(1);
                read_database_section(db, &mut src)?;
            }
            _ => return Err(SnapshotError::MalformedSection),
        }
    }

    Ok(())
}

fn read_header(src: &mut Cursor<&[u8]>) -> Result<(), SnapshotError> {
    let header = get_exact(src, 9)?;

    // First five bytes are the magic; the four version bytes are ignored.
    if &header[..5] != b"REDIS" {
        return Err(SnapshotError::InvalidHeader);
    }

    Ok(())
}

fn skip_metadata(src: &mut Cursor<&[u8]>) -> Result<(), SnapshotError> {
    while peek_u8(src)? == OP_METADATA {
        src.advance(1);

        // Metadata key and value are both discarded.
        decode_string(src)?;
        decode_string(src)?;
    }

    Ok(())
}

fn read_database_section(db: &Db, src: &mut Cursor<&[u8]>) -> Result<(), SnapshotError> {
    // Database index; multiple logical databases are not supported.
    decode_size(src)?;

    if get_u8(src)? != OP_RESIZE {
        return Err(SnapshotError::MalformedSection);
    }

    let dbsize = decode_size(src)?;
    // Count of entries carrying an expiry; redundant with the entries themselves.
    decode_size(src)?;

    for _ in 0..dbsize {
        let expires_at_ms = decode_expiry(src)?;

        // Value type byte; only strings are supported.
        get_u8(src)?;

        let key = decode_string(src)?;
        let value = decode_string(src)?;

        let key = String::from_utf8(key.to_vec()).map_err(|_| SnapshotError::InvalidKey)?;

        db.set_at(key, value, expires_at_ms);
    }

    Ok(())
}

/// `0xFC`: 8-byte little-endian absolute milliseconds. `0xFD`: 4-byte
/// little-endian absolute seconds, converted to milliseconds here. Any other
/// byte is left unread and means no expiry.
fn decode_expiry(src: &mut Cursor<&[u8]>) -> Result<Option<u64>, SnapshotError> {
    match peek_u8(src)? {
        OP_EXPIRY_MS => {
            src.advance(1);
            let raw = get_exact(src, 8)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);

            Ok(Some(u64::from_le_bytes(buf)))
        }
        OP_EXPIRY_SECONDS => {
            src.advance(1);
            let raw = get_exact(src, 4)?;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(raw);

            Ok(Some(u64::from(u32::from_le_bytes(buf)) * 1000))
        }
        _ => Ok(None),
    }
}

/// Length encoding: the top two bits of the first byte select 6-bit inline,
/// 14-bit big-endian, or 32-bit big-endian sizes. `11` marks a string
/// encoding and is invalid in size position.
fn decode_size(src: &mut Cursor<&[u8]>) -> Result<usize, SnapshotError> {
    let first = get_u8(src)?;

    match first >> 6 {
        0b00 => Ok(usize::from(first & 0x3F)),
        0b01 => {
            let low = get_u8(src)?;

            Ok(usize::from(first & 0x3F) << 8 | usize::from(low))
        }
        0b10 => {
            let raw = get_exact(src, 4)?;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(raw);

            Ok(u32::from_be_bytes(buf) as usize)
        }
        _ => Err(SnapshotError::InvalidSize),
    }
}

/// Strings are either raw length-prefixed bytes or little-endian integers
/// (`0xC0`/`0xC1`/`0xC2`) rendered as decimal ASCII. `0xC3` is LZF, which is
/// unsupported.
fn decode_string(src: &mut Cursor<&[u8]>) -> Result<Bytes, SnapshotError> {
    let first = get_u8(src)?;

    match first {
        len if len < 0xC0 => {
            let raw = get_exact(src, usize::from(len))?;

            Ok(Bytes::copy_from_slice(raw))
        }
        0xC0 => {
            let n = get_u8(src)?;

            Ok(Bytes::from(n.to_string()))
        }
        0xC1 => {
            let raw = get_exact(src, 2)?;
            let mut buf = [0u8; 2];
            buf.copy_from_slice(raw);

            Ok(Bytes::from(u16::from_le_bytes(buf).to_string()))
        }
        0xC2 => {
            let raw = get_exact(src, 4)?;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(raw);

            Ok(Bytes::from(u32::from_le_bytes(buf).to_string()))
        }
        0xC3 => Err(SnapshotError::LzfUnsupported),
        _ => Err(SnapshotError::InvalidString),
    }
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, SnapshotError> {
    if !src.has_remaining() {
        return Err(SnapshotError::Truncated);
    }

    Ok(src.get_u8())
}

fn peek_u8(src: &mut Cursor<&[u8]>) -> Result<u8, SnapshotError> {
    if !src.has_remaining() {
        return Err(SnapshotError::Truncated);
    }

    Ok(src.chunk()[0])
}

fn get_exact<'a>(src: &mut Cursor<&'a [u8]>, n: usize) -> Result<&'a [u8], SnapshotError> {
    if src.remaining() < n {
        return Err(SnapshotError::Truncated);
    }

    let start = src.position() as usize;
    src.advance(n);

    Ok(&src.get_ref()[start..start + n])
}
