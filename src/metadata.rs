//! Per-record header written before every document in the storage file.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::codec;
use crate::errors::CodecError;
use crate::YarDbError;

/// Lifecycle of a stored record. The status byte is the first byte of the
/// record and the only byte ever rewritten in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Created,
    Updated,
    Deleted,
}

impl Status {
    pub fn as_byte(self) -> u8 {
        match self {
            Status::Created => b'C',
            Status::Updated => b'U',
            Status::Deleted => b'D',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Status, CodecError> {
        match byte {
            b'C' => Ok(Status::Created),
            b'U' => Ok(Status::Updated),
            b'D' => Ok(Status::Deleted),
            other => Err(CodecError(format!("unknown status byte {other:#04x}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub status: Status,
    pub collection: String,
    /// Write time, milliseconds since the epoch.
    pub timestamp: i64,
    /// Absolute file offset of this record's first byte (self-reference).
    pub position: i64,
    /// Offset of the prior version of this `_id`, or -1.
    pub previous: i64,
}

impl Metadata {
    pub fn new(collection: &str, position: i64, previous: i64) -> Metadata {
        Metadata {
            status: Status::Created,
            collection: collection.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            position,
            previous,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.status.as_byte());
        codec::write_string(out, &self.collection);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.position.to_le_bytes());
        out.extend_from_slice(&self.previous.to_le_bytes());
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Metadata, YarDbError> {
        let status = Status::from_byte(r.read_u8()?)?;
        let collection = codec::read_string(r)?;
        let timestamp = r.read_i64::<LittleEndian>()?;
        let position = r.read_i64::<LittleEndian>()?;
        let previous = r.read_i64::<LittleEndian>()?;
        Ok(Metadata {
            status,
            collection,
            timestamp,
            position,
            previous,
        })
    }
}
