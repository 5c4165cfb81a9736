//! Journal record framing.
//!
//! Each record consists of:
//! - Checksum (4 bytes): CRC32 of type and payload
//! - Length (4 bytes): length of the payload
//! - Type (1 byte): Full, First, Middle or Last
//! - Payload (variable)
//!
//! An entry larger than [`MAX_FRAGMENT_SIZE`] is written as a First record,
//! any number of Middle records, and a Last record.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;

/// Maximum payload carried by a single record.
pub const MAX_FRAGMENT_SIZE: usize = 64 * 1024;

/// Size of the record header (checksum + length + type).
pub const HEADER_SIZE: usize = 9;

/// How a record relates to the entry it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// The whole entry.
    Full = 1,
    /// Opening fragment of an entry.
    First = 2,
    /// Inner fragment of an entry.
    Middle = 3,
    /// Closing fragment of an entry.
    Last = 4,
}

impl RecordType {
    /// Convert from u8 to RecordType
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            _ => Err(Error::corruption(format!("Invalid journal record type: {}", value))),
        }
    }
}

/// One framed journal record.
#[derive(Debug, Clone)]
pub struct Record {
    /// Type of the record
    pub record_type: RecordType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Record {
    /// Create a new record
    pub fn new(record_type: RecordType, payload: Vec<u8>) -> Self {
        Self { record_type, payload }
    }

    /// Encode the record into bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u32_le(Self::checksum(self.record_type, &self.payload));
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u8(self.record_type as u8);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Decode a record from bytes.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corruption(format!("Journal record too short: {} bytes", data.len())));
        }

        let checksum = data.get_u32_le();
        let length = data.get_u32_le() as usize;
        let record_type = RecordType::from_u8(data.get_u8())?;

        if data.len() < length {
            return Err(Error::corruption(format!(
                "Incomplete journal record: expected {} bytes, got {}",
                length,
                data.len()
            )));
        }

        let payload = data[..length].to_vec();
        let expected = Self::checksum(record_type, &payload);
        if checksum != expected {
            return Err(Error::ChecksumMismatch { expected, actual: checksum });
        }

        Ok(Record { record_type, payload })
    }

    /// Reads the payload length from an encoded header.
    pub fn payload_len(header: &[u8; HEADER_SIZE]) -> usize {
        u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize
    }

    fn checksum(record_type: RecordType, payload: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&[record_type as u8]);
        hasher.update(payload);
        hasher.finalize()
    }

    /// Get the total size of the encoded record
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}
