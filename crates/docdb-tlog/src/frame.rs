// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! On-disk entry framing.
//!
//! Every entry is written as:
//! - 4 bytes: payload length (big-endian)
//! - 8 bytes: serial number (big-endian)
//! - 1 byte: entry type
//! - N bytes: payload
//! - 4 bytes: CRC32 over everything above (big-endian)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::SerialNum;
use crate::error::{Result, TlogError};

/// Maximum payload size (64 MB)
pub const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// Entry header size (4 bytes length + 8 bytes serial + 1 byte type)
pub const HEADER_SIZE: usize = 13;

/// Entry trailer size (CRC32)
pub const TRAILER_SIZE: usize = 4;

/// Kind of a logged entry. The payload encoding is owned by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// A mutating feed operation (put, update, remove, move, prune).
    FeedOperation = 1,
    /// A config snapshot became active at this serial number.
    NewConfig = 2,
    /// Serial number placeholder without effect.
    NoOp = 3,
}

impl TryFrom<u8> for EntryType {
    type Error = TlogError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(EntryType::FeedOperation),
            2 => Ok(EntryType::NewConfig),
            3 => Ok(EntryType::NoOp),
            _ => Err(TlogError::InvalidEntryType(value)),
        }
    }
}

/// A logged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub serial: SerialNum,
    pub entry_type: EntryType,
    pub payload: Bytes,
}

/// Outcome of decoding one entry from the front of a buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A complete entry and the number of bytes it occupied.
    Entry(Entry, usize),
    /// The buffer ends inside an entry (torn write).
    Incomplete,
    /// The bytes do not form a valid entry.
    Corrupt(String),
}

impl Entry {
    pub fn new(serial: SerialNum, entry_type: EntryType, payload: impl Into<Bytes>) -> Self {
        Self {
            serial,
            entry_type,
            payload: payload.into(),
        }
    }

    /// Size of this entry on disk.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + TRAILER_SIZE
    }

    /// Encode the entry to its on-disk representation.
    pub fn encode(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_ENTRY_SIZE {
            return Err(TlogError::EntryTooLarge(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u64(self.serial);
        buf.put_u8(self.entry_type as u8);
        buf.put(self.payload.clone());
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        Ok(buf.freeze())
    }

    /// Decode the entry at the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Decoded {
        if bytes.len() < HEADER_SIZE {
            return Decoded::Incomplete;
        }

        let mut header = &bytes[..HEADER_SIZE];
        let length = header.get_u32() as usize;
        let serial = header.get_u64();
        let raw_type = header.get_u8();

        if length > MAX_ENTRY_SIZE {
            return Decoded::Corrupt(format!("entry length {} exceeds maximum", length));
        }

        let total = HEADER_SIZE + length + TRAILER_SIZE;
        if bytes.len() < total {
            return Decoded::Incomplete;
        }

        let body_end = HEADER_SIZE + length;
        let expected = crc32fast::hash(&bytes[..body_end]);
        let stored = (&bytes[body_end..total]).get_u32();
        if expected != stored {
            return Decoded::Corrupt(format!(
                "CRC mismatch for serial {}: stored {:08x}, computed {:08x}",
                serial, stored, expected
            ));
        }

        let entry_type = match EntryType::try_from(raw_type) {
            Ok(t) => t,
            Err(e) => return Decoded::Corrupt(e.to_string()),
        };

        Decoded::Entry(
            Entry {
                serial,
                entry_type,
                payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..body_end]),
            },
            total,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_ok(bytes: &[u8]) -> (Entry, usize) {
        match Entry::decode(bytes) {
            Decoded::Entry(e, n) => (e, n),
            other => panic!("expected entry, got {:?}", other),
        }
    }

    #[test]
    fn test_entry_type_conversions() {
        assert_eq!(EntryType::try_from(1u8).unwrap(), EntryType::FeedOperation);
        assert_eq!(EntryType::try_from(2u8).unwrap(), EntryType::NewConfig);
        assert_eq!(EntryType::try_from(3u8).unwrap(), EntryType::NoOp);
        assert!(EntryType::try_from(0u8).is_err());
        assert!(EntryType::try_from(4u8).is_err());
    }

    #[test]
    fn test_encode_layout() {
        let entry = Entry::new(42, EntryType::FeedOperation, &b"abc"[..]);
        let encoded = entry.encode().unwrap();

        assert_eq!(encoded.len(), HEADER_SIZE + 3 + TRAILER_SIZE);
        assert_eq!(&encoded[0..4], &3u32.to_be_bytes());
        assert_eq!(&encoded[4..12], &42u64.to_be_bytes());
        assert_eq!(encoded[12], 1);
        assert_eq!(&encoded[13..16], b"abc");
    }

    #[test]
    fn test_decode_consumes_exactly_one_entry() {
        let first = Entry::new(1, EntryType::NewConfig, &b"cfg"[..]);
        let second = Entry::new(2, EntryType::NoOp, Bytes::new());
        let mut buf = first.encode().unwrap().to_vec();
        buf.extend_from_slice(&second.encode().unwrap());

        let (decoded, used) = decode_ok(&buf);
        assert_eq!(decoded, first);
        let (decoded, _) = decode_ok(&buf[used..]);
        assert_eq!(decoded, second);
    }

    #[test]
    fn test_decode_truncated_is_incomplete() {
        let encoded = Entry::new(7, EntryType::FeedOperation, &b"payload"[..])
            .encode()
            .unwrap();
        assert!(matches!(Entry::decode(&encoded[..5]), Decoded::Incomplete));
        assert!(matches!(
            Entry::decode(&encoded[..encoded.len() - 1]),
            Decoded::Incomplete
        ));
    }

    #[test]
    fn test_decode_detects_flipped_bit() {
        let mut encoded = Entry::new(7, EntryType::FeedOperation, &b"payload"[..])
            .encode()
            .unwrap()
            .to_vec();
        encoded[HEADER_SIZE + 2] ^= 0x10;
        match Entry::decode(&encoded) {
            Decoded::Corrupt(reason) => assert!(reason.contains("CRC mismatch")),
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let entry = Entry::new(1, EntryType::FeedOperation, vec![0u8; MAX_ENTRY_SIZE + 1]);
        assert!(matches!(
            entry.encode(),
            Err(TlogError::EntryTooLarge(n)) if n == MAX_ENTRY_SIZE + 1
        ));
    }
}
