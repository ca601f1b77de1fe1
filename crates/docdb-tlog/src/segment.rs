// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Segment files.

use std::path::{Path, PathBuf};

use crate::SerialNum;
use crate::error::{Result, TlogError};
use crate::frame::{Decoded, Entry};

/// File extension of segment files.
pub const SEGMENT_SUFFIX: &str = "tlog";

/// Bookkeeping for one segment file.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub path: PathBuf,
    /// Serial number encoded in the file name.
    pub start_serial: SerialNum,
    /// First and last serial numbers stored, `0` when empty.
    pub first_serial: SerialNum,
    pub last_serial: SerialNum,
    /// Size of the valid prefix in bytes.
    pub size: u64,
}

impl SegmentMeta {
    pub fn is_empty(&self) -> bool {
        self.last_serial == 0
    }
}

/// Contents of a segment file as read from disk.
#[derive(Debug)]
pub struct SegmentContents {
    pub entries: Vec<Entry>,
    /// Bytes covered by `entries`.
    pub valid_len: u64,
    /// Total file length.
    pub file_len: u64,
    /// Why decoding stopped before the end of the file, if it did.
    pub stop_reason: Option<String>,
}

impl SegmentContents {
    /// True if trailing bytes could not be decoded.
    pub fn has_invalid_tail(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Name of the segment whose first entry has `start_serial`.
pub fn segment_file_name(start_serial: SerialNum) -> String {
    // padded to `u64::MAX.to_string().len()` so lexical order is numeric order
    format!("{:020}.{}", start_serial, SEGMENT_SUFFIX)
}

/// Parse the start serial out of a segment path.
pub fn parse_segment_name(path: &Path) -> Result<SerialNum> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TlogError::InvalidSegmentName(path.display().to_string()))?;

    let stem = name
        .strip_suffix(SEGMENT_SUFFIX)
        .and_then(|s| s.strip_suffix('.'))
        .ok_or_else(|| TlogError::InvalidSegmentName(name.to_string()))?;

    stem.parse::<SerialNum>()
        .map_err(|_| TlogError::InvalidSegmentName(name.to_string()))
}

/// Whether `path` looks like a segment file.
pub fn is_segment_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_SUFFIX)
}

/// Read and decode every entry of a segment.
///
/// Decoding stops at the first incomplete or corrupt entry; the caller
/// decides whether that is a torn tail or corruption.
pub async fn read_segment(path: &Path) -> Result<SegmentContents> {
    let bytes = tokio::fs::read(path).await?;
    let mut entries = Vec::new();
    let mut offset = 0usize;
    let mut stop_reason = None;

    while offset < bytes.len() {
        match Entry::decode(&bytes[offset..]) {
            Decoded::Entry(entry, used) => {
                entries.push(entry);
                offset += used;
            }
            Decoded::Incomplete => {
                stop_reason = Some("incomplete entry".to_string());
                break;
            }
            Decoded::Corrupt(reason) => {
                stop_reason = Some(reason);
                break;
            }
        }
    }

    Ok(SegmentContents {
        entries,
        valid_len: offset as u64,
        file_len: bytes.len() as u64,
        stop_reason,
    })
}
