// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Segmented transaction log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::SerialNum;
use crate::error::{Result, TlogError};
use crate::frame::Entry;
use crate::segment::{
    SegmentMeta, is_segment_file, parse_segment_name, read_segment, segment_file_name,
};

/// Configuration for a [`TransactionLog`].
#[derive(Debug, Clone)]
pub struct TransactionLogConfig {
    /// Directory holding the segment files.
    pub dir: PathBuf,
    /// Size after which the active segment is sealed and a new one started.
    pub segment_size_limit: u64,
    /// Whether every append is followed by `fdatasync`.
    pub sync_on_append: bool,
}

impl TransactionLogConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size_limit: 64 * 1024 * 1024,
            sync_on_append: true,
        }
    }

    pub fn segment_size_limit(mut self, limit: u64) -> Self {
        self.segment_size_limit = limit;
        self
    }

    pub fn sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }
}

/// Inclusive range of serial numbers available for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerialRange {
    pub first: SerialNum,
    pub last: SerialNum,
}

impl SerialRange {
    pub fn is_empty(&self) -> bool {
        self.last == 0 || self.first > self.last
    }
}

struct LogInner {
    /// Segments keyed by start serial.
    segments: BTreeMap<SerialNum, SegmentMeta>,
    /// Append handle for the last segment.
    active: Option<File>,
    last_serial: SerialNum,
    pruned_serial: SerialNum,
}

/// Append-only, serial-ordered log of entries.
///
/// All mutations and reads go through one async mutex; the document database
/// only appends from its master task so contention is limited to replay and
/// pruning.
pub struct TransactionLog {
    config: TransactionLogConfig,
    inner: Mutex<LogInner>,
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("dir", &self.config.dir)
            .finish()
    }
}

impl TransactionLog {
    /// Open the log directory, creating it if needed.
    ///
    /// A torn tail in the newest segment is truncated. Undecodable data in
    /// any older segment is reported as corruption.
    pub async fn open(config: TransactionLogConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;

        let mut paths = Vec::new();
        let mut dir = tokio::fs::read_dir(&config.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if is_segment_file(&path) {
                let start = parse_segment_name(&path)?;
                paths.push((start, path));
            }
        }
        paths.sort_by_key(|(start, _)| *start);

        let mut segments = BTreeMap::new();
        let mut last_serial: SerialNum = 0;
        let count = paths.len();

        for (idx, (start_serial, path)) in paths.into_iter().enumerate() {
            let is_newest = idx + 1 == count;
            let contents = read_segment(&path).await?;

            if contents.has_invalid_tail() {
                let reason = contents.stop_reason.clone().unwrap_or_default();
                if !is_newest {
                    return Err(TlogError::Corrupted {
                        path,
                        offset: contents.valid_len,
                        reason,
                    });
                }
                warn!(
                    path = %path.display(),
                    valid_len = contents.valid_len,
                    file_len = contents.file_len,
                    reason = %reason,
                    "Truncating torn tail of transaction log segment"
                );
                truncate(&path, contents.valid_len).await?;
            }

            let mut meta = SegmentMeta {
                path: path.clone(),
                start_serial,
                first_serial: 0,
                last_serial: 0,
                size: contents.valid_len,
            };

            for (offset, entry) in contents.entries.iter().enumerate() {
                if entry.serial <= last_serial {
                    return Err(TlogError::Corrupted {
                        path,
                        offset: offset as u64,
                        reason: format!(
                            "serial {} follows serial {}",
                            entry.serial, last_serial
                        ),
                    });
                }
                if meta.first_serial == 0 {
                    meta.first_serial = entry.serial;
                }
                meta.last_serial = entry.serial;
                last_serial = entry.serial;
            }

            segments.insert(start_serial, meta);
        }

        let active = match segments.values().next_back() {
            Some(meta) if meta.size < config.segment_size_limit => {
                Some(open_for_append(&meta.path).await?)
            }
            _ => None,
        };

        let first_serial = segments
            .values()
            .find(|m| !m.is_empty())
            .map(|m| m.first_serial)
            .unwrap_or(0);

        info!(
            dir = %config.dir.display(),
            segments = segments.len(),
            first_serial,
            last_serial,
            "Transaction log opened"
        );

        Ok(Self {
            config,
            inner: Mutex::new(LogInner {
                segments,
                active,
                last_serial,
                pruned_serial: first_serial.saturating_sub(1),
            }),
        })
    }

    /// Directory of this log.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Append one entry. The serial number must exceed every logged one.
    pub async fn append(&self, entry: &Entry) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if entry.serial <= inner.last_serial {
            return Err(TlogError::SerialOrder {
                last: inner.last_serial,
                got: entry.serial,
            });
        }

        let encoded = entry.encode()?;

        let needs_roll = match (inner.active.is_some(), inner.segments.values().next_back()) {
            (true, Some(meta)) => {
                !meta.is_empty()
                    && meta.size + encoded.len() as u64 > self.config.segment_size_limit
            }
            _ => true,
        };
        if needs_roll {
            self.roll(&mut inner, entry.serial).await?;
        }

        let sync = self.config.sync_on_append;
        let LogInner {
            segments, active, ..
        } = &mut *inner;
        let meta = segments
            .values_mut()
            .next_back()
            .ok_or_else(|| std::io::Error::other("no active transaction log segment"))?;
        let file = active
            .as_mut()
            .ok_or_else(|| std::io::Error::other("no active transaction log segment"))?;

        if let Err(e) = write_entry(file, &encoded, sync).await {
            warn!(
                serial = entry.serial,
                error = %e,
                "Transaction log append failed, restoring segment length"
            );
            let _ = file.set_len(meta.size).await;
            return Err(e.into());
        }

        if meta.first_serial == 0 {
            meta.first_serial = entry.serial;
        }
        meta.last_serial = entry.serial;
        meta.size += encoded.len() as u64;
        inner.last_serial = entry.serial;

        Ok(())
    }

    /// Seal the active segment and start a new one at `start_serial`.
    async fn roll(&self, inner: &mut LogInner, start_serial: SerialNum) -> Result<()> {
        if let Some(mut file) = inner.active.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let path = self.config.dir.join(segment_file_name(start_serial));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(path = %path.display(), start_serial, "Started transaction log segment");

        inner.segments.insert(
            start_serial,
            SegmentMeta {
                path,
                start_serial,
                first_serial: 0,
                last_serial: 0,
                size: 0,
            },
        );
        inner.active = Some(file);
        Ok(())
    }

    /// Entries with `from <= serial <= to`, in serial order.
    pub async fn replay(&self, from: SerialNum, to: SerialNum) -> Result<Vec<Entry>> {
        let inner = self.inner.lock().await;
        let mut result = Vec::new();
        if from > to {
            return Ok(result);
        }

        for meta in inner.segments.values() {
            if meta.is_empty() || meta.last_serial < from || meta.first_serial > to {
                continue;
            }
            let contents = read_segment(&meta.path).await?;
            result.extend(
                contents
                    .entries
                    .into_iter()
                    .filter(|e| e.serial >= from && e.serial <= to),
            );
        }

        Ok(result)
    }

    /// Remove every segment whose entries all have `serial <= up_to`.
    ///
    /// Returns the number of segments deleted. The prune watermark never
    /// moves backwards.
    pub async fn prune(&self, up_to: SerialNum) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        if up_to <= inner.pruned_serial {
            return Ok(0);
        }

        let newest_start = inner.segments.keys().next_back().copied();
        let doomed: Vec<SerialNum> = inner
            .segments
            .values()
            .filter(|m| !m.is_empty() && m.last_serial <= up_to)
            .map(|m| m.start_serial)
            .collect();

        let mut removed = 0;
        for start in doomed {
            if Some(start) == newest_start {
                // next append starts a fresh segment
                inner.active = None;
            }
            if let Some(meta) = inner.segments.remove(&start) {
                tokio::fs::remove_file(&meta.path).await?;
                removed += 1;
            }
        }

        inner.pruned_serial = up_to;
        info!(
            dir = %self.config.dir.display(),
            up_to,
            removed_segments = removed,
            "Pruned transaction log"
        );
        Ok(removed)
    }

    /// Flush and fsync the active segment.
    pub async fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(file) = inner.active.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }

    /// Serial numbers currently available for replay.
    pub async fn range(&self) -> SerialRange {
        let inner = self.inner.lock().await;
        let on_disk_first = inner
            .segments
            .values()
            .find(|m| !m.is_empty())
            .map(|m| m.first_serial)
            .unwrap_or(0);
        if on_disk_first == 0 {
            return SerialRange {
                first: 0,
                last: inner.last_serial,
            };
        }
        SerialRange {
            first: on_disk_first.max(inner.pruned_serial + 1),
            last: inner.last_serial,
        }
    }

    /// Highest logged serial number, `0` if nothing was ever logged.
    pub async fn last_serial(&self) -> SerialNum {
        self.inner.lock().await.last_serial
    }

    /// Highest serial number passed to [`prune`](Self::prune).
    pub async fn pruned_serial(&self) -> SerialNum {
        self.inner.lock().await.pruned_serial
    }

    /// Bytes used by segment files.
    pub async fn disk_usage(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.segments.values().map(|m| m.size).sum()
    }

    /// Number of segment files.
    pub async fn segment_count(&self) -> usize {
        self.inner.lock().await.segments.len()
    }
}

async fn open_for_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().append(true).open(path).await?)
}

async fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_all().await?;
    Ok(())
}

async fn write_entry(file: &mut File, bytes: &[u8], sync: bool) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    if sync {
        file.sync_data().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::EntryType;

    fn op(serial: SerialNum) -> Entry {
        Entry::new(
            serial,
            EntryType::FeedOperation,
            format!("op-{}", serial).into_bytes(),
        )
    }

    async fn open_log(dir: &Path, limit: u64) -> TransactionLog {
        TransactionLog::open(
            TransactionLogConfig::new(dir)
                .segment_size_limit(limit)
                .sync_on_append(false),
        )
        .await
        .expect("Failed to open transaction log")
    }

    #[tokio::test]
    async fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 1024 * 1024).await;

        for serial in 1..=5 {
            log.append(&op(serial)).await.unwrap();
        }

        let entries = log.replay(2, 4).await.unwrap();
        let serials: Vec<_> = entries.iter().map(|e| e.serial).collect();
        assert_eq!(serials, vec![2, 3, 4]);
        assert_eq!(entries[0].payload.as_ref(), b"op-2");
        assert_eq!(log.range().await, SerialRange { first: 1, last: 5 });
    }

    #[tokio::test]
    async fn test_empty_log_range() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 1024).await;
        assert!(log.range().await.is_empty());
        assert_eq!(log.last_serial().await, 0);
        assert!(log.replay(1, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_non_increasing_serial() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 1024).await;
        log.append(&op(10)).await.unwrap();

        let err = log.append(&op(10)).await.unwrap_err();
        assert!(matches!(err, TlogError::SerialOrder { last: 10, got: 10 }));
        let err = log.append(&op(3)).await.unwrap_err();
        assert!(matches!(err, TlogError::SerialOrder { last: 10, got: 3 }));
    }

    #[tokio::test]
    async fn test_reopen_continues_after_last_serial() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(dir.path(), 1024 * 1024).await;
            for serial in 1..=3 {
                log.append(&op(serial)).await.unwrap();
            }
            log.sync().await.unwrap();
        }

        let log = open_log(dir.path(), 1024 * 1024).await;
        assert_eq!(log.last_serial().await, 3);
        log.append(&op(4)).await.unwrap();

        let serials: Vec<_> = log
            .replay(1, 10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.serial)
            .collect();
        assert_eq!(serials, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_rolls_segments_at_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        // each entry is 13 + 4..5 + 4 bytes, so two entries fit per segment
        let log = open_log(dir.path(), 50).await;
        for serial in 1..=6 {
            log.append(&op(serial)).await.unwrap();
        }
        assert_eq!(log.segment_count().await, 3);
        assert_eq!(log.replay(1, 6).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_prune_removes_whole_segments_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 50).await;
        for serial in 1..=6 {
            log.append(&op(serial)).await.unwrap();
        }

        // segment [3,4] still holds serial 4 so only [1,2] goes
        let removed = log.prune(3).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(log.range().await, SerialRange { first: 4, last: 6 });

        let serials: Vec<_> = log
            .replay(4, 6)
            .await
            .unwrap()
            .iter()
            .map(|e| e.serial)
            .collect();
        assert_eq!(serials, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_prune_watermark_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 50).await;
        for serial in 1..=4 {
            log.append(&op(serial)).await.unwrap();
        }
        log.prune(2).await.unwrap();
        assert_eq!(log.prune(1).await.unwrap(), 0);
        assert_eq!(log.pruned_serial().await, 2);
    }

    #[tokio::test]
    async fn test_prune_everything_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 1024).await;
        for serial in 1..=3 {
            log.append(&op(serial)).await.unwrap();
        }
        log.prune(3).await.unwrap();
        assert_eq!(log.segment_count().await, 0);

        log.append(&op(4)).await.unwrap();
        assert_eq!(log.range().await, SerialRange { first: 4, last: 4 });
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let segment_path;
        {
            let log = open_log(dir.path(), 1024 * 1024).await;
            for serial in 1..=3 {
                log.append(&op(serial)).await.unwrap();
            }
            segment_path = dir.path().join(segment_file_name(1));
        }

        // simulate a crash in the middle of writing entry 4
        let partial = op(4).encode().unwrap();
        let mut bytes = tokio::fs::read(&segment_path).await.unwrap();
        let valid_len = bytes.len();
        bytes.extend_from_slice(&partial[..partial.len() - 3]);
        tokio::fs::write(&segment_path, &bytes).await.unwrap();

        let log = open_log(dir.path(), 1024 * 1024).await;
        assert_eq!(log.last_serial().await, 3);
        let on_disk = tokio::fs::metadata(&segment_path).await.unwrap().len();
        assert_eq!(on_disk, valid_len as u64);

        log.append(&op(4)).await.unwrap();
        assert_eq!(log.replay(1, 4).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_corruption_in_sealed_segment_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(dir.path(), 50).await;
            for serial in 1..=4 {
                log.append(&op(serial)).await.unwrap();
            }
        }

        let sealed = dir.path().join(segment_file_name(1));
        let mut bytes = tokio::fs::read(&sealed).await.unwrap();
        bytes[15] ^= 0xff;
        tokio::fs::write(&sealed, &bytes).await.unwrap();

        let err = TransactionLog::open(TransactionLogConfig::new(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, TlogError::Corrupted { .. }));
    }
}
