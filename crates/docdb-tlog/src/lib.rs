// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! docdb transaction log
//!
//! Append-only, serial-number-indexed log of feed operations and config
//! changes for one document database. The document database writes every
//! mutating operation here before applying it, and replays the log from the
//! oldest unflushed serial number after a restart.
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   00000000000000000001.tlog   sealed segment, entries 1..=N
//!   000000000000000000NN.tlog   active segment (appends go here)
//! ```
//!
//! Each segment is a sequence of framed entries (see [`frame`]). Segment
//! names carry the serial number of their first entry, padded to 20 digits
//! so lexical and numeric order agree.
//!
//! # Usage
//!
//! ```rust,ignore
//! use docdb_tlog::{Entry, EntryType, TransactionLog, TransactionLogConfig};
//!
//! let log = TransactionLog::open(TransactionLogConfig::new("/data/music/tlog")).await?;
//! log.append(&Entry::new(1, EntryType::FeedOperation, payload)).await?;
//! for entry in log.replay(1, log.last_serial().await).await? {
//!     // apply entry
//! }
//! log.prune(1).await?;
//! ```

pub mod error;
pub mod frame;
pub mod log;
pub mod segment;

pub use error::{Result, TlogError};
pub use frame::{Entry, EntryType};
pub use log::{SerialRange, TransactionLog, TransactionLogConfig};

/// Monotonic sequence number of a logged entry. `0` means "no entry".
pub type SerialNum = u64;
