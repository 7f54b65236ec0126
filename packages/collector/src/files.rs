//! Bucketed CSV Files
//!
//! Every observation lands in a pair of append-only CSV files chosen by the
//! UTC hour it arrived in:
//!
//! ```text
//! <out>/<YYYY-MM-DD>/transactions/txs_<YYYY-MM-DD>_<HH-MM>_<uid>.csv
//! <out>/<YYYY-MM-DD>/sourcelog/src_<YYYY-MM-DD>_<HH-MM>_<uid>.csv
//! ```
//!
//! Files are opened lazily on first write and closed once wall-clock time has
//! moved two bucket widths past the bucket start. Rows are buffered in memory
//! and reach the disk on housekeeping, on close, or when the buffer fills, so
//! the processor never waits on a disk write per observation.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, DurationRound, NaiveDate, NaiveTime, TimeDelta, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Width of one file bucket in minutes
pub const BUCKET_MINUTES: i64 = 60;

/// Length of generated uids
pub const UID_LEN: usize = 6;

/// Errors that can occur while resolving or writing bucket files
#[derive(Error, Debug)]
pub enum FileError {
    #[error("File I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot bucket timestamp {0}")]
    Timestamp(String),

    #[error("Invalid uid {0:?}: must not contain '_' or path separators")]
    InvalidUid(String),

    #[error("Not a bucket file name: {0}")]
    InvalidName(String),
}

/// The two logs kept per bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Transactions,
    Sourcelog,
}

impl FileKind {
    /// Directory under the date directory
    pub fn dir_name(&self) -> &'static str {
        match self {
            FileKind::Transactions => "transactions",
            FileKind::Sourcelog => "sourcelog",
        }
    }

    /// File name prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            FileKind::Transactions => "txs",
            FileKind::Sourcelog => "src",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "txs" => Some(FileKind::Transactions),
            "src" => Some(FileKind::Sourcelog),
            _ => None,
        }
    }
}

/// Start of the bucket containing `ts`
pub fn bucket_start(ts: DateTime<Utc>) -> Result<DateTime<Utc>, FileError> {
    ts.duration_trunc(bucket_width())
        .map_err(|e| FileError::Timestamp(format!("{ts}: {e}")))
}

pub fn bucket_width() -> TimeDelta {
    TimeDelta::minutes(BUCKET_MINUTES)
}

/// Path of the file of `kind` for the bucket starting at `start`
pub fn bucket_path(out: &Path, kind: FileKind, start: DateTime<Utc>, uid: &str) -> PathBuf {
    let date = start.format("%Y-%m-%d").to_string();
    let name = format!(
        "{}_{}_{}_{}.csv",
        kind.prefix(),
        date,
        start.format("%H-%M"),
        uid
    );
    out.join(&date).join(kind.dir_name()).join(name)
}

/// Components recovered from a bucket file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketFileName {
    pub date: NaiveDate,
    pub kind: FileKind,
    pub bucket: DateTime<Utc>,
    pub uid: String,
}

impl BucketFileName {
    /// Parse `<prefix>_<YYYY-MM-DD>_<HH-MM>_<uid>.csv`; directories are ignored
    pub fn parse(path: &Path) -> Result<Self, FileError> {
        let invalid = || FileError::InvalidName(path.display().to_string());

        let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;
        let stem = name.strip_suffix(".csv").ok_or_else(invalid)?;

        let mut parts = stem.splitn(4, '_');
        let (Some(prefix), Some(date), Some(time), Some(uid)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if !is_valid_uid(uid) {
            return Err(invalid());
        }

        let kind = FileKind::from_prefix(prefix).ok_or_else(invalid)?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;
        let time = NaiveTime::parse_from_str(time, "%H-%M").map_err(|_| invalid())?;

        Ok(Self {
            date,
            kind,
            bucket: date.and_time(time).and_utc(),
            uid: uid.to_string(),
        })
    }
}

/// Six random alphanumerics
pub fn random_uid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(UID_LEN)
        .map(char::from)
        .collect()
}

/// Uids become part of the file name, so `_` and separators are rejected
pub fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty() && !uid.contains(['_', '/', '\\'])
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Open handles for one bucket
#[derive(Debug)]
pub struct BucketFiles {
    pub start: DateTime<Utc>,
    transactions: BufWriter<File>,
    sourcelog: Option<BufWriter<File>>,
}

impl BucketFiles {
    /// Append `arrival_ms,hash,raw_tx_hex`
    pub fn write_transaction(&mut self, arrival_ms: i64, hash: &str, raw_hex: &str) -> io::Result<()> {
        let line = format!("{arrival_ms},{hash},{raw_hex}\n");
        self.transactions.write_all(line.as_bytes())
    }

    /// Append `arrival_ms,hash,source`; a no-op when the sourcelog is disabled
    pub fn write_sourcelog(&mut self, arrival_ms: i64, hash: &str, source: &str) -> io::Result<()> {
        match self.sourcelog.as_mut() {
            Some(file) => file.write_all(format!("{arrival_ms},{hash},{source}\n").as_bytes()),
            None => Ok(()),
        }
    }

    pub fn has_sourcelog(&self) -> bool {
        self.sourcelog.is_some()
    }

    /// Push buffered rows to the OS
    pub fn flush(&mut self) -> io::Result<()> {
        self.transactions.flush()?;
        if let Some(file) = self.sourcelog.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Owner of all open bucket files
///
/// Only the processor task touches a `FileManager`, so it needs no locking.
#[derive(Debug)]
pub struct FileManager {
    out: PathBuf,
    uid: String,
    write_sourcelog: bool,
    open: HashMap<DateTime<Utc>, BucketFiles>,
}

impl FileManager {
    /// Create a manager rooted at `out`
    ///
    /// # Arguments
    /// * `out` - Base output directory
    /// * `uid` - File name uid; a random one is generated when `None`
    /// * `write_sourcelog` - Whether to keep the per-observation sourcelog
    pub fn new(out: impl Into<PathBuf>, uid: Option<String>, write_sourcelog: bool) -> Result<Self, FileError> {
        let uid = match uid {
            Some(uid) if is_valid_uid(&uid) => uid,
            Some(uid) => return Err(FileError::InvalidUid(uid)),
            None => random_uid(),
        };

        Ok(Self {
            out: out.into(),
            uid,
            write_sourcelog,
            open: HashMap::new(),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn out(&self) -> &Path {
        &self.out
    }

    /// Resolve the files for `ts`, opening them if this bucket is new
    ///
    /// # Returns
    /// The bucket handles and whether they were created by this call
    pub fn get_files(&mut self, ts: DateTime<Utc>) -> Result<(&mut BucketFiles, bool), FileError> {
        let start = bucket_start(ts)?;

        match self.open.entry(start) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), false)),
            Entry::Vacant(entry) => {
                let files = open_bucket(&self.out, &self.uid, self.write_sourcelog, start)?;
                info!(bucket = %start, uid = %self.uid, "opened bucket files");
                Ok((entry.insert(files), true))
            }
        }
    }

    /// Close buckets whose start is more than two widths before `now`
    ///
    /// # Returns
    /// Number of buckets closed
    pub fn close_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.open.len();
        let lifetime = bucket_width() * 2;
        self.open.retain(|start, files| {
            let keep = now <= *start + lifetime;
            if !keep {
                if let Err(e) = files.flush() {
                    debug!(bucket = %start, error = %e, "flush on close failed");
                }
                debug!(bucket = %start, "closed bucket files");
            }
            keep
        });
        before - self.open.len()
    }

    /// Flush every open bucket without closing it
    ///
    /// # Returns
    /// Number of buckets that failed to flush
    pub fn flush_all(&mut self) -> usize {
        let mut failed = 0;
        for (start, files) in self.open.iter_mut() {
            if let Err(e) = files.flush() {
                warn!(bucket = %start, error = %e, "flush failed");
                failed += 1;
            }
        }
        failed
    }

    /// Flush and close every open bucket
    pub fn close_all(&mut self) -> usize {
        let closed = self.open.len();
        for (start, mut files) in self.open.drain() {
            if let Err(e) = files.flush() {
                debug!(bucket = %start, error = %e, "flush on close failed");
            }
        }
        closed
    }

    /// Starts of currently open buckets, oldest first
    pub fn open_buckets(&self) -> Vec<DateTime<Utc>> {
        let mut starts: Vec<_> = self.open.keys().copied().collect();
        starts.sort();
        starts
    }
}

fn open_bucket(out: &Path, uid: &str, write_sourcelog: bool, start: DateTime<Utc>) -> Result<BucketFiles, FileError> {
    let transactions = BufWriter::new(open_append(&bucket_path(out, FileKind::Transactions, start, uid))?);
    let sourcelog = if write_sourcelog {
        Some(BufWriter::new(open_append(&bucket_path(out, FileKind::Sourcelog, start, uid))?))
    } else {
        None
    };

    Ok(BucketFiles {
        start,
        transactions,
        sourcelog,
    })
}

fn open_append(path: &Path) -> Result<File, FileError> {
    let io_err = |source| FileError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o777);
        }
        builder.create(dir).map_err(io_err)?;
    }

    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(io_err)
}
