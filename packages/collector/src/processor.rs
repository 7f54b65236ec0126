//! Observation Processor
//!
//! The single consumer of the ingress channel. Owns the dedup cache, the
//! per-source counters and the open bucket files; nothing here is shared with
//! other tasks. For each observation it writes a sourcelog row and, when the
//! hash is new, a transactions row followed by fan-out to receivers and live
//! subscribers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Write as _};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::TxHash;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::encode_raw;
use crate::files::{FileError, FileKind, FileManager};
use crate::metrics::Metrics;
use crate::observation::Observation;
use crate::receivers::ReceiverPool;
use crate::sse::SubscriberHub;

/// How long a first-seen hash suppresses later sightings, in seconds
pub const CACHE_TTL_SECS: i64 = 5 * 60;

/// Period of cache eviction, file closing and stats reporting
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Errors that can occur while processing one observation
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    File(#[from] FileError),

    #[error("Failed to append {kind:?} row: {source}")]
    Write {
        kind: FileKind,
        #[source]
        source: io::Error,
    },
}

/// What happened to an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// First sighting inside the TTL window; written and fanned out
    FirstSeen,
    /// Already written within the TTL window
    Duplicate,
}

/// `hash → first_seen` with a fixed time-to-live
#[derive(Debug)]
pub struct TxCache {
    entries: HashMap<TxHash, DateTime<Utc>>,
    ttl: TimeDelta,
}

impl Default for TxCache {
    fn default() -> Self {
        Self::new(TimeDelta::seconds(CACHE_TTL_SECS))
    }
}

impl TxCache {
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Whether `hash` was first seen less than one TTL before `at`
    pub fn is_duplicate(&self, hash: &TxHash, at: DateTime<Utc>) -> bool {
        self.entries
            .get(hash)
            .is_some_and(|first_seen| at - *first_seen < self.ttl)
    }

    pub fn insert(&mut self, hash: TxHash, first_seen: DateTime<Utc>) {
        self.entries.insert(hash, first_seen);
    }

    /// Drop entries at least one TTL old; returns how many were removed
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, first_seen| now - *first_seen < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
struct SourceCounters {
    all: u64,
    first: u64,
    unique: HashSet<TxHash>,
}

/// Per-source counters for the current reporting interval
#[derive(Debug, Default)]
pub struct SourceStats {
    // BTreeMap keeps the log lines in a stable order
    sources: BTreeMap<String, SourceCounters>,
    write_errors: u64,
}

impl SourceStats {
    fn record(&mut self, source: &str, hash: TxHash) {
        let counters = self.sources.entry(source.to_string()).or_default();
        counters.all += 1;
        counters.unique.insert(hash);
    }

    fn record_first(&mut self, source: &str) {
        self.sources.entry(source.to_string()).or_default().first += 1;
    }

    pub fn all(&self, source: &str) -> u64 {
        self.sources.get(source).map_or(0, |c| c.all)
    }

    pub fn first(&self, source: &str) -> u64 {
        self.sources.get(source).map_or(0, |c| c.first)
    }

    pub fn unique(&self, source: &str) -> usize {
        self.sources.get(source).map_or(0, |c| c.unique.len())
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    fn summary<T: fmt::Display>(&self, value: impl Fn(&SourceCounters) -> T) -> String {
        let mut out = String::new();
        for (source, counters) in &self.sources {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{source}={}", value(counters));
        }
        out
    }

    /// Emit the interval report and start a new interval
    pub fn log_and_reset(&mut self) {
        info!(sources = %self.summary(|c| c.all), "stats: all observations");
        info!(sources = %self.summary(|c| c.first), "stats: first seen");
        info!(
            sources = %self.summary(|c| c.unique.len()),
            write_errors = self.write_errors,
            "stats: unique hashes"
        );
        *self = Self::default();
    }
}

/// Dedup and fan-out stage
pub struct Processor {
    files: FileManager,
    cache: TxCache,
    stats: SourceStats,
    receivers: Option<ReceiverPool>,
    hub: Option<Arc<SubscriberHub>>,
    metrics: Option<Metrics>,
}

impl Processor {
    pub fn new(files: FileManager) -> Self {
        Self {
            files,
            cache: TxCache::default(),
            stats: SourceStats::default(),
            receivers: None,
            hub: None,
            metrics: None,
        }
    }

    pub fn with_receivers(mut self, receivers: ReceiverPool) -> Self {
        if !receivers.is_empty() {
            self.receivers = Some(receivers);
        }
        self
    }

    pub fn with_hub(mut self, hub: Arc<SubscriberHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: TimeDelta) -> Self {
        self.cache = TxCache::new(ttl);
        self
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    pub fn cache(&self) -> &TxCache {
        &self.cache
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    /// Record one observation
    ///
    /// Failed disk writes are counted and returned; the observation is
    /// dropped and never reaches the cache.
    pub fn process(&mut self, obs: &Observation) -> Result<Outcome, ProcessError> {
        let result = self.write_and_fan_out(obs);

        if result.is_err() {
            self.stats.write_errors += 1;
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe(&obs.source, matches!(result, Ok(Outcome::FirstSeen)));
        }
        result
    }

    fn write_and_fan_out(&mut self, obs: &Observation) -> Result<Outcome, ProcessError> {
        let hash = obs.hash();
        self.stats.record(&obs.source, hash);

        let arrival_ms = obs.arrival_ms();
        let hash_hex = obs.tx.hash_hex();
        let (files, _) = self.files.get_files(obs.arrival)?;

        files
            .write_sourcelog(arrival_ms, &hash_hex, &obs.source)
            .map_err(|source| ProcessError::Write {
                kind: FileKind::Sourcelog,
                source,
            })?;

        if self.cache.is_duplicate(&hash, obs.arrival) {
            return Ok(Outcome::Duplicate);
        }

        let raw = encode_raw(&obs.tx);
        let raw_hex = format!("0x{}", hex::encode(&raw));
        files
            .write_transaction(arrival_ms, &hash_hex, &raw_hex)
            .map_err(|source| ProcessError::Write {
                kind: FileKind::Transactions,
                source,
            })?;

        self.cache.insert(hash, obs.arrival);
        self.stats.record_first(&obs.source);
        debug!(source = %obs.source, hash = %hash_hex, "first seen");

        if let Some(receivers) = &self.receivers {
            receivers.dispatch(&obs.source, raw);
        }
        if let Some(hub) = &self.hub {
            let report = hub.broadcast(&raw_hex);
            if report.dropped > 0 {
                debug!(hash = %hash_hex, dropped = report.dropped, "sse event dropped for slow subscribers");
            }
        }

        Ok(Outcome::FirstSeen)
    }

    fn handle(&mut self, obs: Observation) {
        if let Err(e) = self.process(&obs) {
            error!(
                source = %obs.source,
                hash = %obs.tx.hash_hex(),
                error = %e,
                "dropping observation"
            );
        }
    }

    /// Push buffered rows of every open bucket to disk
    ///
    /// # Returns
    /// Number of buckets that failed to flush
    pub fn flush(&mut self) -> usize {
        self.files.flush_all()
    }

    /// Periodic maintenance: evict the cache, close old buckets, flush the
    /// rest, report stats
    pub fn housekeeping(&mut self, now: DateTime<Utc>) {
        let evicted = self.cache.evict_expired(now);
        let closed = self.files.close_expired(now);
        let flush_failed = self.files.flush_all();
        debug!(evicted, closed, flush_failed, cached = self.cache.len(), "housekeeping");
        self.stats.log_and_reset();
    }

    /// Consume observations until cancelled or every sender is gone
    ///
    /// On cancellation the channel is drained best-effort and all files are
    /// closed before returning.
    pub async fn run(mut self, mut ingress: mpsc::Receiver<Observation>, cancel: CancellationToken) -> Self {
        let mut ticker = interval_at(Instant::now() + HOUSEKEEPING_INTERVAL, HOUSEKEEPING_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(uid = %self.files.uid(), out = %self.files.out().display(), "processor started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                received = ingress.recv() => match received {
                    Some(obs) => self.handle(obs),
                    None => {
                        info!("ingress closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.housekeeping(Utc::now()),
            }
        }

        ingress.close();
        let mut drained = 0usize;
        while let Ok(obs) = ingress.try_recv() {
            self.handle(obs);
            drained += 1;
        }

        let closed = self.files.close_all();
        self.stats.log_and_reset();
        info!(drained, closed, "processor stopped");
        self
    }
}
