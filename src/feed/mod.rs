//! Upstream feed handling: outbound connectors, the inbound listener and
//! the supervisor tying feed activity to subscriber presence.

pub mod client;
pub mod server;
pub mod supervisor;

pub use client::run_upstream_client;
pub use server::run_upstream_listener;
pub use supervisor::FeedSupervisor;

use chrono::Utc;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use crate::observer::FlightObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedLabel {
    OutboundConnector,
    Listener,
}

impl fmt::Display for FeedLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedLabel::OutboundConnector => write!(f, "outbound connector"),
            FeedLabel::Listener => write!(f, "listener"),
        }
    }
}

/// Per-feed counters shown on the status page
#[derive(Debug)]
pub struct FeedStats {
    pub peer: String,
    pub label: FeedLabel,
    connects: AtomicU64,
    lines: AtomicU64,
    bytes: AtomicU64,
}

impl FeedStats {
    fn new(peer: String, label: FeedLabel) -> Self {
        Self {
            peer,
            label,
            connects: AtomicU64::new(0),
            lines: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_line(&self, len: usize) {
        self.lines.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Registry of active feeds, for the status page
pub struct FeedRegistry {
    feeds: DashMap<u64, Arc<FeedStats>>,
    next_id: AtomicU64,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self {
            feeds: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add(&self, peer: String, label: FeedLabel) -> (u64, Arc<FeedStats>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let stats = Arc::new(FeedStats::new(peer, label));
        self.feeds.insert(id, stats.clone());
        (id, stats)
    }

    pub fn remove(&self, id: u64) {
        self.feeds.remove(&id);
    }

    pub fn snapshot(&self) -> Vec<Arc<FeedStats>> {
        self.feeds.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl Default for FeedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared read loop for outbound and inbound feeds: frame the stream into
/// lines (LF or CRLF), count them and hand each to the observer. Returns on
/// EOF or read error.
pub(crate) async fn pump_lines(
    stream: TcpStream,
    stats: &FeedStats,
    observer: &FlightObserver,
) -> anyhow::Result<()> {
    let reader = BufReader::new(stream);
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        stats.record_line(line.len());
        metrics::counter!("feed.lines_total").increment(1);
        if line.trim().is_empty() {
            continue;
        }
        observer.ingest_line(&line, Utc::now());
    }
    Ok(())
}
