//! Outbound upstream connector.
//!
//! One task per configured upstream endpoint keeps a TCP connection alive,
//! reconnecting with exponential backoff until the supervisor shuts the
//! group down.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{FeedLabel, FeedRegistry, pump_lines};
use crate::observer::FlightObserver;

/// Delay before the first reconnection attempt
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Cap on the reconnection delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(20);
/// Growth factor between attempts
const BACKOFF_FACTOR: f64 = std::f64::consts::E;

/// Jitterless exponential backoff, reset on every successful connect.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay: INITIAL_RETRY_DELAY,
        }
    }

    pub fn reset(&mut self) {
        self.delay = INITIAL_RETRY_DELAY;
    }

    /// The delay to sleep before the next attempt; grows for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = self.delay.mul_f64(BACKOFF_FACTOR).min(MAX_RETRY_DELAY);
        current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Maintain one upstream feed connection until `shutdown` fires.
pub async fn run_upstream_client(
    addr: String,
    observer: Arc<FlightObserver>,
    feeds: Arc<FeedRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (feed_id, stats) = feeds.add(addr.clone(), FeedLabel::OutboundConnector);
    let mut backoff = Backoff::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            connected = TcpStream::connect(addr.as_str()) => match connected {
                Ok(stream) => {
                    info!(%addr, "upstream connection established");
                    stats.record_connect();
                    metrics::counter!("feed.connects_total").increment(1);
                    backoff.reset();

                    tokio::select! {
                        _ = shutdown.recv() => break,
                        result = pump_lines(stream, &stats, &observer) => match result {
                            Ok(()) => info!(%addr, "upstream connection closed by peer"),
                            Err(e) => warn!(%addr, error = %e, "upstream read failed"),
                        }
                    }
                }
                Err(e) => {
                    warn!(%addr, error = %e, "upstream connect failed");
                    metrics::counter!("feed.connect_failures_total").increment(1);
                }
            }
        }

        // connect failed or the connection dropped: back off, then retry
        let delay = backoff.next_delay();
        debug!(%addr, ?delay, "reconnecting after backoff");
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = sleep(delay) => {}
        }
    }

    feeds.remove(feed_id);
    debug!(%addr, "upstream client stopped");
}
