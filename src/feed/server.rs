//! Inbound upstream listener.
//!
//! Feeders may also push SBS-1 streams to us. Accepted connections run the
//! same line/parser/counter path as outbound connectors but never
//! reconnect; the remote end owns the connection lifecycle.

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::{FeedLabel, FeedRegistry, pump_lines};
use crate::observer::FlightObserver;

pub async fn run_upstream_listener(
    listener: TcpListener,
    observer: Arc<FlightObserver>,
    feeds: Arc<FeedRegistry>,
) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "upstream listener accepting feeder connections"),
        Err(e) => warn!(error = %e, "upstream listener address unavailable"),
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let (feed_id, stats) = feeds.add(peer.to_string(), FeedLabel::Listener);
                stats.record_connect();
                metrics::counter!("feed.inbound_connects_total").increment(1);
                info!(%peer, "inbound feeder connected");

                let observer = observer.clone();
                let feeds = feeds.clone();
                tokio::spawn(async move {
                    match pump_lines(stream, &stats, &observer).await {
                        Ok(()) => info!(%peer, "inbound feeder disconnected"),
                        Err(e) => warn!(%peer, error = %e, "inbound feeder read failed"),
                    }
                    feeds.remove(feed_id);
                });
            }
            Err(e) => {
                error!(error = %e, "accepting feeder connection failed");
                metrics::counter!("feed.accept_errors_total").increment(1);
            }
        }
    }
}
