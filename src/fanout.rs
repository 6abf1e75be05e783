//! Periodic dispatcher.
//!
//! Every 300 ms the dispatcher walks the observation table, encodes each
//! presentable observation with unpublished changes once per wire format
//! and enqueues the shared buffers on every subscriber whose bounding box
//! admits the position. Enqueueing never blocks: a saturated subscriber
//! loses frames rather than stalling the tick, and ticks never overlap.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

use crate::geo;
use crate::observer::FlightObserver;
use crate::subscribers::{Frame, SubProtocol, SubscriberKind, SubscriberRegistry};

pub const DISPATCH_INTERVAL: Duration = Duration::from_millis(300);

pub async fn run_dispatcher(observer: Arc<FlightObserver>, registry: Arc<SubscriberRegistry>) {
    let mut interval = tokio::time::interval(DISPATCH_INTERVAL);
    // a slow tick delays the next one instead of bursting
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        dispatch_tick(&observer, &registry, Utc::now()).await;
    }
}

/// One dispatch pass over the observation table.
pub async fn dispatch_tick(
    observer: &FlightObserver,
    registry: &SubscriberRegistry,
    now: DateTime<Utc>,
) {
    if registry.is_empty() {
        return;
    }

    let mut dead: Vec<u64> = Vec::new();
    let mut sent = 0u64;
    let mut dropped = 0u64;

    observer.take_updated(|obs| {
        let Some(view) = obs.presentable_view(now) else {
            return;
        };
        let feature = geo::aircraft_feature(&view);
        let json = match geo::encode_json(&feature) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(icao24 = %view.icao24, error = %e, "feature encoding failed");
                return;
            }
        };
        let pbf = match geo::encode_geobuf(&feature) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(icao24 = %view.icao24, error = %e, "geobuf encoding failed");
                None
            }
        };

        registry.for_each(|id, subscriber| {
            if !subscriber
                .bbox
                .within(view.lat, view.lon, f64::from(view.altitude))
            {
                return;
            }
            let frame = match &subscriber.kind {
                SubscriberKind::Tcp => Some(Frame::Text(json.clone())),
                // a websocket session without an authenticated user gets nothing
                SubscriberKind::WebSocket { user: None, .. } => None,
                SubscriberKind::WebSocket {
                    protocol: SubProtocol::AdsbJson,
                    ..
                } => Some(Frame::Text(json.clone())),
                SubscriberKind::WebSocket {
                    protocol: SubProtocol::AdsbGeobuf,
                    ..
                } => pbf.clone().map(Frame::Binary),
            };
            let Some(frame) = frame else {
                return;
            };
            match subscriber.try_send(frame) {
                Ok(()) => sent += 1,
                Err(flume::TrySendError::Full(_)) => dropped += 1,
                Err(flume::TrySendError::Disconnected(_)) => dead.push(id),
            }
        });
    });

    if sent > 0 {
        metrics::counter!("fanout.frames_sent_total").increment(sent);
    }
    if dropped > 0 {
        metrics::counter!("fanout.frames_dropped_total").increment(dropped);
        warn!(dropped, "slow subscribers dropped frames");
    }
    for id in dead {
        registry.unregister(id).await;
    }
}
