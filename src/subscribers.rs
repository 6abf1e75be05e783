//! Downstream subscriber registry.
//!
//! One entry per connected downstream session, TCP or WebSocket. The
//! dispatcher iterates the registry every tick and enqueues frames on each
//! admitted subscriber's outbound queue; session tasks drain their queue
//! onto the transport. Registration and removal notify the feed supervisor
//! so the upstream group follows subscriber presence.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::bounding_box::BoundingBox;
use crate::feed::supervisor::FeedSupervisor;

/// Outbound queue depth per subscriber. The dispatcher never blocks; frames
/// beyond this are dropped until the session catches up.
pub const SUBSCRIBER_QUEUE_SIZE: usize = 512;

/// One encoded update on its way to a subscriber
#[derive(Debug, Clone)]
pub enum Frame {
    /// Newline-terminated JSON (TCP lines, WebSocket text frames)
    Text(Bytes),
    /// GeoBuf (WebSocket binary frames)
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubProtocol {
    AdsbGeobuf,
    AdsbJson,
}

impl SubProtocol {
    /// Advertised sub-protocols, in server preference order
    pub const ADVERTISED: [SubProtocol; 2] = [SubProtocol::AdsbGeobuf, SubProtocol::AdsbJson];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubProtocol::AdsbGeobuf => "adsb-geobuf",
            SubProtocol::AdsbJson => "adsb-json",
        }
    }

    pub fn names() -> [&'static str; 2] {
        [
            SubProtocol::AdsbGeobuf.as_str(),
            SubProtocol::AdsbJson.as_str(),
        ]
    }

    /// Server-side selection: the first protocol we advertise that the
    /// client's comma-separated offer contains.
    pub fn from_offer(offer: &str) -> Option<SubProtocol> {
        Self::ADVERTISED
            .into_iter()
            .find(|p| offer.split(',').any(|o| o.trim() == p.as_str()))
    }
}

#[derive(Debug, Clone)]
pub enum SubscriberKind {
    Tcp,
    WebSocket {
        protocol: SubProtocol,
        user: Option<String>,
    },
}

#[derive(Debug)]
pub struct Subscriber {
    pub peer: SocketAddr,
    pub kind: SubscriberKind,
    pub bbox: BoundingBox,
    pub last_heard: DateTime<Utc>,
    sender: flume::Sender<Frame>,
}

impl Subscriber {
    /// Non-blocking enqueue toward the session task
    pub fn try_send(&self, frame: Frame) -> Result<(), flume::TrySendError<Frame>> {
        self.sender.try_send(frame)
    }
}

/// Introspection row for the status page
#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub kind: SubscriberKind,
    pub bbox: BoundingBox,
    pub last_heard: DateTime<Utc>,
}

/// Handed to the session task on registration
pub struct Registration {
    pub id: u64,
    pub frames: flume::Receiver<Frame>,
}

pub struct SubscriberRegistry {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    supervisor: Arc<FeedSupervisor>,
}

impl SubscriberRegistry {
    pub fn new(supervisor: Arc<FeedSupervisor>) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
            supervisor,
        }
    }

    pub async fn register(
        &self,
        peer: SocketAddr,
        kind: SubscriberKind,
        bbox: BoundingBox,
    ) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, frames) = flume::bounded(SUBSCRIBER_QUEUE_SIZE);
        self.subscribers.insert(
            id,
            Subscriber {
                peer,
                kind,
                bbox,
                last_heard: Utc::now(),
                sender,
            },
        );

        let count = self.subscribers.len();
        info!(id, %peer, count, "subscriber registered");
        metrics::gauge!("subscribers.active").set(count as f64);
        self.supervisor.subscribers_changed(count).await;

        Registration { id, frames }
    }

    pub async fn unregister(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            let count = self.subscribers.len();
            info!(id, count, "subscriber unregistered");
            metrics::gauge!("subscribers.active").set(count as f64);
            self.supervisor.subscribers_changed(count).await;
        }
    }

    pub fn update_bbox(&self, id: u64, bbox: BoundingBox) {
        if let Some(mut subscriber) = self.subscribers.get_mut(&id) {
            subscriber.bbox = bbox;
        }
    }

    /// Record subscriber liveness (control pong, inbound traffic)
    pub fn touch(&self, id: u64, now: DateTime<Utc>) {
        if let Some(mut subscriber) = self.subscribers.get_mut(&id) {
            subscriber.last_heard = now;
        }
    }

    /// Enqueue a frame for a single subscriber, e.g. a validation error
    /// reply. Returns false if the subscriber is gone or its queue is full.
    pub fn push(&self, id: u64, frame: Frame) -> bool {
        match self.subscribers.get(&id) {
            Some(subscriber) => subscriber.try_send(frame).is_ok(),
            None => false,
        }
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(u64, &Subscriber),
    {
        for entry in self.subscribers.iter() {
            f(*entry.key(), entry.value());
        }
    }

    pub fn snapshot(&self) -> Vec<SubscriberInfo> {
        self.subscribers
            .iter()
            .map(|entry| SubscriberInfo {
                id: *entry.key(),
                peer: entry.peer,
                kind: entry.kind.clone(),
                bbox: entry.bbox,
                last_heard: entry.last_heard,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subprotocol_selection_prefers_server_order() {
        assert_eq!(
            SubProtocol::from_offer("adsb-json, adsb-geobuf"),
            Some(SubProtocol::AdsbGeobuf)
        );
        assert_eq!(
            SubProtocol::from_offer("adsb-json"),
            Some(SubProtocol::AdsbJson)
        );
        assert_eq!(SubProtocol::from_offer("chat"), None);
        assert_eq!(SubProtocol::from_offer(""), None);
    }
}
