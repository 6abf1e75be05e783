//! Lifecycle coupling between subscribers and the upstream client group.
//!
//! Upstream feeds cost the remote side bandwidth, so the outbound connector
//! group only runs while somebody is listening: the group starts when the
//! subscriber count rises from zero and stops when it falls back to zero.
//! A `permanent` deployment pins the group on from startup instead.

use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use super::FeedRegistry;
use super::client::run_upstream_client;
use crate::observer::FlightObserver;

struct FeedGroup {
    shutdown: broadcast::Sender<()>,
}

pub struct FeedSupervisor {
    upstreams: Vec<String>,
    observer: Arc<FlightObserver>,
    feeds: Arc<FeedRegistry>,
    permanent: bool,
    group: Mutex<Option<FeedGroup>>,
}

impl FeedSupervisor {
    pub fn new(
        upstreams: Vec<String>,
        observer: Arc<FlightObserver>,
        feeds: Arc<FeedRegistry>,
        permanent: bool,
    ) -> Self {
        Self {
            upstreams,
            observer,
            feeds,
            permanent,
            group: Mutex::new(None),
        }
    }

    /// Pin the group on for a `permanent` deployment. Called once at
    /// startup; a no-op otherwise.
    pub async fn start_permanent(&self) {
        if self.permanent {
            self.start_group().await;
        }
    }

    /// React to a subscriber count change. Transitions only fire on the
    /// zero boundary; intermediate counts leave the group alone.
    pub async fn subscribers_changed(&self, count: usize) {
        if self.permanent {
            return;
        }
        if count > 0 {
            self.start_group().await;
        } else {
            self.stop_group().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.group.lock().await.is_some()
    }

    async fn start_group(&self) {
        let mut group = self.group.lock().await;
        if group.is_some() {
            return;
        }
        info!(feeds = self.upstreams.len(), "starting upstream feed group");
        let (shutdown, _) = broadcast::channel(1);
        for addr in &self.upstreams {
            tokio::spawn(run_upstream_client(
                addr.clone(),
                self.observer.clone(),
                self.feeds.clone(),
                shutdown.subscribe(),
            ));
        }
        *group = Some(FeedGroup { shutdown });
    }

    async fn stop_group(&self) {
        let mut group = self.group.lock().await;
        if let Some(active) = group.take() {
            info!("stopping upstream feed group");
            // receivers may already be gone if every connect task failed
            if active.shutdown.send(()).is_err() {
                debug!("no upstream tasks were listening for shutdown");
            }
        }
    }
}
