//! HTTP status reporter.
//!
//! `GET /` renders a plain HTML snapshot of the hub: observation rates,
//! transmission type distribution, active feeds, connected subscribers and
//! the currently presentable aircraft. `GET /metrics` exposes the
//! Prometheus registry.

use axum::{Router, extract::State, response::Html, routing::get};
use chrono::Utc;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::feed::FeedRegistry;
use crate::observer::{FlightObserver, OBSERVATION_CLEAN_INTERVAL};
use crate::subscribers::{SubscriberKind, SubscriberRegistry};

/// Install the Prometheus recorder. Must run before any metric is emitted.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

#[derive(Clone)]
pub struct StatusState {
    pub observer: Arc<FlightObserver>,
    pub registry: Arc<SubscriberRegistry>,
    pub feeds: Arc<FeedRegistry>,
    pub metrics: PrometheusHandle,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/", get(status_page))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

pub async fn serve_status(listener: TcpListener, state: StatusState) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "status reporter listening");
    }
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn render_metrics(State(state): State<StatusState>) -> String {
    state.metrics.render()
}

async fn status_page(State(state): State<StatusState>) -> Html<String> {
    let stats = state.observer.stats();
    let now = Utc::now();

    let mut page = String::new();
    let _ = write!(
        page,
        "<html>\n<head><title>ADS-B feed statistics</title></head>\n<body>\n\
         <h1>ADS-B feed statistics as of {now}</h1>\n\
         <h2>Observation statistics (last {OBSERVATION_CLEAN_INTERVAL} seconds)</h2>\n<table>\n\
         <tr><td>currently observing:</td><td>{} aircraft</td></tr>\n\
         <tr><td>observation rate:</td><td>{:.1}/s</td></tr>\n\
         <tr><td>message rate:</td><td>{:.1}/s</td></tr>\n</table>\n",
        stats.aircraft, stats.observation_rate, stats.message_rate,
    );

    page.push_str("<h2>SBS-1 message type distribution</h2>\n<table>\n");
    for (name, pct) in &stats.distribution {
        let _ = write!(page, "<tr><td>{name}</td><td>{pct}%</td></tr>\n");
    }
    page.push_str("</table>\n");

    page.push_str(
        "<h2>ADS-B feeders</h2>\n<table>\n\
         <tr><th>feed</th><th>(re)connects</th><th>msgs received</th><th>total bytes</th><th>type</th></tr>\n",
    );
    for feed in state.feeds.snapshot() {
        let _ = write!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            feed.peer,
            feed.connects(),
            feed.lines(),
            feed.bytes(),
            feed.label,
        );
    }
    page.push_str("</table>\n");

    let mut ws_rows = String::new();
    let mut tcp_rows = String::new();
    for subscriber in state.registry.snapshot() {
        match &subscriber.kind {
            SubscriberKind::Tcp => {
                let _ = write!(
                    tcp_rows,
                    "<tr><td>{}</td><td>{}</td></tr>\n",
                    subscriber.peer, subscriber.bbox,
                );
            }
            SubscriberKind::WebSocket { protocol, user } => {
                let heard = (now - subscriber.last_heard).num_milliseconds() as f64 / 1000.0;
                let _ = write!(
                    ws_rows,
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{heard:.1} s ago</td></tr>\n",
                    subscriber.peer,
                    subscriber.bbox,
                    user.as_deref().unwrap_or("-"),
                    protocol.as_str(),
                );
            }
        }
    }
    let _ = write!(
        page,
        "<h2>Websocket clients</h2>\n<table>\n\
         <tr><th>peer</th><th>bbox</th><th>user</th><th>protocol</th><th>last heard</th></tr>\n{ws_rows}</table>\n\
         <h2>TCP clients</h2>\n<table>\n<tr><th>peer</th><th>bbox</th></tr>\n{tcp_rows}</table>\n",
    );

    page.push_str(
        "<h2>Aircraft observed</h2>\n<table>\n\
         <tr><th>icao</th><th>callsign</th><th>squawk</th><th>lat</th><th>lon</th>\
         <th>altitude</th><th>speed</th><th>vspeed</th><th>heading</th></tr>\n",
    );
    for obs in state.observer.snapshot() {
        let Some(view) = obs.presentable_view(now) else {
            continue;
        };
        let _ = write!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            view.icao24,
            view.callsign,
            view.squawk.as_deref().unwrap_or(""),
            view.lat,
            view.lon,
            view.altitude,
            view.speed,
            view.vspeed,
            view.heading,
        );
    }
    page.push_str("</table>\n</body>\n</html>\n");

    Html(page)
}
