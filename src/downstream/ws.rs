//! WebSocket subscriber sessions.
//!
//! The handshake negotiates a sub-protocol (server preference order) and
//! authorizes the session from a JWT passed as the `token` query parameter.
//! The initial bounding box comes from query parameters of the same names
//! as the update message fields. Open sessions are pinged every 30 s and
//! closed when their token-derived deadline fires.

use axum::{
    Router,
    extract::{
        ConnectInfo, Query, State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use crate::auth::{Claims, JwtAuthenticator};
use crate::bounding_box::{self, BoundingBox};
use crate::subscribers::{Frame, Registration, SubProtocol, SubscriberKind, SubscriberRegistry};

/// Control ping cadence while a session is open
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Close code sent when the handshake carries no usable token
pub const CLOSE_INVALID_TOKEN: u16 = 1066;

#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<SubscriberRegistry>,
    pub auth: Arc<JwtAuthenticator>,
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(state)
}

pub async fn serve_websocket(listener: TcpListener, state: WsState) -> anyhow::Result<()> {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "websocket listener accepting subscribers"),
        Err(e) => debug!(error = %e, "websocket listener address unavailable"),
    }
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<WsState>,
) -> Response {
    // server-side preference of sub-protocol; no overlap is a handshake error
    let offered = headers
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let Some(protocol) = SubProtocol::from_offer(offered) else {
        info!(%peer, offered, "no acceptable sub-protocol");
        return StatusCode::BAD_REQUEST.into_response();
    };
    let ws = ws.protocols([protocol.as_str()]);

    let claims = match params.get("token") {
        Some(token) => match state.auth.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                info!(%peer, error = %e, "token rejected");
                metrics::counter!("ws.auth_failures_total").increment(1);
                return ws.on_upgrade(move |socket| deny(socket, peer));
            }
        },
        None => {
            info!(%peer, "no token passed in URI");
            metrics::counter!("ws.auth_failures_total").increment(1);
            return ws.on_upgrade(move |socket| deny(socket, peer));
        }
    };

    // bbox bounds arrive as individual query parameters; anything else in
    // the query string (e.g. the legacy options=geobuf hint) is ignored
    let mut bbox = BoundingBox::default();
    bbox.apply_params(&params);

    let deadline = claims.session_deadline(Utc::now());
    debug!(%peer, usr = %claims.usr, %deadline, protocol = protocol.as_str(), "session authorized");

    ws.on_upgrade(move |socket| session(socket, state, peer, protocol, claims, bbox, deadline))
}

/// Accept the upgrade only to close it with the token error code.
async fn deny(mut socket: WebSocket, peer: SocketAddr) {
    let frame = CloseFrame {
        code: CLOSE_INVALID_TOKEN,
        reason: Utf8Bytes::from_static("no or invalid token"),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(%peer, error = %e, "sending close frame failed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn session(
    socket: WebSocket,
    state: WsState,
    peer: SocketAddr,
    protocol: SubProtocol,
    claims: Claims,
    bbox: BoundingBox,
    deadline: DateTime<Utc>,
) {
    let registry = state.registry;
    let Registration { id, frames } = registry
        .register(
            peer,
            SubscriberKind::WebSocket {
                protocol,
                user: Some(claims.usr.clone()),
            },
            bbox,
        )
        .await;
    metrics::gauge!("ws.subscribers").increment(1.0);
    info!(%peer, id, usr = %claims.usr, protocol = protocol.as_str(), "websocket session open");

    let (mut sink, mut stream) = socket.split();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let remaining = (deadline - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let expiry = tokio::time::sleep(remaining);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            _ = &mut expiry => {
                info!(%peer, id, "token validity time exceeded, closing");
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static("session expired"),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!(%peer, error = %e, "sending close frame failed");
                }
                break;
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                trace!(%peer, id, "ping sent");
            }
            frame = frames.recv_async() => match frame {
                Ok(Frame::Text(payload)) => match Utf8Bytes::try_from(payload) {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(%peer, error = %e, "dropping non-UTF-8 text frame"),
                },
                Ok(Frame::Binary(payload)) => {
                    if sink.send(Message::Binary(payload)).await.is_err() {
                        break;
                    }
                }
                // the registry dropped our queue; the session is over
                Err(_) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_bbox_update(&registry, id, peer, text.as_bytes());
                }
                Some(Ok(Message::Binary(payload))) => {
                    handle_bbox_update(&registry, id, peer, &payload);
                }
                Some(Ok(Message::Pong(_))) => {
                    trace!(%peer, id, "pong received");
                    registry.touch(id, Utc::now());
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(%peer, id, "closed by client");
                    break;
                }
                // pings are answered by the protocol layer
                Some(Ok(Message::Ping(_))) => {}
                Some(Err(e)) => {
                    debug!(%peer, id, error = %e, "websocket receive failed");
                    break;
                }
                None => break,
            }
        }
    }

    registry.unregister(id).await;
    metrics::gauge!("ws.subscribers").decrement(1.0);
    info!(%peer, id, "websocket session closed");
}

fn handle_bbox_update(registry: &SubscriberRegistry, id: u64, peer: SocketAddr, payload: &[u8]) {
    match bounding_box::validate_update(payload) {
        Ok(bbox) => {
            debug!(%peer, id, %bbox, "subscriber bbox updated");
            registry.update_bbox(id, bbox);
        }
        Err(rejection) => {
            info!(%peer, id, ?rejection, "subscriber bbox update failed");
            metrics::counter!("subscribers.bbox_rejections_total").increment(1);
            registry.push(id, Frame::Text(Bytes::from(rejection.to_json_bytes())));
        }
    }
}
