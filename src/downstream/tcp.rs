//! Plain TCP subscriber sessions.
//!
//! The simplest consumer interface: connect, receive one JSON feature per
//! line. No authentication, by design. Anything the client sends is treated
//! as a JSON bounding box update; an invalid update gets the structured
//! error object echoed back on the same socket.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::bounding_box::{self, BoundingBox};
use crate::subscribers::{Frame, Registration, SubscriberKind, SubscriberRegistry};

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub async fn run_tcp_listener(listener: TcpListener, registry: Arc<SubscriberRegistry>) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "downstream listener accepting subscribers"),
        Err(e) => warn!(error = %e, "downstream listener address unavailable"),
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    handle_subscriber(stream, peer, registry).await;
                });
            }
            Err(e) => {
                error!(error = %e, "accepting subscriber connection failed");
            }
        }
    }
}

async fn handle_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SubscriberRegistry>,
) {
    let Registration { id, frames } = registry
        .register(peer, SubscriberKind::Tcp, BoundingBox::default())
        .await;
    metrics::gauge!("tcp.subscribers").increment(1.0);

    let (mut reader, mut writer) = stream.into_split();

    // one writer task drains the outbound queue; error replies travel
    // through the same queue so frames stay ordered
    let write_task = tokio::spawn(async move {
        while let Ok(frame) = frames.recv_async().await {
            let Frame::Text(payload) = frame else {
                continue;
            };
            if let Err(e) = writer.write_all(&payload).await {
                debug!(%peer, error = %e, "subscriber write failed");
                break;
            }
        }
    });

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let payload = &buf[..n];
                if payload.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match bounding_box::validate_update(payload) {
                    Ok(bbox) => {
                        debug!(%peer, %bbox, "subscriber bbox updated");
                        registry.update_bbox(id, bbox);
                    }
                    Err(rejection) => {
                        info!(%peer, ?rejection, "subscriber bbox update failed");
                        metrics::counter!("subscribers.bbox_rejections_total").increment(1);
                        registry.push(id, Frame::Text(Bytes::from(rejection.to_json_bytes())));
                    }
                }
            }
            Err(e) => {
                debug!(%peer, error = %e, "subscriber read failed");
                break;
            }
        }
    }

    registry.unregister(id).await;
    write_task.abort();
    metrics::gauge!("tcp.subscribers").decrement(1.0);
    info!(%peer, "downstream subscriber disconnected");
}
