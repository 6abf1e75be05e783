//! WebSocket handshake and session tests with a real client.

use chrono::Utc;
use futures_util::StreamExt;
use geojson::Feature;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use sbs_hub::auth::JwtAuthenticator;
use sbs_hub::downstream::{WsState, serve_websocket};
use sbs_hub::fanout::run_dispatcher;
use sbs_hub::feed::{FeedRegistry, FeedSupervisor};
use sbs_hub::observer::FlightObserver;
use sbs_hub::subscribers::{SubProtocol, SubscriberRegistry};

const SECRET: &str = "test-secret";

struct WsHub {
    addr: SocketAddr,
    auth: Arc<JwtAuthenticator>,
    observer: Arc<FlightObserver>,
}

async fn start_ws_hub() -> WsHub {
    let observer = Arc::new(FlightObserver::new());
    let feeds = Arc::new(FeedRegistry::new());
    let supervisor = Arc::new(FeedSupervisor::new(
        Vec::new(),
        observer.clone(),
        feeds,
        true,
    ));
    let registry = Arc::new(SubscriberRegistry::new(supervisor));
    let auth = Arc::new(JwtAuthenticator::new(SECRET, &SubProtocol::names()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = WsState {
        registry: registry.clone(),
        auth: auth.clone(),
    };
    tokio::spawn(async move {
        let _ = serve_websocket(listener, state).await;
    });
    tokio::spawn(run_dispatcher(observer.clone(), registry));

    WsHub {
        addr,
        auth,
        observer,
    }
}

fn request(addr: SocketAddr, query: &str, protocol: Option<&str>) -> Request {
    let mut request = format!("ws://{addr}/{query}").into_client_request().unwrap();
    if let Some(protocol) = protocol {
        request
            .headers_mut()
            .insert("sec-websocket-protocol", protocol.parse().unwrap());
    }
    request
}

fn feed_aircraft(observer: &FlightObserver) {
    let now = Utc::now();
    observer.ingest_line(
        "MSG,1,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,TEST,,,,,,,,,,,",
        now,
    );
    observer.ingest_line(
        "MSG,3,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,10000,,,46.5,15.0,,,0,0,0,0",
        now,
    );
    observer.ingest_line(
        "MSG,4,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,,420,90,,,0,,0,0,0,0",
        now,
    );
}

/// Read frames until a close frame arrives and return its code.
async fn expect_close(
    ws: &mut (impl StreamExt<Item = Result<Message, WsError>> + Unpin),
) -> u16 {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no close frame within 5s");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => return frame.code.into(),
            Some(Ok(Message::Ping(_))) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_handshake_without_token_denied() {
    let hub = start_ws_hub().await;
    let (mut ws, _) = connect_async(request(hub.addr, "", Some("adsb-json")))
        .await
        .unwrap();
    assert_eq!(expect_close(&mut ws).await, 1066);
}

#[tokio::test]
async fn test_handshake_with_foreign_audience_denied() {
    let hub = start_ws_hub().await;
    // same secret, but an audience this server does not advertise
    let other = JwtAuthenticator::new(SECRET, &["other"]);
    let token = other
        .mint("github", 300, Utc::now() + chrono::Duration::hours(1))
        .unwrap();
    let (mut ws, _) = connect_async(request(
        hub.addr,
        &format!("?token={token}"),
        Some("adsb-json"),
    ))
    .await
    .unwrap();
    assert_eq!(expect_close(&mut ws).await, 1066);
}

#[tokio::test]
async fn test_handshake_without_acceptable_subprotocol_rejected() {
    let hub = start_ws_hub().await;

    for protocol in [None, Some("chat")] {
        let result = connect_async(request(hub.addr, "", protocol)).await;
        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
            other => panic!("expected HTTP 400, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_json_session_receives_features() {
    let hub = start_ws_hub().await;
    let token = hub
        .auth
        .mint("github", 300, Utc::now() + chrono::Duration::hours(1))
        .unwrap();

    // bbox from query parameters; the legacy options hint must be ignored
    let query = format!("?token={token}&min_latitude=40&max_latitude=50&options=geobuf");
    let (mut ws, response) = connect_async(request(hub.addr, &query, Some("adsb-json")))
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok()),
        Some("adsb-json")
    );

    feed_aircraft(&hub.observer);

    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame within 5s")
            .expect("connection ended")
            .unwrap();
        match msg {
            Message::Text(text) => {
                let feature: Feature = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(feature.properties.unwrap()["icao24"], "ABC123");
                break;
            }
            Message::Ping(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_geobuf_session_receives_binary_features() {
    let hub = start_ws_hub().await;
    let token = hub
        .auth
        .mint("github", 300, Utc::now() + chrono::Duration::hours(1))
        .unwrap();

    // offering both lets the server pick its preference: adsb-geobuf
    let query = format!("?token={token}");
    let (mut ws, response) = connect_async(request(
        hub.addr,
        &query,
        Some("adsb-geobuf, adsb-json"),
    ))
    .await
    .unwrap();
    assert_eq!(
        response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok()),
        Some("adsb-geobuf")
    );

    feed_aircraft(&hub.observer);

    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame within 5s")
            .expect("connection ended")
            .unwrap();
        match msg {
            Message::Binary(payload) => {
                let decoded = sbs_hub::geo::decode_geobuf(&payload).unwrap();
                assert_eq!(decoded["type"], "Feature");
                assert_eq!(decoded["properties"]["icao24"], "ABC123");
                break;
            }
            Message::Ping(_) => continue,
            other => panic!("expected a binary frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_session_closes_at_deadline() {
    let hub = start_ws_hub().await;
    // a one second duration budget, far-off absolute expiry
    let token = hub
        .auth
        .mint("github", 1, Utc::now() + chrono::Duration::hours(1))
        .unwrap();
    let (mut ws, _) = connect_async(request(
        hub.addr,
        &format!("?token={token}"),
        Some("adsb-json"),
    ))
    .await
    .unwrap();

    // the server closes cleanly once the duration budget is spent
    assert_eq!(expect_close(&mut ws).await, 1000);
}
