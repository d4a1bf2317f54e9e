use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::post;
use chrono::Utc;
use tokio::sync::mpsc;

use blescout_domain::advertising::AdvertisingPayload;
use blescout_domain::clock::SystemClock;
use blescout_domain::discover::DiscoveryEvent;
use blescout_domain::filter::View;
use blescout_domain::registry::SharedRegistry;
use blescout_sinks::forwarder::{Forwarder, GatewayState};
use blescout_sinks::gateway::GatewayConfig;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn registry() -> SharedRegistry {
    let registry = SharedRegistry::new();
    registry.write().upsert(&DiscoveryEvent::new(
        Utc::now(),
        "AA:BB:CC:DD:EE:FF",
        -52,
        AdvertisingPayload {
            local_name: Some("Thermometer".to_string()),
            manufacturer_data: Some(vec![0x59, 0x00, 0x01, 0x00]),
            ..AdvertisingPayload::default()
        },
    ));
    registry
}

async fn wait_for_state<F>(forwarder: &Forwarder, accept: F) -> GatewayState
where
    F: Fn(&GatewayState) -> bool,
{
    let mut states = forwarder.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| accept(s)))
        .await
        .expect("gateway state did not settle")
        .unwrap()
        .clone();
    state
}

#[tokio::test]
async fn server_error_is_reported_and_timer_stays_armed() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = Router::new().route(
        "/ingest",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }),
    );
    let addr = serve(app).await;

    let registry = registry();
    let forwarder = Forwarder::new(registry.reader(), View::default(), Arc::new(SystemClock));
    let config = GatewayConfig::http(format!("http://{addr}/ingest")).with_interval_seconds(1);
    forwarder.enable(&config).await.unwrap();

    let state = wait_for_state(&forwarder, |s| matches!(s, GatewayState::Error(_))).await;
    match state {
        GatewayState::Error(message) => assert!(message.contains("500"), "{message}"),
        other => panic!("unexpected state {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(hits.load(Ordering::SeqCst) >= 2);
    assert!(forwarder.is_armed());

    forwarder.disable().await;
    assert_eq!(forwarder.state(), GatewayState::Disabled);
    assert!(!forwarder.is_armed());
}

#[tokio::test]
async fn posts_json_array_of_devices() {
    let (tx, mut rx) = mpsc::channel::<(Option<String>, Bytes)>(4);
    let app = Router::new().route(
        "/ingest",
        post(move |headers: HeaderMap, body: Bytes| {
            let tx = tx.clone();
            async move {
                let content_type = headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let _ = tx.send((content_type, body)).await;
                StatusCode::NO_CONTENT
            }
        }),
    );
    let addr = serve(app).await;

    let registry = registry();
    let forwarder = Forwarder::new(registry.reader(), View::default(), Arc::new(SystemClock));
    forwarder
        .enable(&GatewayConfig::http(format!("http://{addr}/ingest")))
        .await
        .unwrap();

    let (content_type, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content_type.as_deref(), Some("application/json"));

    let devices: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(devices[0]["id"], "AA:BB:CC:DD:EE:FF");
    assert_eq!(devices[0]["name"], "Thermometer");
    assert_eq!(devices[0]["rssi"], -52);
    assert_eq!(
        devices[0]["advertising"]["manufacturerData"],
        serde_json::json!([0x59, 0x00, 0x01])
    );

    let state = wait_for_state(&forwarder, |s| matches!(s, GatewayState::Connected { .. })).await;
    match state {
        GatewayState::Connected {
            next_publish_in, ..
        } => assert!(next_publish_in <= 10),
        other => panic!("unexpected state {other:?}"),
    }
    forwarder.disable().await;
}
