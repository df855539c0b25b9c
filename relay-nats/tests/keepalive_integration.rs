//! Keepalive PINGs and stale-connection detection.

mod common;

use std::time::{Duration, Instant};

use common::{eventually, FakeServer};
use relay_core::prelude::*;
use relay_core::timeout::{sleep, timeout};
use relay_nats::Client;

const INTERVAL: Duration = Duration::from_millis(100);

fn options(server: &FakeServer) -> ClientOptions {
    ClientOptions::default()
        .with_servers([server.url()])
        .with_ping_interval(INTERVAL)
        .with_max_outstanding_pings(2)
        .with_connect_timeout(Duration::from_millis(300))
        .with_reconnect_time_wait(Duration::from_millis(50))
}

#[compio::test]
async fn test_keepalive_rate_with_healthy_peer() {
    common::init_tracing();
    let server = FakeServer::start("A").await;
    let client = Client::new(options(&server)).unwrap();
    client.connect().await.unwrap();
    let handshake_pings = server.pings();

    sleep(INTERVAL * 10 + INTERVAL / 2).await;

    let keepalives = server.pings() - handshake_pings;
    assert!(
        (8..=11).contains(&keepalives),
        "expected about one PING per interval, got {keepalives}"
    );
    assert_eq!(client.status(), Status::Connected);
    assert!(client.last_error().is_none());
}

#[compio::test]
async fn test_stale_connection_detected() {
    let server = FakeServer::start("A").await;
    let client = Client::new(options(&server)).unwrap();
    client.connect().await.unwrap();
    let events = client.events();

    server.set_answer_pings(false);
    let handshake_pings = server.pings();
    assert!(eventually(Duration::from_secs(1), || server.pings() > handshake_pings).await);
    let first_unanswered = Instant::now();

    let mut stale_at = None;
    let mut reconnecting = false;
    let detected = eventually(Duration::from_secs(2), || {
        for event in events.try_iter() {
            match event {
                ClientEvent::Error(ClientError::StaleConnection) => {
                    stale_at.get_or_insert_with(Instant::now);
                }
                ClientEvent::StatusChanged {
                    from: Status::Connected,
                    to: Status::Reconnecting,
                } => reconnecting = true,
                _ => {}
            }
        }
        stale_at.is_some() && reconnecting
    })
    .await;
    assert!(detected, "stale={stale_at:?} reconnecting={reconnecting}");

    // Two intervals after the first unanswered PING, within a tick or two.
    let after = stale_at.unwrap() - first_unanswered;
    assert!(
        after >= INTERVAL * 3 / 2 && after <= INTERVAL * 3,
        "stale declared {after:?} after the first unanswered PING"
    );
}

#[compio::test]
async fn test_explicit_ping() {
    let server = FakeServer::start("A").await;
    let client = Client::new(options(&server).with_ping_interval(Duration::ZERO)).unwrap();
    client.connect().await.unwrap();

    client.ping(Some(Duration::from_secs(1))).await.unwrap();
    client.ping(None).await.unwrap();

    server.set_answer_pings(false);
    let err = client.ping(Some(Duration::from_millis(100))).await.unwrap_err();
    assert_eq!(err, ClientError::Timeout);

    // With the timer disabled a silent peer is never declared stale.
    sleep(INTERVAL * 5).await;
    assert_eq!(client.status(), Status::Connected);
}

#[compio::test]
async fn test_ping_in_flight_fails_on_loss() {
    let server = FakeServer::start("A").await;
    let client = Client::new(options(&server).with_ping_interval(Duration::ZERO)).unwrap();
    client.connect().await.unwrap();
    server.set_answer_pings(false);

    let pinger = client.clone();
    let ping = compio::runtime::spawn(async move { pinger.ping(None).await });
    assert!(eventually(Duration::from_secs(1), || server.pings() >= 2).await);

    server.drop_connections();
    let outcome = timeout(Duration::from_secs(2), ping).await.unwrap();
    assert!(matches!(outcome, Err(ClientError::BrokenSocket(_))));
}
