//! Public API surface tests.

use std::time::Duration;

use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream};
use relay::nats::prelude::*;

/// Accept one connection, greet it and answer every PING.
/// Sends each control line it reads to `lines`.
async fn tiny_server(lines: flume::Sender<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    compio::runtime::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut s: &TcpStream = &stream;
        let BufResult(res, _) = s
            .write_all(b"INFO {\"server_id\":\"tiny\",\"headers\":true}\r\n".to_vec())
            .await;
        res.unwrap();

        let mut pending = String::new();
        loop {
            let BufResult(res, chunk) = AsyncRead::read(&mut s, Vec::with_capacity(1024)).await;
            match res {
                Ok(0) | Err(_) => break,
                Ok(_) => pending.push_str(&String::from_utf8_lossy(&chunk)),
            }
            while let Some(end) = pending.find("\r\n") {
                let line: String = pending.drain(..end + 2).collect();
                let line = line.trim_end().to_string();
                if line == "PING" {
                    let BufResult(res, _) = s.write_all(b"PONG\r\n".to_vec()).await;
                    if res.is_err() {
                        return;
                    }
                }
                let _ = lines.send(line);
            }
        }
    })
    .detach();

    format!("nats://{addr}")
}

#[compio::test]
async fn test_connect_helper() {
    relay::dev_tracing::init_tracing();
    let (tx, rx) = flume::unbounded();
    let url = tiny_server(tx).await;

    let client = relay::nats::connect(&url).await.unwrap();
    assert_eq!(client.status(), Status::Connected);
    assert_eq!(client.server_info().unwrap().server_id, "tiny");

    let connect = rx.recv_async().await.unwrap();
    assert!(connect.starts_with("CONNECT {"));
    assert!(connect.contains("\"headers\":true"));

    client.ping(Some(Duration::from_secs(1))).await.unwrap();
    client.publish("facade.test", Bytes::from_static(b"ok")).unwrap();
    client.ping(Some(Duration::from_secs(1))).await.unwrap();

    let seen: Vec<String> = rx.drain().collect();
    assert!(seen.iter().any(|l| l == "PUB facade.test 2"));

    client.disconnect().await.unwrap();
    assert_eq!(client.status(), Status::Closed);
}

#[compio::test]
async fn test_connect_helper_rejects_bad_url() {
    let err = relay::nats::connect("nats://host:notaport").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidAddress(_) | ClientError::Config(_)));
}

#[test]
fn test_options_reexported() {
    let options = ClientOptions::default().with_name("facade");
    assert_eq!(options.name.as_deref(), Some("facade"));
    assert_eq!(Status::Disconnected.to_string(), "disconnected");
}
