//! Connection handshake that completes before the engine takes the socket.
//!
//! 1. Read the server's INFO greeting
//! 2. Send CONNECT followed by PING in a single write
//! 3. Wait for the PONG, answering PINGs and skipping `+OK`/INFO meanwhile
//!
//! A `-ERR` at any point fails the attempt with the mapped error. Bytes that
//! arrive after the PONG stay in the returned decoder.

use bytes::BytesMut;
use tracing::debug;

use relay_core::endpoint::ServerAddr;
use relay_core::error::{ClientError, Result};
use relay_core::options::ClientOptions;
use relay_core::timeout::timeout;
use relay_core::transport::{Connector, Transport};

use crate::codec::{ClientOp, ProtoDecoder, ServerOp};
use crate::info::{ConnectInfo, ServerInfo};

/// Result of a successful handshake
#[derive(Debug)]
pub struct Handshake {
    pub transport: Transport,
    pub info: ServerInfo,
    pub decoder: ProtoDecoder,
}

/// Dial `addr` and handshake, all within `connect_timeout`.
pub async fn connect_with_timeout(
    connector: &dyn Connector,
    addr: &ServerAddr,
    options: &ClientOptions,
) -> Result<Handshake> {
    let attempt = async {
        let transport = connector.open(addr, options).await?;
        perform_handshake(transport, options).await
    };
    match timeout(options.connect_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => {
            debug!("[HANDSHAKE] {} timed out after {:?}", addr, options.connect_timeout);
            Err(ClientError::Timeout)
        }
    }
}

/// Performs the protocol handshake on a freshly opened transport.
pub async fn perform_handshake(
    mut transport: Transport,
    options: &ClientOptions,
) -> Result<Handshake> {
    let mut decoder = ProtoDecoder::new();

    // Step 1: INFO greeting
    let mut info = match next_op(&mut transport, &mut decoder, options).await? {
        ServerOp::Info(info) => *info,
        ServerOp::Err(reason) => return Err(ClientError::from_server(&reason)),
        other => {
            return Err(ClientError::protocol(format!(
                "expected INFO greeting, got {other:?}"
            )))
        }
    };
    debug!(
        "[HANDSHAKE] Greeting from server_id={} version={}",
        info.server_id, info.version
    );
    decoder.set_max_payload(info.max_payload);

    if info.tls_required && !transport.secure {
        return Err(ClientError::config(
            "server requires TLS but the transport is not secure",
        ));
    }

    // Step 2: CONNECT + PING
    let mut out = BytesMut::new();
    ClientOp::Connect(&ConnectInfo::new(options, &info)).encode(&mut out)?;
    ClientOp::Ping.encode(&mut out)?;
    transport.writer.write_all(out.freeze()).await?;
    debug!("[HANDSHAKE] Sent CONNECT");

    // Step 3: wait for PONG
    loop {
        match next_op(&mut transport, &mut decoder, options).await? {
            ServerOp::Pong => break,
            ServerOp::Ok => {}
            ServerOp::Info(update) => info = *update,
            ServerOp::Ping => {
                transport.writer.write_all(ClientOp::Pong.to_bytes()?).await?;
            }
            ServerOp::Err(reason) => {
                debug!("[HANDSHAKE] Rejected: {}", reason);
                return Err(ClientError::from_server(&reason));
            }
            ServerOp::Msg(msg) => {
                return Err(ClientError::protocol(format!(
                    "unexpected MSG on sid {} during handshake",
                    msg.sid
                )))
            }
        }
    }

    debug!("[HANDSHAKE] Handshake complete with {}", info.server_id);
    Ok(Handshake {
        transport,
        info,
        decoder,
    })
}

async fn next_op(
    transport: &mut Transport,
    decoder: &mut ProtoDecoder,
    options: &ClientOptions,
) -> Result<ServerOp> {
    loop {
        if let Some(op) = decoder.decode()? {
            return Ok(op);
        }
        let chunk = transport.reader.read_chunk(options.read_buffer_size).await?;
        if chunk.is_empty() {
            return Err(ClientError::broken_socket("connection closed during handshake"));
        }
        decoder.push(&chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use relay_core::transport::{TransportRead, TransportWrite};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    struct ScriptedRead(VecDeque<&'static [u8]>);

    #[async_trait(?Send)]
    impl TransportRead for ScriptedRead {
        async fn read_chunk(&mut self, _max: usize) -> io::Result<Bytes> {
            Ok(self.0.pop_front().map(Bytes::from_static).unwrap_or_default())
        }
    }

    struct CapturingWrite(Arc<Mutex<Vec<u8>>>);

    #[async_trait(?Send)]
    impl TransportWrite for CapturingWrite {
        async fn write_all(&mut self, buf: Bytes) -> io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(&buf);
            Ok(())
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn scripted(chunks: &[&'static [u8]]) -> (Transport, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let transport = Transport {
            reader: Box::new(ScriptedRead(chunks.iter().copied().collect())),
            writer: Box::new(CapturingWrite(Arc::clone(&written))),
            secure: false,
        };
        (transport, written)
    }

    #[compio::test]
    async fn test_handshake_success_keeps_leftover() {
        let (transport, written) = scripted(&[
            b"INFO {\"server_id\":\"A\",\"connect_urls\":[\"b:4222\"]}\r\n",
            b"+OK\r\nPING\r\n",
            b"PONG\r\nMSG x 1 2\r\nhi\r\n",
        ]);
        let options = ClientOptions::default().with_verbose(true);

        let mut hs = perform_handshake(transport, &options).await.unwrap();
        assert_eq!(hs.info.server_id, "A");
        assert_eq!(hs.info.connect_urls, vec!["b:4222".to_string()]);

        let wire = String::from_utf8(written.lock().unwrap().clone()).unwrap();
        assert!(wire.starts_with("CONNECT {"));
        assert!(wire.contains("\"verbose\":true"));
        assert!(wire.ends_with("PING\r\nPONG\r\n"));

        assert!(matches!(hs.decoder.decode().unwrap(), Some(ServerOp::Msg(_))));
    }

    #[compio::test]
    async fn test_handshake_rejected() {
        let (transport, _) = scripted(&[
            b"INFO {}\r\n",
            b"-ERR 'Authorization Violation'\r\n",
        ]);
        let err = perform_handshake(transport, &ClientOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Authorization(_)));
    }

    #[compio::test]
    async fn test_handshake_requires_info_first() {
        let (transport, _) = scripted(&[b"PONG\r\n"]);
        let err = perform_handshake(transport, &ClientOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[compio::test]
    async fn test_handshake_eof() {
        let (transport, _) = scripted(&[b"INFO {}\r\n"]);
        let err = perform_handshake(transport, &ClientOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::BrokenSocket(_)));
    }

    #[compio::test]
    async fn test_handshake_tls_mismatch() {
        let (transport, _) = scripted(&[b"INFO {\"tls_required\":true}\r\n"]);
        let err = perform_handshake(transport, &ClientOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
