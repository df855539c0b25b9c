//! Transport seam.
//!
//! The connection engine only needs to open a byte stream to a server, read
//! chunks from it, write whole buffers to it and close it. [`Connector`]
//! captures that contract so TLS or in-memory transports can be plugged in;
//! [`TcpConnector`] is the plain TCP implementation on compio.
//!
//! # Safety
//!
//! Setting `TCP_NODELAY` borrows the raw socket through `socket2`. The fd is
//! never closed by that borrow.

#![allow(unsafe_code)]

use std::io;
use std::rc::Rc;

use async_trait::async_trait;
use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use compio::net::TcpStream;
use tracing::{debug, trace};

use crate::endpoint::ServerAddr;
use crate::options::ClientOptions;

/// Read half of an open transport.
#[async_trait(?Send)]
pub trait TransportRead {
    /// Read up to `max` bytes. An empty chunk means the peer closed the stream.
    async fn read_chunk(&mut self, max: usize) -> io::Result<Bytes>;
}

/// Write half of an open transport.
#[async_trait(?Send)]
pub trait TransportWrite {
    /// Write the whole buffer.
    async fn write_all(&mut self, buf: Bytes) -> io::Result<()>;

    /// Shut the stream down. Pending reads on the other half observe EOF.
    async fn close(&mut self) -> io::Result<()>;
}

/// An open, not yet handshaken, byte stream to one server.
pub struct Transport {
    pub reader: Box<dyn TransportRead>,
    pub writer: Box<dyn TransportWrite>,
    /// Whether the stream is encrypted.
    pub secure: bool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

/// Opens transports. Shared by every clone of a client.
#[async_trait(?Send)]
pub trait Connector: Send + Sync {
    /// Dial `addr`.
    async fn open(&self, addr: &ServerAddr, options: &ClientOptions) -> io::Result<Transport>;
}

/// Plain TCP connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait(?Send)]
impl Connector for TcpConnector {
    async fn open(&self, addr: &ServerAddr, options: &ClientOptions) -> io::Result<Transport> {
        if addr.tls_required() || options.tls_required {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{addr} requires TLS; supply a TLS connector"),
            ));
        }

        let target = addr.dial_target();
        debug!("[TCP] Dialing {}", target);
        let stream = TcpStream::connect(target.as_str()).await?;

        if options.tcp_nodelay {
            enable_tcp_nodelay(&stream)?;
        }

        let stream = Rc::new(stream);
        Ok(Transport {
            reader: Box::new(TcpReader {
                stream: Rc::clone(&stream),
            }),
            writer: Box::new(TcpWriter { stream }),
            secure: false,
        })
    }
}

struct TcpReader {
    stream: Rc<TcpStream>,
}

#[async_trait(?Send)]
impl TransportRead for TcpReader {
    async fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        let mut stream: &TcpStream = &self.stream;
        let BufResult(result, buf) = AsyncRead::read(&mut stream, Vec::with_capacity(max)).await;
        let n = result?;
        trace!("[TCP] Read {} bytes", n);
        Ok(Bytes::from(buf))
    }
}

struct TcpWriter {
    stream: Rc<TcpStream>,
}

#[async_trait(?Send)]
impl TransportWrite for TcpWriter {
    async fn write_all(&mut self, buf: Bytes) -> io::Result<()> {
        let mut stream: &TcpStream = &self.stream;
        let len = buf.len();
        let BufResult(result, _) = stream.write_all(buf.to_vec()).await;
        result?;
        trace!("[TCP] Wrote {} bytes", len);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut stream: &TcpStream = &self.stream;
        AsyncWrite::shutdown(&mut stream).await
    }
}

/// Enable `TCP_NODELAY` on a compio `TcpStream`.
///
/// Protocol traffic is many small control lines; Nagle's algorithm would
/// hold PINGs and PUBs back.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(stream: &TcpStream) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let result = sock.set_nodelay(true);
        std::mem::forget(sock); // Don't close the fd
        result
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        let result = sock.set_nodelay(true);
        std::mem::forget(sock); // Don't close the socket
        result
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = stream;
        Ok(())
    }
}
