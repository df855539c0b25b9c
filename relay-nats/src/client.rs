//! Client handle.
//!
//! [`Client`] is a cheap, cloneable handle. It validates input, encodes
//! commands and hands them to the connection engine, which owns the socket.
//! Publishing never blocks: while the client is reconnecting, commands are
//! buffered and flushed in order once a server accepts the connection.
//!
//! ```no_run
//! use relay_core::prelude::*;
//! use relay_nats::Client;
//!
//! # async fn demo() -> relay_core::error::Result<()> {
//! let client = Client::new(ClientOptions::default().with_servers(["nats://127.0.0.1:4222"]))?;
//! client.connect().await?;
//!
//! let sub = client.subscribe("greetings.>")?;
//! client.publish("greetings.en", "hello")?;
//! let msg = sub.next().await;
//! # let _ = msg;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use relay_core::endpoint::ServerAddr;
use relay_core::error::{ClientError, Result};
use relay_core::monitor::{create_monitor, ClientEvent, ClientEventSender, ClientMonitor, Status};
use relay_core::options::ClientOptions;
use relay_core::pool::{ServerEntry, ServerPool};
use relay_core::subject;
use relay_core::timeout::timeout as with_timeout;
use relay_core::transport::{Connector, TcpConnector};

use crate::codec::ClientOp;
use crate::correlator::Responder;
use crate::engine::{Command, Engine, ReadyWaiter};
use crate::info::ServerInfo;
use crate::message::{Message, Sid};
use crate::registry::{Sink, Subscription};

/// State visible to both the handles and the engine.
pub(crate) struct Shared {
    pub(crate) options: ClientOptions,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) current: Mutex<Option<ServerAddr>>,
    pub(crate) server_info: Mutex<Option<ServerInfo>>,
    status: Mutex<Status>,
    last_error: Mutex<Option<ClientError>>,
    servers: Mutex<Vec<ServerEntry>>,
    listeners: Mutex<Vec<ClientEventSender>>,
    commands: Mutex<Option<flume::Sender<Command>>>,
    next_sid: AtomicU64,
    pending_bytes: AtomicUsize,
}

impl Shared {
    fn status(&self) -> Status {
        *self.status.lock()
    }

    /// Record a transition and notify listeners.
    pub(crate) fn set_status(&self, to: Status) {
        let from = {
            let mut status = self.status.lock();
            if *status == to {
                return;
            }
            std::mem::replace(&mut *status, to)
        };
        self.emit(ClientEvent::StatusChanged { from, to });
    }

    pub(crate) fn record_error(&self, err: ClientError) {
        *self.last_error.lock() = Some(err.clone());
        self.emit(ClientEvent::Error(err));
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    pub(crate) fn publish_pool(&self, pool: &ServerPool) {
        *self.servers.lock() = pool.servers();
        *self.current.lock() = pool.current().cloned();
    }

    pub(crate) fn set_pending_bytes(&self, bytes: usize) {
        self.pending_bytes.store(bytes, Ordering::Release);
    }
}

struct ClientInner {
    shared: Arc<Shared>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Last handle gone: the engine sees its command channel close and
        // disconnects.
        self.shared.commands.lock().take();
    }
}

/// Options for [`Client::subscribe_with_options`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Load-balance with other members of this group.
    pub queue_group: Option<String>,
    /// Unsubscribe automatically after this many messages. Must be at least 1.
    pub max_messages: Option<u64>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    #[must_use]
    pub fn with_max_messages(mut self, max: u64) -> Self {
        self.max_messages = Some(max);
        self
    }
}

/// Handle to one client connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client that dials plain TCP.
    ///
    /// Nothing is dialed until [`Client::connect`].
    pub fn new(options: ClientOptions) -> Result<Self> {
        Self::with_connector(options, TcpConnector)
    }

    /// Create a client that opens sockets through `connector`.
    pub fn with_connector(options: ClientOptions, connector: impl Connector + 'static) -> Result<Self> {
        options.validate()?;
        let seeds = options.server_addrs()?;
        let shared = Arc::new(Shared {
            servers: Mutex::new(ServerPool::new(seeds, false).servers()),
            options,
            connector: Arc::new(connector),
            current: Mutex::new(None),
            server_info: Mutex::new(None),
            status: Mutex::new(Status::Disconnected),
            last_error: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            commands: Mutex::new(None),
            next_sid: AtomicU64::new(1),
            pending_bytes: AtomicUsize::new(0),
        });
        Ok(Self {
            inner: Arc::new(ClientInner { shared }),
        })
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Connect and wait until the first handshake succeeds.
    ///
    /// Servers are tried in pool order, each bounded by `connect_timeout`.
    /// Fails with [`ClientError::NoServers`] once every server has used up
    /// its attempts. Returns immediately if already connected.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = flume::bounded(1);
        self.start(Some(tx))?;
        rx.recv_async()
            .await
            .map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Start connecting without waiting.
    ///
    /// Commands issued before the handshake completes are buffered. Must be
    /// called from within a compio runtime.
    pub fn connect_in_background(&self) -> Result<()> {
        self.start(None)
    }

    fn start(&self, ready: Option<ReadyWaiter>) -> Result<()> {
        let shared = self.shared();
        let mut commands = shared.commands.lock();

        match shared.status() {
            Status::Disconnected | Status::Closed => {
                let seeds = shared.options.server_addrs()?;
                let (tx, rx) = flume::unbounded();
                *commands = Some(tx);

                // A closed client starts over from disconnected.
                *shared.status.lock() = Status::Disconnected;
                shared.set_pending_bytes(0);
                shared.set_status(Status::Connecting);

                let engine = Engine::new(Arc::clone(shared), rx, seeds, ready);
                compio::runtime::spawn(engine.run()).detach();
                Ok(())
            }
            Status::Connected => {
                if let Some(ready) = ready {
                    let _ = ready.send(Ok(()));
                }
                Ok(())
            }
            Status::Connecting | Status::Reconnecting => {
                if let Some(ready) = ready {
                    commands
                        .as_ref()
                        .ok_or(ClientError::ConnectionClosed)?
                        .send(Command::AwaitReady(ready))
                        .map_err(|_| ClientError::ConnectionClosed)?;
                }
                Ok(())
            }
        }
    }

    /// Close the connection gracefully.
    ///
    /// Queued writes are flushed before the socket is shut down. Pending
    /// requests are not failed; each still resolves by reply or deadline.
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = flume::bounded(1);
        {
            let commands = self.shared().commands.lock();
            let Some(sender) = commands.as_ref() else {
                return Ok(());
            };
            if sender.send(Command::Disconnect(tx)).is_err() {
                return Ok(());
            }
        }
        let _ = rx.recv_async().await;
        debug!("[CLIENT] Disconnected");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Publishing
    // ---------------------------------------------------------------------

    /// Publish `payload` on `subject`.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_inner(subject, None, payload.into())
    }

    /// Publish with a reply-to subject.
    pub fn publish_with_reply(&self, subject: &str, reply: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_inner(subject, Some(reply), payload.into())
    }

    fn publish_inner(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()> {
        self.check_open()?;
        if self.shared().options.check_subjects {
            subject::validate_publish(subject)?;
            if let Some(reply) = reply {
                subject::validate_publish(reply)?;
            }
        }
        let bytes = ClientOp::Pub {
            subject,
            reply,
            payload: &payload,
        }
        .to_bytes()?;
        self.check_backpressure(bytes.len())?;
        self.send(Command::Send(bytes))
    }

    // ---------------------------------------------------------------------
    // Subscribing
    // ---------------------------------------------------------------------

    /// Subscribe to `subject`; messages arrive on the returned [`Subscriber`].
    pub fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        self.subscribe_with_options(subject, SubscribeOptions::default())
    }

    /// Subscribe as a member of `queue_group`.
    pub fn queue_subscribe(&self, subject: &str, queue_group: &str) -> Result<Subscriber> {
        self.subscribe_with_options(subject, SubscribeOptions::new().with_queue_group(queue_group))
    }

    pub fn subscribe_with_options(&self, subject: &str, options: SubscribeOptions) -> Result<Subscriber> {
        let (tx, rx) = flume::unbounded();
        let sid = self.register(subject, options, Sink::Channel(tx))?;
        Ok(Subscriber {
            sid,
            subject: subject.to_string(),
            receiver: rx,
            client: self.clone(),
        })
    }

    /// Subscribe with a callback run on the connection task.
    ///
    /// The callback must not block. Returns the subscription id for
    /// [`Client::unsubscribe`].
    pub fn subscribe_with_callback<F>(&self, subject: &str, options: SubscribeOptions, callback: F) -> Result<Sid>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.register(subject, options, Sink::Callback(Box::new(callback)))
    }

    fn register(&self, subject: &str, options: SubscribeOptions, sink: Sink) -> Result<Sid> {
        if options.max_messages == Some(0) {
            return Err(ClientError::config("max_messages must be at least 1"));
        }
        self.check_open()?;
        if self.shared().options.check_subjects {
            subject::validate_subscribe(subject)?;
            if let Some(group) = &options.queue_group {
                subject::validate_queue_group(group)?;
            }
        }
        let sid = self.next_sid();
        let sub = Subscription::new(subject, options.queue_group, sink).with_max_messages(options.max_messages);
        self.send(Command::Subscribe { sid, sub })?;
        Ok(sid)
    }

    /// Remove a subscription now.
    pub fn unsubscribe(&self, sid: Sid) -> Result<()> {
        self.send(Command::Unsubscribe { sid, max: None })
    }

    /// Remove a subscription after `max` messages in total.
    ///
    /// If `max` messages were already delivered it is removed now.
    pub fn unsubscribe_after(&self, sid: Sid, max: u64) -> Result<()> {
        self.send(Command::Unsubscribe { sid, max: Some(max) })
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    /// Publish a request and wait for the first reply.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Timeout`] if no reply arrives before `timeout`, or
    ///   the connection was lost while waiting
    /// - [`ClientError::NoResponders`] if the server reports no subscribers
    /// - [`ClientError::ConnectionClosed`] if the client closed
    pub async fn request(&self, subject: &str, payload: impl Into<Bytes>, timeout: Duration) -> Result<Message> {
        let (tx, rx) = flume::bounded(1);
        self.request_inner(subject, payload.into(), timeout, Responder::Waiter(tx))?;
        rx.recv_async()
            .await
            .map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Publish a request; `callback` runs once with the reply or the error.
    pub fn request_with_callback<F>(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        self.request_inner(subject, payload.into(), timeout, Responder::Callback(Box::new(callback)))
    }

    fn request_inner(&self, subject: &str, payload: Bytes, timeout: Duration, responder: Responder) -> Result<()> {
        self.check_open()?;
        if self.shared().options.check_subjects {
            subject::validate_publish(subject)?;
        }
        let inbox = self.new_inbox();
        self.check_backpressure(subject.len() + inbox.len() + payload.len() + 16)?;
        self.send(Command::Request {
            sid: self.next_sid(),
            inbox,
            subject: subject.to_string(),
            payload,
            deadline: Instant::now() + timeout,
            responder,
        })
    }

    /// A fresh, unique reply subject under the configured inbox prefix.
    pub fn new_inbox(&self) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(22)
            .map(char::from)
            .collect();
        format!("{}.{}", self.shared().options.inbox_prefix, token)
    }

    /// Round trip to the server.
    ///
    /// While reconnecting the PING is sent once a connection is back.
    /// `None` waits without a deadline.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<()> {
        let (tx, rx) = flume::bounded(1);
        self.send(Command::Ping(tx))?;
        let outcome = match timeout {
            Some(limit) => with_timeout(limit, rx.recv_async()).await?,
            None => rx.recv_async().await,
        };
        outcome.map_err(|_| ClientError::ConnectionClosed)?
    }

    // ---------------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------------

    pub fn status(&self) -> Status {
        self.shared().status()
    }

    /// Most recent error that affected the connection.
    pub fn last_error(&self) -> Option<ClientError> {
        self.shared().last_error.lock().clone()
    }

    /// Server of the current (or most recent) connection.
    pub fn current_server(&self) -> Option<ServerAddr> {
        self.shared().current.lock().clone()
    }

    /// Snapshot of the server pool, seeds and discovered servers alike.
    pub fn all_servers(&self) -> Vec<ServerEntry> {
        self.shared().servers.lock().clone()
    }

    /// The latest INFO received.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared().server_info.lock().clone()
    }

    /// Register a listener for lifecycle events.
    pub fn events(&self) -> ClientMonitor {
        let (tx, rx) = create_monitor();
        self.shared().listeners.lock().push(tx);
        rx
    }

    pub fn options(&self) -> &ClientOptions {
        &self.shared().options
    }

    /// Bytes waiting in the outgoing buffer.
    pub fn pending_bytes(&self) -> usize {
        self.shared().pending_bytes.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn next_sid(&self) -> Sid {
        self.shared().next_sid.fetch_add(1, Ordering::Relaxed)
    }

    fn check_open(&self) -> Result<()> {
        match self.status() {
            Status::Disconnected | Status::Closed => Err(ClientError::ConnectionClosed),
            _ => Ok(()),
        }
    }

    fn check_backpressure(&self, len: usize) -> Result<()> {
        let Some(limit) = self.shared().options.max_pending_bytes else {
            return Ok(());
        };
        if self.status() == Status::Connected {
            return Ok(());
        }
        let pending = self.pending_bytes() + len;
        if pending > limit {
            return Err(ClientError::Backpressure { pending, limit });
        }
        Ok(())
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.check_open()?;
        self.shared()
            .commands
            .lock()
            .as_ref()
            .ok_or(ClientError::ConnectionClosed)?
            .send(cmd)
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("status", &self.status())
            .field("current_server", &self.current_server())
            .finish_non_exhaustive()
    }
}

/// Receiving end of a channel subscription.
///
/// Dropping it without unsubscribing is allowed; the server is told on the
/// next message for this subscription.
pub struct Subscriber {
    sid: Sid,
    subject: String,
    receiver: flume::Receiver<Message>,
    client: Client,
}

impl Subscriber {
    pub const fn sid(&self) -> Sid {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the subscription is over and drained.
    pub async fn next(&self) -> Option<Message> {
        self.receiver.recv_async().await.ok()
    }

    /// Next message if one is already queued.
    pub fn try_next(&self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// The raw receiver, for use in `select!`.
    pub fn receiver(&self) -> &flume::Receiver<Message> {
        &self.receiver
    }

    pub fn unsubscribe(&self) -> Result<()> {
        self.client.unsubscribe(self.sid)
    }

    /// See [`Client::unsubscribe_after`].
    pub fn unsubscribe_after(&self, max: u64) -> Result<()> {
        self.client.unsubscribe_after(self.sid, max)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}
