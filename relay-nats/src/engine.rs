//! Connection engine.
//!
//! A single task owns all connection state: the socket, the server pool, the
//! subscription registry, pending requests, the outgoing buffer and the
//! pinger. Callers talk to it through a command channel; sockets talk to it
//! through an event channel fed by per-connection read and write pumps.
//!
//! Concurrency model:
//! - Single-threaded async task on the compio runtime.
//! - `futures::select!` over commands, socket events and a steady tick;
//!   each tick checks the pinger and request deadlines.
//! - Every connection attempt bumps a generation counter. Events carry the
//!   generation they belong to; anything from an older generation is stale
//!   and ignored.
//!
//! Status transitions:
//! - `Connecting → Connected` on handshake success
//! - `Connected → Reconnecting` on socket loss, fatal `-ERR` or stale pings
//! - `Reconnecting → Connected` after replaying SUBs then flushing the outbox
//! - `Connecting|Reconnecting → Closed` when the pool is exhausted
//! - `* → Closed` on `disconnect()`, which leaves pending requests to their
//!   own deadlines

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tracing::{debug, trace, warn};

use relay_core::endpoint::ServerAddr;
use relay_core::error::ClientError;
use relay_core::monitor::{ClientEvent, Status};
use relay_core::options::ClientOptions;
use relay_core::pool::ServerPool;
use relay_core::reconnect::ReconnectState;
use relay_core::timeout;
use relay_core::transport::{TransportRead, TransportWrite};

use crate::client::Shared;
use crate::codec::{ClientOp, ProtoDecoder, ServerOp};
use crate::correlator::{RequestCorrelator, Responder};
use crate::handshake::{connect_with_timeout, Handshake};
use crate::info::ServerInfo;
use crate::message::Sid;
use crate::outbox::Outbox;
use crate::pinger::{PingAction, Pinger, PongWaiter};
use crate::registry::{Dispatch, Sink, Subscription, SubscriptionRegistry};

/// Readiness waiter used by `connect()`.
pub(crate) type ReadyWaiter = flume::Sender<Result<(), ClientError>>;

/// Commands from client handles to the engine
pub(crate) enum Command {
    /// Encoded PUB (or other pass-through command).
    Send(Bytes),
    Subscribe {
        sid: Sid,
        sub: Subscription,
    },
    Unsubscribe {
        sid: Sid,
        max: Option<u64>,
    },
    Request {
        sid: Sid,
        inbox: String,
        subject: String,
        payload: Bytes,
        deadline: Instant,
        responder: Responder,
    },
    Ping(PongWaiter),
    AwaitReady(ReadyWaiter),
    Disconnect(flume::Sender<()>),
}

/// Events from dialers and socket pumps
pub(crate) enum Event {
    Dialed {
        generation: u64,
        addr: ServerAddr,
        result: Result<Handshake, ClientError>,
    },
    Data {
        generation: u64,
        chunk: Bytes,
    },
    Lost {
        generation: u64,
        err: ClientError,
    },
}

enum WriterCmd {
    Data(Bytes),
    Close(Option<flume::Sender<()>>),
}

enum Step {
    Command(Option<Command>),
    Event(Option<Event>),
    Tick,
}

/// The live socket.
struct Link {
    addr: ServerAddr,
    writer: flume::Sender<WriterCmd>,
    decoder: ProtoDecoder,
}

pub(crate) struct Engine {
    shared: Arc<Shared>,
    options: ClientOptions,
    status: Status,
    pool: ServerPool,
    reconnect: ReconnectState,
    registry: SubscriptionRegistry,
    correlator: RequestCorrelator,
    outbox: Outbox,
    pinger: Pinger,
    generation: u64,
    link: Option<Link>,
    dialing: bool,
    commands: Option<flume::Receiver<Command>>,
    events_tx: flume::Sender<Event>,
    events_rx: flume::Receiver<Event>,
    ready: Vec<ReadyWaiter>,
}

impl Engine {
    pub(crate) fn new(
        shared: Arc<Shared>,
        commands: flume::Receiver<Command>,
        seeds: Vec<ServerAddr>,
        ready: Option<ReadyWaiter>,
    ) -> Self {
        let options = shared.options.clone();
        let (events_tx, events_rx) = flume::unbounded();
        let pool = ServerPool::new(seeds, options.randomize);
        shared.publish_pool(&pool);
        Self {
            pool,
            reconnect: ReconnectState::new(&options),
            registry: SubscriptionRegistry::new(),
            correlator: RequestCorrelator::new(),
            outbox: Outbox::new(options.max_pending_bytes),
            pinger: Pinger::new(options.ping_interval, options.max_outstanding_pings),
            status: Status::Connecting,
            generation: 0,
            link: None,
            dialing: false,
            commands: Some(commands),
            events_tx,
            events_rx,
            ready: ready.into_iter().collect(),
            options,
            shared,
        }
    }

    /// Drive the connection until it is closed and no request is pending.
    pub(crate) async fn run(mut self) {
        use futures::select;

        debug!("[CONN] Engine started");
        let ticks = timeout::ticker();
        self.dial_next();

        while !(self.status == Status::Closed && self.correlator.is_empty()) {
            let step = {
                let commands = self.commands.clone();
                let command = async move {
                    match commands {
                        Some(rx) => rx.recv_async().await.ok(),
                        None => futures::future::pending().await,
                    }
                }
                .fuse();
                let event = self.events_rx.recv_async().fuse();
                let tick = ticks.recv_async().fuse();
                futures::pin_mut!(command, event, tick);

                select! {
                    cmd = command => Step::Command(cmd),
                    ev = event => Step::Event(ev.ok()),
                    _ = tick => Step::Tick,
                }
            };

            match step {
                Step::Command(Some(cmd)) => self.handle_command(cmd),
                Step::Command(None) => {
                    debug!("[CONN] All client handles dropped; shutting down");
                    self.commands = None;
                    self.shutdown(None);
                }
                Step::Event(Some(ev)) => self.handle_event(ev),
                // We hold a sender ourselves, so this cannot happen.
                Step::Event(None) => break,
                Step::Tick => {
                    if self.next_deadline().is_some_and(|at| at <= Instant::now()) {
                        self.handle_timer();
                    }
                }
            }
        }

        debug!("[CONN] Engine stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let ping = if self.status == Status::Connected {
            self.pinger.next_deadline()
        } else {
            None
        };
        match (ping, self.correlator.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        if self.status == Status::Closed {
            self.reject_command(cmd);
            return;
        }

        match cmd {
            Command::Send(bytes) => self.send(bytes),
            Command::Subscribe { sid, sub } => {
                if self.status == Status::Connected {
                    let mut out = BytesMut::new();
                    let _ = ClientOp::Sub {
                        subject: sub.subject(),
                        queue_group: sub.queue_group(),
                        sid,
                    }
                    .encode(&mut out);
                    if let Some(max) = sub.max_messages() {
                        let _ = ClientOp::Unsub { sid, max: Some(max) }.encode(&mut out);
                    }
                    self.write(out.freeze());
                }
                // Not connected: the SUB goes out with the replay on connect.
                self.registry.insert(sid, sub);
            }
            Command::Unsubscribe { sid, max } => {
                let active = match max {
                    Some(max) => self.registry.limit(sid, max),
                    None => {
                        self.registry.remove(sid);
                        false
                    }
                };
                if self.status == Status::Connected {
                    // Limit already met locally: drop it on the server now.
                    let max = max.filter(|_| active);
                    self.write_op(ClientOp::Unsub { sid, max });
                }
            }
            Command::Request {
                sid,
                inbox,
                subject,
                payload,
                deadline,
                responder,
            } => {
                let sub = Subscription::new(inbox.clone(), None, Sink::Request)
                    .with_max_messages(Some(1));
                if self.status == Status::Connected {
                    let mut out = BytesMut::new();
                    let _ = ClientOp::Sub {
                        subject: &inbox,
                        queue_group: None,
                        sid,
                    }
                    .encode(&mut out);
                    let _ = ClientOp::Unsub { sid, max: Some(1) }.encode(&mut out);
                    let _ = ClientOp::Pub {
                        subject: &subject,
                        reply: Some(&inbox),
                        payload: &payload,
                    }
                    .encode(&mut out);
                    self.write(out.freeze());
                } else {
                    let publish = ClientOp::Pub {
                        subject: &subject,
                        reply: Some(&inbox),
                        payload: &payload,
                    };
                    match publish.to_bytes() {
                        Ok(bytes) => {
                            if let Err(err) = self.queue(bytes) {
                                responder.respond(Err(err));
                                return;
                            }
                        }
                        Err(err) => {
                            responder.respond(Err(err.into()));
                            return;
                        }
                    }
                }
                self.registry.insert(sid, sub);
                self.correlator.register(sid, inbox, deadline, responder);
            }
            Command::Ping(waiter) => {
                if self.status == Status::Connected {
                    self.write_op(ClientOp::Ping);
                    self.pinger.track(waiter);
                } else {
                    self.pinger.defer(waiter);
                }
            }
            Command::AwaitReady(waiter) => {
                if self.status == Status::Connected {
                    let _ = waiter.send(Ok(()));
                } else {
                    self.ready.push(waiter);
                }
            }
            Command::Disconnect(done) => self.shutdown(Some(done)),
        }
    }

    /// Commands that raced with a close.
    fn reject_command(&mut self, cmd: Command) {
        match cmd {
            Command::Request { responder, .. } => {
                responder.respond(Err(ClientError::ConnectionClosed));
            }
            Command::Ping(waiter) => {
                let _ = waiter.send(Err(ClientError::ConnectionClosed));
            }
            Command::AwaitReady(waiter) => {
                let _ = waiter.send(Err(ClientError::ConnectionClosed));
            }
            Command::Disconnect(done) => {
                let _ = done.send(());
            }
            Command::Send(_) | Command::Subscribe { .. } | Command::Unsubscribe { .. } => {}
        }
    }

    // ---------------------------------------------------------------------
    // Output
    // ---------------------------------------------------------------------

    /// Pass-through while connected, buffered otherwise.
    fn send(&mut self, bytes: Bytes) {
        if self.status == Status::Connected {
            self.write(bytes);
        } else if let Err(err) = self.queue(bytes) {
            self.report(err);
        }
    }

    fn queue(&mut self, bytes: Bytes) -> Result<(), ClientError> {
        let result = self.outbox.push(bytes);
        self.shared.set_pending_bytes(self.outbox.pending_bytes());
        result
    }

    fn write(&mut self, bytes: Bytes) {
        if let Some(link) = &self.link {
            // A dead writer reports the loss through the event channel.
            let _ = link.writer.send(WriterCmd::Data(bytes));
        }
    }

    fn write_op(&mut self, op: ClientOp<'_>) {
        match op.to_bytes() {
            Ok(bytes) => self.write(bytes),
            Err(err) => self.report(err.into()),
        }
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Dialed {
                generation,
                addr,
                result,
            } => {
                if generation != self.generation || !self.dialing {
                    trace!("[CONN] Ignoring stale dial result for {}", addr);
                    return;
                }
                self.dialing = false;
                match result {
                    Ok(handshake) => self.on_connected(addr, handshake),
                    Err(err) => self.on_dial_failed(&addr, err),
                }
            }
            Event::Data { generation, chunk } => {
                if generation != self.generation {
                    return;
                }
                if let Some(link) = self.link.as_mut() {
                    link.decoder.push(&chunk);
                }
                self.process_ops();
            }
            Event::Lost { generation, err } => {
                if generation == self.generation && self.link.is_some() {
                    self.on_link_lost(err);
                }
            }
        }
    }

    fn process_ops(&mut self) {
        loop {
            let next = match self.link.as_mut() {
                Some(link) => link.decoder.decode(),
                None => return,
            };
            match next {
                Ok(Some(op)) => self.handle_op(op),
                Ok(None) => return,
                Err(err) => {
                    warn!("[CONN] Protocol error: {}", err);
                    self.on_link_lost(err.into());
                    return;
                }
            }
        }
    }

    fn handle_op(&mut self, op: ServerOp) {
        match op {
            ServerOp::Msg(mut msg) => {
                if self.options.utf8_convert {
                    msg.convert_utf8();
                }
                match self.registry.dispatch(msg) {
                    Dispatch::Delivered | Dispatch::Dropped => {}
                    Dispatch::Request(reply) => {
                        self.correlator.resolve(reply);
                    }
                    Dispatch::ReceiverGone(sid) => {
                        self.write_op(ClientOp::Unsub { sid, max: None });
                    }
                }
            }
            ServerOp::Ping => self.write_op(ClientOp::Pong),
            ServerOp::Pong => self.pinger.on_pong(),
            ServerOp::Ok => trace!("[CONN] +OK"),
            ServerOp::Info(info) => self.on_info(*info),
            ServerOp::Err(reason) => {
                let err = ClientError::from_server(&reason);
                if err.is_connection_fatal() {
                    self.on_link_lost(err);
                } else {
                    self.report(err);
                }
            }
        }
    }

    fn on_info(&mut self, info: ServerInfo) {
        if let Some(link) = self.link.as_mut() {
            link.decoder.set_max_payload(info.max_payload);
        }
        let added = self.pool.merge_discovered(&info.connect_urls);
        self.shared.publish_pool(&self.pool);
        if !added.is_empty() {
            self.shared.emit(ClientEvent::ServersDiscovered { added });
        }
        if info.ldm {
            if let Some(link) = &self.link {
                warn!("[CONN] {} entered lame duck mode", link.addr);
                self.shared.emit(ClientEvent::LameDuck(link.addr.clone()));
            }
        }
        *self.shared.server_info.lock() = Some(info);
    }

    fn handle_timer(&mut self) {
        let now = Instant::now();

        for sid in self.correlator.expire(now) {
            self.registry.remove(sid);
            if self.status == Status::Connected {
                self.write_op(ClientOp::Unsub { sid, max: None });
            }
        }

        if self.status == Status::Connected {
            match self.pinger.poll(now) {
                PingAction::Idle => {}
                PingAction::SendPing => self.write_op(ClientOp::Ping),
                PingAction::Stale => {
                    warn!("[CONN] No PONG for {} pings", self.options.max_outstanding_pings);
                    self.on_link_lost(ClientError::StaleConnection);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Schedule a dial to the next pool candidate, or close if none is left.
    fn dial_next(&mut self) {
        let Some(entry) = self.pool.next_candidate(self.options.max_reconnect_attempts) else {
            warn!("[CONN] Server pool exhausted");
            self.shared.publish_pool(&self.pool);
            self.report(ClientError::NoServers);
            self.close(ClientError::NoServers);
            return;
        };

        let wait = self.reconnect.next_delay();
        let delay = match entry.since_last_attempt() {
            Some(since) if since < wait => wait - since,
            _ => Duration::ZERO,
        };
        let addr = entry.addr().clone();
        self.pool.mark_attempt(&addr);
        self.shared.publish_pool(&self.pool);

        self.generation += 1;
        self.dialing = true;
        debug!("[CONN] Dialing {} in {:?} (gen={})", addr, delay, self.generation);

        let generation = self.generation;
        let connector = Arc::clone(&self.shared.connector);
        let options = self.options.clone();
        let events = self.events_tx.clone();
        compio::runtime::spawn(async move {
            if !delay.is_zero() {
                timeout::sleep(delay).await;
            }
            let result = connect_with_timeout(connector.as_ref(), &addr, &options).await;
            let _ = events.send(Event::Dialed {
                generation,
                addr,
                result,
            });
        })
        .detach();
    }

    fn on_dial_failed(&mut self, addr: &ServerAddr, err: ClientError) {
        debug!("[CONN] Dial to {} failed: {}", addr, err);
        let permanent = matches!(err, ClientError::Authorization(_));
        self.report(err);
        self.pool.mark_failed(addr, permanent);
        self.dial_next();
    }

    fn on_connected(&mut self, addr: ServerAddr, handshake: Handshake) {
        let Handshake {
            transport,
            info,
            decoder,
        } = handshake;
        debug!("[CONN] Connected to {} (server_id={})", addr, info.server_id);

        let generation = self.generation;
        let (writer_tx, writer_rx) = flume::unbounded();
        compio::runtime::spawn(read_pump(
            transport.reader,
            generation,
            self.events_tx.clone(),
            self.options.read_buffer_size,
        ))
        .detach();
        compio::runtime::spawn(write_pump(
            transport.writer,
            generation,
            writer_rx,
            self.events_tx.clone(),
        ))
        .detach();

        self.pool.mark_connected(&addr, info.tls_required);
        *self.shared.current.lock() = Some(addr.clone());
        self.link = Some(Link {
            addr,
            writer: writer_tx,
            decoder,
        });

        // Replay subscriptions, then the backlog, in one write.
        let mut out = BytesMut::new();
        self.registry.replay_all(&mut out);
        let flushed = self.outbox.drain_into(&mut out);
        self.shared.set_pending_bytes(0);
        let deferred = self.pinger.take_deferred();
        for _ in &deferred {
            let _ = ClientOp::Ping.encode(&mut out);
        }
        if !out.is_empty() {
            debug!("[CONN] Flushing {} buffered bytes after replay", flushed);
            self.write(out.freeze());
        }
        for waiter in deferred {
            self.pinger.track(waiter);
        }

        self.reconnect.reset();
        self.set_status(Status::Connected);
        self.pinger.start(Instant::now());
        self.on_info(info);

        for waiter in self.ready.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        // Operations that arrived together with the handshake PONG.
        self.process_ops();
    }

    /// Involuntary loss of an established connection.
    fn on_link_lost(&mut self, err: ClientError) {
        warn!("[CONN] Connection lost: {}", err);
        self.report(err.clone());
        self.drop_link(None);
        self.pinger.stop();
        self.pinger.fail_in_flight(&err);

        // Replies to in-flight requests cannot arrive on another server.
        for sid in self.correlator.fail_all(&ClientError::Timeout) {
            self.registry.remove(sid);
        }

        if self.options.allow_reconnect {
            self.set_status(Status::Reconnecting);
            self.dial_next();
        } else {
            self.close(err);
        }
    }

    fn drop_link(&mut self, done: Option<flume::Sender<()>>) {
        self.generation += 1;
        match self.link.take() {
            Some(link) => {
                if let Err(flume::SendError(WriterCmd::Close(Some(done)))) =
                    link.writer.send(WriterCmd::Close(done))
                {
                    let _ = done.send(());
                }
            }
            None => {
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Terminal failure: everything pending fails. The caller has already
    /// reported `err`; it is handed to `connect()` waiters.
    fn close(&mut self, err: ClientError) {
        debug!("[CONN] Closing: {}", err);
        self.dialing = false;
        self.drop_link(None);

        for sid in self.correlator.fail_all(&ClientError::ConnectionClosed) {
            self.registry.remove(sid);
        }
        self.outbox.clear();
        self.shared.set_pending_bytes(0);
        self.pinger.stop();
        self.pinger.fail_waiters(&ClientError::ConnectionClosed);
        self.registry.close_all();

        self.set_status(Status::Closed);
        for waiter in self.ready.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Graceful close. Pending requests are left to their own deadlines.
    fn shutdown(&mut self, done: Option<flume::Sender<()>>) {
        if self.status == Status::Closed {
            if let Some(done) = done {
                let _ = done.send(());
            }
            return;
        }
        debug!("[CONN] Disconnecting");
        self.dialing = false;
        self.drop_link(done);
        self.pinger.stop();
        self.pinger.fail_waiters(&ClientError::ConnectionClosed);
        self.outbox.clear();
        self.shared.set_pending_bytes(0);
        self.registry.close_all();
        self.set_status(Status::Closed);
        for waiter in self.ready.drain(..) {
            let _ = waiter.send(Err(ClientError::ConnectionClosed));
        }
    }

    // ---------------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------------

    fn set_status(&mut self, to: Status) {
        if self.status == to {
            return;
        }
        let from = self.status;
        self.status = to;
        debug!("[CONN] Status {} -> {}", from, to);
        self.shared.set_status(to);
    }

    fn report(&mut self, err: ClientError) {
        warn!("[CONN] {}", err);
        self.shared.record_error(err);
    }
}

/// Forward socket reads to the engine until EOF or error.
async fn read_pump(
    mut reader: Box<dyn TransportRead>,
    generation: u64,
    events: flume::Sender<Event>,
    max: usize,
) {
    loop {
        let event = match reader.read_chunk(max).await {
            Ok(chunk) if chunk.is_empty() => Event::Lost {
                generation,
                err: ClientError::broken_socket("connection closed by server"),
            },
            Ok(chunk) => {
                if events.send(Event::Data { generation, chunk }).is_err() {
                    return;
                }
                continue;
            }
            Err(e) => Event::Lost {
                generation,
                err: e.into(),
            },
        };
        trace!("[PUMP] Reader gen={} done", generation);
        let _ = events.send(event);
        return;
    }
}

/// Serialize writes to the socket, coalescing whatever is queued.
async fn write_pump(
    mut writer: Box<dyn TransportWrite>,
    generation: u64,
    commands: flume::Receiver<WriterCmd>,
    events: flume::Sender<Event>,
) {
    let mut batch = BytesMut::new();
    while let Ok(cmd) = commands.recv_async().await {
        let mut close = None;
        match cmd {
            WriterCmd::Data(bytes) => batch.extend_from_slice(&bytes),
            WriterCmd::Close(done) => close = Some(done),
        }
        while close.is_none() {
            match commands.try_recv() {
                Ok(WriterCmd::Data(bytes)) => batch.extend_from_slice(&bytes),
                Ok(WriterCmd::Close(done)) => close = Some(done),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let buf = batch.split().freeze();
            trace!("[PUMP] Writing {} bytes (gen={})", buf.len(), generation);
            if let Err(e) = writer.write_all(buf).await {
                let _ = events.send(Event::Lost {
                    generation,
                    err: e.into(),
                });
                if let Some(Some(done)) = close {
                    let _ = done.send(());
                }
                return;
            }
        }

        if let Some(done) = close {
            let _ = writer.close().await;
            trace!("[PUMP] Writer gen={} closed", generation);
            if let Some(done) = done {
                let _ = done.send(());
            }
            return;
        }
    }
    let _ = writer.close().await;
}
