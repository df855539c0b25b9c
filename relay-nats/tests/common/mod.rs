//! In-process NATS server for integration tests.
//!
//! Speaks enough of the protocol to exercise the client: INFO greeting,
//! CONNECT, PING/PONG, SUB/UNSUB and PUB routing (with queue groups and
//! no-responders replies). Knobs let a test suppress PONGs, push a new INFO,
//! drop every connection or stop accepting altogether.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream};
use futures::FutureExt;

enum Out {
    Data(Vec<u8>),
    Close,
}

struct ServerSub {
    conn: u32,
    sid: String,
    subject: String,
    queue: Option<String>,
    max: Option<u64>,
    delivered: u64,
    tx: flume::Sender<Out>,
}

struct State {
    server_id: String,
    connect_urls: Mutex<Vec<String>>,
    answer_pings: AtomicBool,
    accepting: AtomicBool,
    pings: AtomicU32,
    connections: AtomicU32,
    lines: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subs: Mutex<Vec<ServerSub>>,
    conns: Mutex<Vec<flume::Sender<Out>>>,
}

impl State {
    fn info_line(&self) -> Vec<u8> {
        let info = serde_json::json!({
            "server_id": self.server_id,
            "version": "2.10.0",
            "proto": 1,
            "headers": true,
            "max_payload": 1_048_576,
            "connect_urls": *self.connect_urls.lock().unwrap(),
        });
        format!("INFO {info}\r\n").into_bytes()
    }
}

/// Per-connection parse state.
struct Conn {
    id: u32,
    tx: flume::Sender<Out>,
    no_responders: bool,
}

pub struct FakeServer {
    pub addr: SocketAddr,
    state: Arc<State>,
    stop: flume::Sender<()>,
}

impl FakeServer {
    pub async fn start(server_id: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State {
            server_id: server_id.to_string(),
            connect_urls: Mutex::new(Vec::new()),
            answer_pings: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            pings: AtomicU32::new(0),
            connections: AtomicU32::new(0),
            lines: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            subs: Mutex::new(Vec::new()),
            conns: Mutex::new(Vec::new()),
        });
        let (stop, stopped) = flume::bounded::<()>(1);

        let accept_state = Arc::clone(&state);
        compio::runtime::spawn(async move {
            loop {
                let next = futures::select! {
                    accepted = listener.accept().fuse() => accepted,
                    _ = stopped.recv_async().fuse() => break,
                };
                let Ok((stream, _)) = next else { break };
                if !accept_state.accepting.load(Ordering::SeqCst) {
                    // Refuse the handshake by closing straight away.
                    drop(stream);
                    continue;
                }
                let id = accept_state.connections.fetch_add(1, Ordering::SeqCst) + 1;
                compio::runtime::spawn(serve(stream, id, Arc::clone(&accept_state))).detach();
            }
            // Listener dropped here: further dials are refused.
        })
        .detach();

        Self { addr, state, stop }
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    pub fn set_connect_urls(&self, urls: &[&str]) {
        *self.state.connect_urls.lock().unwrap() = urls.iter().map(|u| (*u).to_string()).collect();
    }

    /// Push the current INFO to every live connection.
    pub fn broadcast_info(&self) {
        let line = self.state.info_line();
        for tx in self.state.conns.lock().unwrap().iter() {
            let _ = tx.send(Out::Data(line.clone()));
        }
    }

    /// Send raw protocol bytes to every live connection.
    pub fn broadcast_raw(&self, raw: &[u8]) {
        for tx in self.state.conns.lock().unwrap().iter() {
            let _ = tx.send(Out::Data(raw.to_vec()));
        }
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// While off, new connections are closed before the INFO greeting.
    pub fn set_accepting(&self, accepting: bool) {
        self.state.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn pings(&self) -> u32 {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Control lines received, PING/PONG excluded.
    pub fn lines(&self) -> Vec<String> {
        self.state.lines.lock().unwrap().clone()
    }

    /// Payloads published on `subject`, in arrival order.
    pub fn published(&self, subject: &str) -> Vec<Vec<u8>> {
        self.state
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.subs.lock().unwrap().len()
    }

    /// Close every live connection from the server side.
    pub fn drop_connections(&self) {
        for tx in self.state.conns.lock().unwrap().drain(..) {
            let _ = tx.send(Out::Close);
        }
        self.state.subs.lock().unwrap().clear();
    }

    /// Stop accepting and drop every connection.
    pub fn shutdown(&self) {
        let _ = self.stop.try_send(());
        self.drop_connections();
    }
}

async fn serve(stream: TcpStream, id: u32, state: Arc<State>) {
    let stream = Rc::new(stream);
    let (tx, rx) = flume::unbounded::<Out>();
    state.conns.lock().unwrap().push(tx.clone());

    let writer = Rc::clone(&stream);
    compio::runtime::spawn(async move {
        while let Ok(out) = rx.recv_async().await {
            let mut s: &TcpStream = &writer;
            match out {
                Out::Data(buf) => {
                    let BufResult(res, _) = s.write_all(buf).await;
                    if res.is_err() {
                        break;
                    }
                }
                Out::Close => {
                    let _ = AsyncWrite::shutdown(&mut s).await;
                    break;
                }
            }
        }
    })
    .detach();

    let _ = tx.send(Out::Data(state.info_line()));

    let mut conn = Conn {
        id,
        tx,
        no_responders: false,
    };
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let mut s: &TcpStream = &stream;
        let BufResult(res, chunk) = AsyncRead::read(&mut s, Vec::with_capacity(4096)).await;
        match res {
            Ok(0) | Err(_) => break,
            Ok(_) => buf.extend_from_slice(&chunk),
        }
        while let Some(consumed) = handle(&state, &mut conn, &buf) {
            buf.drain(..consumed);
        }
    }
    state.subs.lock().unwrap().retain(|s| s.conn != id);
    state.conns.lock().unwrap().retain(|t| !t.same_channel(&conn.tx));
    let _ = conn.tx.send(Out::Close);
}

/// Handle one complete command at the front of `buf`, returning its length.
fn handle(state: &State, conn: &mut Conn, buf: &[u8]) -> Option<usize> {
    let end = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = String::from_utf8_lossy(&buf[..end]).to_string();
    let mut consumed = end + 2;
    let args: Vec<&str> = line.split_whitespace().collect();
    let op = args.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();

    match op.as_str() {
        "PING" => {
            state.pings.fetch_add(1, Ordering::SeqCst);
            if state.answer_pings.load(Ordering::SeqCst) {
                let _ = conn.tx.send(Out::Data(b"PONG\r\n".to_vec()));
            }
            return Some(consumed);
        }
        "PONG" | "" => return Some(consumed),
        "CONNECT" => {
            conn.no_responders = line.contains("\"no_responders\":true");
        }
        "SUB" => {
            let (queue, sid) = match args.len() {
                3 => (None, args[2]),
                _ => (Some(args[2].to_string()), args[3]),
            };
            state.subs.lock().unwrap().push(ServerSub {
                conn: conn.id,
                sid: sid.to_string(),
                subject: args[1].to_string(),
                queue,
                max: None,
                delivered: 0,
                tx: conn.tx.clone(),
            });
        }
        "UNSUB" => {
            let sid = args[1];
            let mut subs = state.subs.lock().unwrap();
            match args.get(2).and_then(|m| m.parse::<u64>().ok()) {
                Some(max) => {
                    for sub in subs.iter_mut().filter(|s| s.conn == conn.id && s.sid == sid) {
                        sub.max = Some(max);
                    }
                    subs.retain(|s| !(s.conn == conn.id && s.sid == sid && s.delivered >= max));
                }
                None => subs.retain(|s| !(s.conn == conn.id && s.sid == sid)),
            }
        }
        "PUB" => {
            let (reply, size) = match args.len() {
                3 => (None, args[2]),
                _ => (Some(args[2].to_string()), args[3]),
            };
            let size: usize = size.parse().ok()?;
            if buf.len() < consumed + size + 2 {
                return None;
            }
            let payload = buf[consumed..consumed + size].to_vec();
            consumed += size + 2;
            state.published.lock().unwrap().push((args[1].to_string(), payload.clone()));
            route(state, conn, args[1], reply.as_deref(), &payload);
        }
        _ => {}
    }
    state.lines.lock().unwrap().push(line);
    Some(consumed)
}

fn route(state: &State, conn: &Conn, subject: &str, reply: Option<&str>, payload: &[u8]) {
    let mut subs = state.subs.lock().unwrap();
    let mut groups_served: Vec<String> = Vec::new();
    let mut delivered = false;

    for sub in subs.iter_mut().filter(|s| subject_matches(&s.subject, subject)) {
        if let Some(queue) = &sub.queue {
            if groups_served.contains(queue) {
                continue;
            }
            groups_served.push(queue.clone());
        }
        let mut frame = match reply {
            Some(reply) => format!("MSG {} {} {} {}\r\n", subject, sub.sid, reply, payload.len()),
            None => format!("MSG {} {} {}\r\n", subject, sub.sid, payload.len()),
        }
        .into_bytes();
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        let _ = sub.tx.send(Out::Data(frame));
        sub.delivered += 1;
        delivered = true;
    }
    subs.retain(|s| s.max.map_or(true, |max| s.delivered < max));

    if delivered || !conn.no_responders {
        return;
    }
    let Some(reply) = reply else { return };
    if let Some(inbox) = subs
        .iter()
        .find(|s| s.conn == conn.id && subject_matches(&s.subject, reply))
    {
        let headers = "NATS/1.0 503\r\n\r\n";
        let frame = format!(
            "HMSG {} {} {} {}\r\n{}\r\n",
            reply,
            inbox.sid,
            headers.len(),
            headers.len(),
            headers
        );
        let _ = inbox.tx.send(Out::Data(frame.into_bytes()));
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if check() {
            return true;
        }
        relay_core::timeout::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Install a test subscriber so `RUST_LOG` works when debugging.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
