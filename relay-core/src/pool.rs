//! Server pool and cluster discovery.
//!
//! The pool starts from the user's seed list and grows with the connect-URLs
//! servers advertise. Candidates are handed out round-robin: the chosen entry
//! moves to the back, so the next pick after a failure is a different server
//! whenever one exists.
//!
//! Invariants:
//! - no two entries share a `(host, port)` identity
//! - a discovery merge never removes the server currently in use
//! - entries that exhaust their attempt budget are dropped

use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use crate::endpoint::ServerAddr;

/// One known server.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    addr: ServerAddr,
    discovered: bool,
    tls_required: bool,
    reconnects: u32,
    did_connect: bool,
    last_attempt: Option<Instant>,
}

impl ServerEntry {
    fn new(addr: ServerAddr, discovered: bool) -> Self {
        Self {
            tls_required: addr.tls_required(),
            addr,
            discovered,
            reconnects: 0,
            did_connect: false,
            last_attempt: None,
        }
    }

    /// Server identity.
    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// Host part of the identity.
    pub fn host(&self) -> &str {
        self.addr.host()
    }

    /// Port part of the identity.
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Learned from a server's connect-URL list rather than configuration.
    pub const fn is_discovered(&self) -> bool {
        self.discovered
    }

    /// The server demanded TLS (from the URL scheme or its INFO).
    pub const fn tls_required(&self) -> bool {
        self.tls_required
    }

    /// Failed attempts since the last successful connect.
    pub const fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Whether a handshake with this server ever succeeded.
    pub const fn did_connect(&self) -> bool {
        self.did_connect
    }

    /// Time since the last dial, if any.
    pub fn since_last_attempt(&self) -> Option<Duration> {
        self.last_attempt.map(|at| at.elapsed())
    }
}

/// Ordered collection of known servers.
#[derive(Debug, Clone)]
pub struct ServerPool {
    entries: Vec<ServerEntry>,
    current: Option<ServerAddr>,
    randomize: bool,
}

impl ServerPool {
    /// Build a pool from seed addresses, dropping duplicates.
    ///
    /// When `randomize` is set the seed order is shuffled once here.
    pub fn new(seeds: impl IntoIterator<Item = ServerAddr>, randomize: bool) -> Self {
        let mut entries: Vec<ServerEntry> = Vec::new();
        for addr in seeds {
            if entries.iter().any(|e| e.addr == addr) {
                trace!("[POOL] Ignoring duplicate seed {}", addr);
                continue;
            }
            entries.push(ServerEntry::new(addr, false));
        }
        if randomize {
            entries.shuffle(&mut rand::thread_rng());
        }
        Self {
            entries,
            current: None,
            randomize,
        }
    }

    /// Pick the next server to dial.
    ///
    /// Entries whose failed attempts reached `max_attempts` are removed first.
    /// The returned entry is rotated to the back of the pool. `None` means the
    /// pool is exhausted.
    pub fn next_candidate(&mut self, max_attempts: Option<u32>) -> Option<ServerEntry> {
        if let Some(max) = max_attempts {
            self.entries.retain(|e| {
                let keep = e.reconnects < max;
                if !keep {
                    debug!(
                        "[POOL] Dropping {} after {} failed attempt(s)",
                        e.addr, e.reconnects
                    );
                }
                keep
            });
        }
        if self.entries.is_empty() {
            return None;
        }
        let entry = self.entries.remove(0);
        self.entries.push(entry.clone());
        Some(entry)
    }

    /// Record that a dial to `addr` is starting.
    pub fn mark_attempt(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self.entry_mut(addr) {
            entry.last_attempt = Some(Instant::now());
        }
    }

    /// Record a failed dial or handshake.
    ///
    /// A `permanent` failure (the server explicitly refused us) removes the
    /// entry outright.
    pub fn mark_failed(&mut self, addr: &ServerAddr, permanent: bool) {
        if permanent {
            warn!("[POOL] Removing {} after permanent rejection", addr);
            self.entries.retain(|e| &e.addr != addr);
            return;
        }
        if let Some(entry) = self.entry_mut(addr) {
            entry.reconnects = entry.reconnects.saturating_add(1);
        }
    }

    /// Record a successful handshake; `addr` becomes the current server.
    pub fn mark_connected(&mut self, addr: &ServerAddr, tls_required: bool) {
        if let Some(entry) = self.entry_mut(addr) {
            entry.reconnects = 0;
            entry.did_connect = true;
            entry.tls_required = entry.tls_required || tls_required;
        }
        self.current = Some(addr.clone());
    }

    /// Merge a server-advertised connect-URL list.
    ///
    /// Discovered entries missing from `urls` are dropped, except the current
    /// server. Configured entries are never touched. Returns the addresses
    /// newly added to the pool.
    pub fn merge_discovered<S: AsRef<str>>(&mut self, urls: &[S]) -> Vec<ServerAddr> {
        let mut advertised: Vec<ServerAddr> = Vec::with_capacity(urls.len());
        for url in urls {
            match ServerAddr::parse(url.as_ref()) {
                Ok(addr) if !advertised.contains(&addr) => advertised.push(addr),
                Ok(_) => {}
                Err(e) => warn!("[POOL] Ignoring advertised server {:?}: {}", url.as_ref(), e),
            }
        }

        let current = self.current.clone();
        self.entries.retain(|e| {
            !e.discovered || advertised.contains(&e.addr) || current.as_ref() == Some(&e.addr)
        });

        let mut added: Vec<ServerAddr> = advertised
            .into_iter()
            .filter(|addr| !self.entries.iter().any(|e| &e.addr == addr))
            .collect();
        if self.randomize {
            added.shuffle(&mut rand::thread_rng());
        }
        for addr in &added {
            debug!("[POOL] Discovered server {}", addr);
            self.entries.push(ServerEntry::new(addr.clone(), true));
        }
        added
    }

    /// The server of the active or most recently active connection.
    pub fn current(&self) -> Option<&ServerAddr> {
        self.current.as_ref()
    }

    /// Look up an entry by identity.
    pub fn get(&self, addr: &ServerAddr) -> Option<&ServerEntry> {
        self.entries.iter().find(|e| &e.addr == addr)
    }

    /// Snapshot of all entries, in pool order.
    pub fn servers(&self) -> Vec<ServerEntry> {
        self.entries.clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool has no entries left.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, addr: &ServerAddr) -> Option<&mut ServerEntry> {
        self.entries.iter_mut().find(|e| &e.addr == addr)
    }
}
