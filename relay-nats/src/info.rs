//! INFO and CONNECT payloads.
//!
//! Both are JSON objects on the wire. Only the fields the engine acts on are
//! modelled; anything else the server sends is ignored.

use serde::{Deserialize, Serialize};

use relay_core::options::ClientOptions;

/// Protocol level announced in CONNECT. Level 1 enables async INFO updates.
pub const PROTOCOL_VERSION: u8 = 1;

/// Server greeting and its later updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub proto: i32,
    pub host: String,
    pub port: u16,
    pub max_payload: usize,
    pub tls_required: bool,
    pub auth_required: bool,
    pub headers: bool,
    /// Other cluster members clients may connect to.
    pub connect_urls: Vec<String>,
    /// Lame duck mode: the server is about to shut down.
    pub ldm: bool,
}

/// Options sent to the server right after INFO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub echo: bool,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: &'static str,
    pub version: &'static str,
    pub protocol: u8,
    pub headers: bool,
    pub no_responders: bool,
}

impl ConnectInfo {
    /// CONNECT payload for `options` against a server that sent `info`.
    ///
    /// Header support (and therefore no-responders) is only requested when
    /// the server advertises it.
    pub fn new(options: &ClientOptions, info: &ServerInfo) -> Self {
        let headers = info.headers && options.no_responders;
        Self {
            verbose: options.verbose,
            pedantic: options.pedantic,
            echo: options.echo,
            tls_required: options.tls_required,
            name: options.name.clone(),
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            protocol: PROTOCOL_VERSION,
            headers,
            no_responders: headers,
        }
    }
}
