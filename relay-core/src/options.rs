//! Client configuration options
//!
//! A fixed set of recognized options. Unknown keys are rejected when
//! configuration is parsed, never silently ignored.

use std::time::Duration;

use crate::endpoint::ServerAddr;
use crate::error::{ClientError, Result};

/// Client configuration options.
///
/// # Examples
///
/// ```
/// use relay_core::options::ClientOptions;
/// use std::time::Duration;
///
/// let opts = ClientOptions::default()
///     .with_servers(["nats://10.0.0.1:4222", "nats://10.0.0.2:4222"])
///     .with_ping_interval(Duration::from_secs(30))
///     .with_max_reconnect_attempts(Some(5));
/// assert!(opts.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Seed server addresses.
    ///
    /// Parsed with [`ServerAddr::parse`]; at least one is required.
    pub servers: Vec<String>,

    /// Shuffle the seed list before the first connect.
    ///
    /// Spreads load when many clients share the same configuration.
    pub randomize: bool,

    /// Ask the server to acknowledge every command with `+OK`.
    pub verbose: bool,

    /// Ask the server for strict subject checking.
    pub pedantic: bool,

    /// Receive messages published by this same connection.
    pub echo: bool,

    /// Decode delivered payloads as UTF-8 alongside the raw bytes.
    pub utf8_convert: bool,

    /// Validate subjects locally before sending.
    pub check_subjects: bool,

    /// Keepalive period. `Duration::ZERO` disables client pings.
    pub ping_interval: Duration,

    /// Unanswered pings tolerated before the connection is declared stale.
    pub max_outstanding_pings: u32,

    /// Budget for one dial plus handshake.
    pub connect_timeout: Duration,

    /// Wait before each reconnect attempt.
    pub reconnect_time_wait: Duration,

    /// Exponential backoff ceiling for reconnect waits.
    ///
    /// - Default: 0 (no growth, always wait `reconnect_time_wait`)
    /// - When > 0: the wait doubles per failed attempt up to this value
    pub reconnect_time_wait_max: Duration,

    /// Attempts per server before it is dropped from the pool.
    ///
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,

    /// Reconnect after an unexpected connection loss.
    pub allow_reconnect: bool,

    /// Client name reported in CONNECT.
    pub name: Option<String>,

    /// Require TLS from every server.
    pub tls_required: bool,

    /// Cap on bytes held in the outgoing buffer while disconnected.
    ///
    /// `None` means unbounded.
    pub max_pending_bytes: Option<usize>,

    /// Prefix for request inbox subjects.
    pub inbox_prefix: String,

    /// Request no-responders notifications when the server supports headers.
    pub no_responders: bool,

    /// Disable Nagle's algorithm on TCP sockets.
    pub tcp_nodelay: bool,

    /// Size of each socket read.
    pub read_buffer_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            servers: vec![format!("nats://127.0.0.1:{}", crate::endpoint::DEFAULT_PORT)],
            randomize: true,
            verbose: false,
            pedantic: false,
            echo: true,
            utf8_convert: false,
            check_subjects: true,
            ping_interval: Duration::from_secs(120),
            max_outstanding_pings: 2,
            connect_timeout: Duration::from_secs(2),
            reconnect_time_wait: Duration::from_secs(2),
            reconnect_time_wait_max: Duration::ZERO, // No backoff growth
            max_reconnect_attempts: Some(10),
            allow_reconnect: true,
            name: None,
            tls_required: false,
            max_pending_bytes: None, // Unbounded
            inbox_prefix: "_INBOX".to_string(),
            no_responders: true,
            tcp_nodelay: true,
            read_buffer_size: 8192, // 8KB - balanced default
        }
    }
}

impl ClientOptions {
    /// Create new client options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the seed server list.
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Set whether the seed list is shuffled.
    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Set verbose mode.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set pedantic mode.
    pub fn with_pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    /// Set echo.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Set UTF-8 payload conversion.
    pub fn with_utf8_convert(mut self, convert: bool) -> Self {
        self.utf8_convert = convert;
        self
    }

    /// Set local subject validation.
    pub fn with_check_subjects(mut self, check: bool) -> Self {
        self.check_subjects = check;
        self
    }

    /// Set keepalive period.
    ///
    /// # Examples
    ///
    /// ```
    /// use relay_core::options::ClientOptions;
    /// use std::time::Duration;
    ///
    /// // Disable client-initiated pings
    /// let opts = ClientOptions::new().with_ping_interval(Duration::ZERO);
    ///
    /// // Ping every second
    /// let opts = ClientOptions::new().with_ping_interval(Duration::from_secs(1));
    /// ```
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set stale-connection threshold.
    pub fn with_max_outstanding_pings(mut self, max: u32) -> Self {
        self.max_outstanding_pings = max;
        self
    }

    /// Set connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the wait between reconnect attempts.
    pub fn with_reconnect_time_wait(mut self, wait: Duration) -> Self {
        self.reconnect_time_wait = wait;
        self
    }

    /// Set the reconnect backoff ceiling.
    pub fn with_reconnect_time_wait_max(mut self, max: Duration) -> Self {
        self.reconnect_time_wait_max = max;
        self
    }

    /// Set attempts per server (`None` for unlimited).
    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Enable or disable reconnection.
    pub fn with_allow_reconnect(mut self, allow: bool) -> Self {
        self.allow_reconnect = allow;
        self
    }

    /// Set client name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Require TLS.
    pub fn with_tls_required(mut self, required: bool) -> Self {
        self.tls_required = required;
        self
    }

    /// Cap the outgoing buffer.
    pub fn with_max_pending_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_pending_bytes = limit;
        self
    }

    /// Set request inbox prefix.
    pub fn with_inbox_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inbox_prefix = prefix.into();
        self
    }

    /// Request no-responders notifications.
    pub fn with_no_responders(mut self, enabled: bool) -> Self {
        self.no_responders = enabled;
        self
    }

    /// Set `TCP_NODELAY`.
    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Set socket read size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Parse the seed list.
    pub fn server_addrs(&self) -> Result<Vec<ServerAddr>> {
        self.servers
            .iter()
            .map(|s| ServerAddr::parse(s).map_err(ClientError::from))
            .collect()
    }

    /// Check the options for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] or [`ClientError::InvalidAddress`]
    /// describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(ClientError::config("at least one server is required"));
        }
        self.server_addrs()?;

        if self.connect_timeout.is_zero() {
            return Err(ClientError::config("connect_timeout must be greater than zero"));
        }
        if self.max_outstanding_pings == 0 {
            return Err(ClientError::config("max_outstanding_pings must be at least 1"));
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(ClientError::config(
                "max_reconnect_attempts must be at least 1 (use None for unlimited)",
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(ClientError::config("read_buffer_size must be greater than zero"));
        }
        if self.inbox_prefix.is_empty()
            || crate::subject::validate_publish(&self.inbox_prefix).is_err()
        {
            return Err(ClientError::config(format!(
                "invalid inbox_prefix: {:?}",
                self.inbox_prefix
            )));
        }
        Ok(())
    }

    /// Build options from string key/value pairs, starting from defaults.
    ///
    /// Durations are given in milliseconds. `servers` is a comma-separated
    /// list. `max_reconnect_attempts` and `max_pending_bytes` accept `-1`
    /// for "unlimited".
    ///
    /// # Errors
    ///
    /// Unknown keys and malformed values fail with [`ClientError::Config`].
    ///
    /// ```
    /// use relay_core::options::ClientOptions;
    ///
    /// let opts = ClientOptions::from_pairs([("servers", "a:4222,b:4222"), ("verbose", "true")]).unwrap();
    /// assert_eq!(opts.servers.len(), 2);
    ///
    /// assert!(ClientOptions::from_pairs([("verbos", "true")]).is_err());
    /// ```
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut opts = Self::default();
        for (key, value) in pairs {
            opts.apply(key.as_ref(), value.as_ref())?;
        }
        opts.validate()?;
        Ok(opts)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key.trim() {
            "servers" => {
                self.servers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "randomize" => self.randomize = parse_bool(key, value)?,
            "verbose" => self.verbose = parse_bool(key, value)?,
            "pedantic" => self.pedantic = parse_bool(key, value)?,
            "echo" => self.echo = parse_bool(key, value)?,
            "utf8_convert" => self.utf8_convert = parse_bool(key, value)?,
            "check_subjects" => self.check_subjects = parse_bool(key, value)?,
            "ping_interval" => self.ping_interval = parse_millis(key, value)?,
            "max_outstanding_pings" => self.max_outstanding_pings = parse_num(key, value)?,
            "connect_timeout" => self.connect_timeout = parse_millis(key, value)?,
            "reconnect_time_wait" => self.reconnect_time_wait = parse_millis(key, value)?,
            "reconnect_time_wait_max" => {
                self.reconnect_time_wait_max = parse_millis(key, value)?;
            }
            "max_reconnect_attempts" => {
                self.max_reconnect_attempts = parse_limit(key, value)?;
            }
            "allow_reconnect" => self.allow_reconnect = parse_bool(key, value)?,
            "name" => self.name = Some(value.to_string()),
            "tls_required" => self.tls_required = parse_bool(key, value)?,
            "max_pending_bytes" => self.max_pending_bytes = parse_limit(key, value)?,
            "inbox_prefix" => self.inbox_prefix = value.to_string(),
            "no_responders" => self.no_responders = parse_bool(key, value)?,
            "tcp_nodelay" => self.tcp_nodelay = parse_bool(key, value)?,
            "read_buffer_size" => self.read_buffer_size = parse_num(key, value)?,
            other => {
                return Err(ClientError::config(format!("unknown option: {other:?}")));
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ClientError::config(format!(
            "{key}: expected a boolean, got {value:?}"
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ClientError::config(format!("{key}: expected a number, got {value:?}")))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse_num::<u64>(key, value).map(Duration::from_millis)
}

fn parse_limit<T: std::str::FromStr>(key: &str, value: &str) -> Result<Option<T>> {
    if value == "-1" {
        Ok(None)
    } else {
        parse_num(key, value).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = ClientOptions::default();
        assert!(opts.randomize);
        assert!(opts.echo);
        assert!(opts.check_subjects);
        assert!(!opts.verbose);
        assert!(!opts.pedantic);
        assert_eq!(opts.ping_interval, Duration::from_secs(120));
        assert_eq!(opts.max_outstanding_pings, 2);
        assert_eq!(opts.connect_timeout, Duration::from_secs(2));
        assert_eq!(opts.reconnect_time_wait, Duration::from_secs(2));
        assert_eq!(opts.max_reconnect_attempts, Some(10));
        assert_eq!(opts.inbox_prefix, "_INBOX");
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let opts = ClientOptions::new()
            .with_servers(["a:1", "b:2"])
            .with_randomize(false)
            .with_ping_interval(Duration::from_millis(500))
            .with_max_pending_bytes(Some(1024))
            .with_name("orders-service");

        assert_eq!(opts.servers, vec!["a:1".to_string(), "b:2".to_string()]);
        assert!(!opts.randomize);
        assert_eq!(opts.ping_interval, Duration::from_millis(500));
        assert_eq!(opts.max_pending_bytes, Some(1024));
        assert_eq!(opts.name.as_deref(), Some("orders-service"));
    }

    #[test]
    fn test_validation_failures() {
        let empty = ClientOptions::new().with_servers(Vec::<String>::new());
        assert!(matches!(empty.validate(), Err(ClientError::Config(_))));

        let bad_addr = ClientOptions::new().with_servers(["http://nope"]);
        assert!(matches!(bad_addr.validate(), Err(ClientError::InvalidAddress(_))));

        let zero_pings = ClientOptions::new().with_max_outstanding_pings(0);
        assert!(zero_pings.validate().is_err());

        let zero_attempts = ClientOptions::new().with_max_reconnect_attempts(Some(0));
        assert!(zero_attempts.validate().is_err());

        let bad_prefix = ClientOptions::new().with_inbox_prefix("has space");
        assert!(bad_prefix.validate().is_err());
    }

    #[test]
    fn test_from_pairs() {
        let opts = ClientOptions::from_pairs([
            ("servers", "nats://a:4222, nats://b:4223"),
            ("randomize", "false"),
            ("verbose", "true"),
            ("ping_interval", "1000"),
            ("max_reconnect_attempts", "-1"),
            ("max_pending_bytes", "4096"),
        ])
        .unwrap();

        assert_eq!(opts.servers.len(), 2);
        assert!(!opts.randomize);
        assert!(opts.verbose);
        assert_eq!(opts.ping_interval, Duration::from_secs(1));
        assert_eq!(opts.max_reconnect_attempts, None);
        assert_eq!(opts.max_pending_bytes, Some(4096));
    }

    #[test]
    fn test_from_pairs_rejects_unknown_and_malformed() {
        let unknown = ClientOptions::from_pairs([("reconnect_wait", "10")]);
        assert!(matches!(unknown, Err(ClientError::Config(msg)) if msg.contains("reconnect_wait")));

        let malformed = ClientOptions::from_pairs([("echo", "maybe")]);
        assert!(matches!(malformed, Err(ClientError::Config(_))));

        let negative = ClientOptions::from_pairs([("ping_interval", "-5")]);
        assert!(negative.is_err());
    }
}
