//! Connection configuration.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    backoff::BackoffOptions,
    error::{Error, Result},
    validator::Validator,
};

/// Which subprotocols require strict schema validation.
#[derive(Clone, Debug, Default)]
pub enum StrictMode {
    /// No validation.
    #[default]
    Disabled,
    /// Every configured subprotocol is validated.
    All,
    /// Only the listed subprotocols are validated.
    Protocols(Vec<String>),
}

impl StrictMode {
    fn applies_to(&self, subprotocol: &str) -> bool {
        match self {
            Self::Disabled => false,
            Self::All => true,
            Self::Protocols(list) => list.iter().any(|p| p == subprotocol),
        }
    }
}

/// Knobs shared by every peer, regardless of which side dialed.
#[derive(Clone, Debug)]
pub struct PeerOptions {
    /// Subprotocols offered (client) or accepted (server), in preference order.
    pub protocols: Vec<String>,
    /// Default deadline for outbound calls.
    pub call_timeout: Duration,
    /// Keepalive ping period.
    pub ping_interval: Duration,
    /// Reset the ping timer on any traffic instead of pinging a busy link.
    pub defer_pings_on_activity: bool,
    /// Include `{stack, message}` details in `InternalError` responses.
    pub respond_with_detailed_errors: bool,
    /// Maximum concurrent in-flight calls per peer, each direction.
    pub call_concurrency: usize,
    /// Bad-message threshold before a protocol-error close (`None` = unbounded).
    pub max_bad_messages: Option<u32>,
    /// Which subprotocols demand schema validation.
    pub strict_mode: StrictMode,
    /// Validators available for strict subprotocols.
    pub strict_validators: Vec<Arc<Validator>>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            protocols: Vec::new(),
            call_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            defer_pings_on_activity: false,
            respond_with_detailed_errors: false,
            call_concurrency: 1,
            max_bad_messages: None,
            strict_mode: StrictMode::Disabled,
            strict_validators: Vec::new(),
        }
    }
}

impl PeerOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the subprotocols, in preference order.
    #[must_use]
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default outbound call timeout.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Defer pings while the link carries traffic.
    #[must_use]
    pub fn defer_pings_on_activity(mut self, defer: bool) -> Self {
        self.defer_pings_on_activity = defer;
        self
    }

    /// Include stack/message details in `InternalError` responses.
    #[must_use]
    pub fn respond_with_detailed_errors(mut self, detailed: bool) -> Self {
        self.respond_with_detailed_errors = detailed;
        self
    }

    /// Set the per-peer concurrency cap.
    #[must_use]
    pub fn call_concurrency(mut self, concurrency: usize) -> Self {
        self.call_concurrency = concurrency;
        self
    }

    /// Set the bad-message threshold.
    #[must_use]
    pub fn max_bad_messages(mut self, max: Option<u32>) -> Self {
        self.max_bad_messages = max;
        self
    }

    /// Set the strict-mode policy.
    #[must_use]
    pub fn strict_mode(mut self, mode: StrictMode) -> Self {
        self.strict_mode = mode;
        self
    }

    /// Register validators for strict subprotocols.
    #[must_use]
    pub fn strict_validators<I>(mut self, validators: I) -> Self
    where
        I: IntoIterator<Item = Arc<Validator>>,
    {
        self.strict_validators = validators.into_iter().collect();
        self
    }

    /// Fail fast on inconsistent configuration.
    ///
    /// A strict subprotocol without a registered validator is rejected here,
    /// before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.call_concurrency == 0 {
            return Err(Error::config("call_concurrency must be >= 1"));
        }
        if self.ping_interval.is_zero() {
            return Err(Error::config("ping_interval must be > 0"));
        }
        if let StrictMode::Protocols(list) = &self.strict_mode {
            for protocol in list {
                if !self.protocols.iter().any(|p| p == protocol) {
                    return Err(Error::config(format!(
                        "Strict subprotocol {protocol:?} is not in the protocols list"
                    )));
                }
            }
        }
        for protocol in &self.protocols {
            if self.strict_mode.applies_to(protocol) && self.find_validator(protocol).is_none() {
                return Err(Error::config(format!(
                    "No validator registered for strict subprotocol {protocol:?}"
                )));
            }
        }
        Ok(())
    }

    /// The validator to apply for `negotiated`, if strict mode covers it.
    pub(crate) fn validator_for(&self, negotiated: Option<&str>) -> Option<Arc<Validator>> {
        let protocol = negotiated?;
        if !self.strict_mode.applies_to(protocol) {
            return None;
        }
        self.find_validator(protocol)
    }

    fn find_validator(&self, subprotocol: &str) -> Option<Arc<Validator>> {
        self.strict_validators
            .iter()
            .find(|v| v.subprotocol() == subprotocol)
            .cloned()
    }
}

/// Server configuration.
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    /// Peer knobs applied to every accepted connection.
    pub peer: PeerOptions,
    /// Override for the `Server` response header; defaults to the crate
    /// name/version plus the host OS.
    pub server_ident: Option<String>,
}

impl ServerOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the peer knobs.
    #[must_use]
    pub fn peer(mut self, peer: PeerOptions) -> Self {
        self.peer = peer;
        self
    }

    /// Override the `Server` header identity.
    #[must_use]
    pub fn server_ident(mut self, ident: impl Into<String>) -> Self {
        self.server_ident = Some(ident.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.peer.validate()
    }
}

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Peer knobs applied once connected.
    pub peer: PeerOptions,
    /// Server endpoint, e.g. `ws://host:port/ocpp`.
    pub endpoint: String,
    /// This peer's identity; appended URL-encoded to the endpoint path.
    pub identity: String,
    /// Optional HTTP Basic password (binary permitted).
    pub password: Option<Vec<u8>>,
    /// Optional raw query string appended to the URL.
    pub query: Option<String>,
    /// Reconnect automatically after unexpected disconnects.
    pub reconnect: bool,
    /// Cap on reconnect attempts (`None` = unbounded).
    pub max_reconnects: Option<u32>,
    /// Backoff schedule between reconnect attempts.
    pub backoff: BackoffOptions,
    /// Deadline for a single connection attempt.
    pub connect_timeout: Duration,
}

impl ClientOptions {
    /// Create options for dialing `endpoint` as `identity`.
    pub fn new(endpoint: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            peer: PeerOptions::default(),
            endpoint: endpoint.into(),
            identity: identity.into(),
            password: None,
            query: None,
            reconnect: true,
            max_reconnects: None,
            backoff: BackoffOptions::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Replace the peer knobs.
    #[must_use]
    pub fn peer(mut self, peer: PeerOptions) -> Self {
        self.peer = peer;
        self
    }

    /// Set the HTTP Basic password.
    #[must_use]
    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the raw query string.
    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Enable or disable automatic reconnection.
    #[must_use]
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Cap the number of reconnect attempts.
    #[must_use]
    pub fn max_reconnects(mut self, max: Option<u32>) -> Self {
        self.max_reconnects = max;
        self
    }

    /// Set the backoff schedule.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the per-attempt connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(Error::config("identity must not be empty"));
        }
        if self.endpoint.is_empty() {
            return Err(Error::config("endpoint must not be empty"));
        }
        self.backoff.validate()?;
        self.peer.validate()
    }
}

/// Per-call overrides for [`crate::RpcPeer::call_with_options`].
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Deadline override for this call.
    pub timeout: Option<Duration>,
    /// Complete as soon as the frame is written; no response is awaited.
    pub no_reply: bool,
    /// Cancellation signal; firing it aborts the call.
    pub signal: Option<CancellationToken>,
}

impl CallOptions {
    /// Create default call options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the call timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fire-and-forget: resolve on successful transmission.
    #[must_use]
    pub fn no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }

    /// Attach a cancellation signal.
    #[must_use]
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// How to close a peer, a client or a whole server.
#[derive(Clone, Debug)]
pub struct CloseOptions {
    /// WebSocket close code.
    pub code: u16,
    /// WebSocket close reason.
    pub reason: String,
    /// Let in-flight calls and handlers drain before closing.
    pub await_pending: bool,
    /// Tear the transport down without a close handshake.
    pub force: bool,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            code: 1000,
            reason: String::new(),
            await_pending: false,
            force: false,
        }
    }
}

impl CloseOptions {
    /// Create default close options (code 1000, immediate).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the close code.
    #[must_use]
    pub fn code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    /// Set the close reason.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Wait for pending work before closing.
    #[must_use]
    pub fn await_pending(mut self, await_pending: bool) -> Self {
        self.await_pending = await_pending;
        self
    }

    /// Terminate the transport immediately.
    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}
