//! RPC server: TCP listeners, HTTP upgrade handling and the peer registry.
//!
//! Each accepted socket is served by hyper's HTTP/1 connection driver with
//! upgrades enabled. A request that upgrades cleanly is promoted to a
//! [`RpcPeer`]; everything else receives a plain HTTP response carrying the
//! `Server` header.

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode, header};
use http_body_util::Full;
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use sha1::{Digest, Sha1};
use tokio::{
    net::{TcpListener, ToSocketAddrs},
    sync::{broadcast, mpsc},
};
use tokio_tungstenite::{WebSocketStream, tungstenite::protocol::Role};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    events::CloseInfo,
    options::{CloseOptions, ServerOptions},
    peer::{COMMAND_CHANNEL_CAPACITY, PeerActor, PeerShared, RpcPeer, Session},
};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything known about an upgrade request before it becomes a peer.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Identity decoded from the last path segment.
    pub identity: String,
    /// Remote socket address.
    pub remote_address: SocketAddr,
    /// All request headers.
    pub headers: HeaderMap,
    /// Subprotocols offered by the client, in offer order.
    pub requested_protocols: Vec<String>,
    /// Path prefix before the identity segment.
    pub endpoint_path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// HTTP Basic password bytes, when the credentials matched the identity.
    pub password: Option<Vec<u8>>,
    /// Fires if the transport dies while the handshake is in flight.
    pub signal: CancellationToken,
}

/// Decision returned by an [`AuthCallback`].
///
/// Exactly one outcome applies per handshake; returning it is what makes
/// concurrent accept/reject races impossible.
#[derive(Clone)]
pub enum AuthOutcome {
    /// Promote the upgrade to a peer.
    Accept {
        /// Opaque payload exposed later via [`RpcPeer::session`].
        session: Option<Session>,
        /// Explicit subprotocol choice; must be one the client offered.
        protocol: Option<String>,
    },
    /// Abort the upgrade with an HTTP error.
    Reject {
        /// HTTP status to answer with.
        status: u16,
        /// Response body / reason.
        message: String,
    },
}

impl AuthOutcome {
    /// Accept with no session and server-preference protocol selection.
    pub fn accept() -> Self {
        Self::Accept {
            session: None,
            protocol: None,
        }
    }

    /// Attach a session payload to an accept outcome.
    #[must_use]
    pub fn with_session(self, session: Session) -> Self {
        match self {
            Self::Accept { protocol, .. } => Self::Accept {
                session: Some(session),
                protocol,
            },
            reject => reject,
        }
    }

    /// Pin the negotiated subprotocol on an accept outcome.
    #[must_use]
    pub fn with_protocol(self, protocol: impl Into<String>) -> Self {
        match self {
            Self::Accept { session, .. } => Self::Accept {
                session,
                protocol: Some(protocol.into()),
            },
            reject => reject,
        }
    }

    /// Reject with the given HTTP status and message.
    pub fn reject(status: u16, message: impl Into<String>) -> Self {
        Self::Reject {
            status,
            message: message.into(),
        }
    }
}

/// Authenticates upgrade requests before they become peers.
///
/// Closures of the shape `Fn(Handshake) -> impl Future<Output = AuthOutcome>`
/// implement this automatically.
#[async_trait]
pub trait AuthCallback: Send + Sync {
    /// Decide the fate of one handshake.
    async fn authenticate(&self, handshake: Handshake) -> AuthOutcome;
}

#[async_trait]
impl<F, Fut> AuthCallback for F
where
    F: Fn(Handshake) -> Fut + Send + Sync,
    Fut: Future<Output = AuthOutcome> + Send + 'static,
{
    async fn authenticate(&self, handshake: Handshake) -> AuthOutcome {
        (self)(handshake).await
    }
}

/// Events emitted by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// An upgrade completed; the peer is live.
    Client(RpcPeer),
    /// An upgrade was aborted before promotion.
    UpgradeAborted {
        /// Identity from the request path, when it parsed.
        identity: Option<String>,
        /// HTTP status written back.
        status: u16,
        /// Why the upgrade was aborted.
        message: String,
    },
}

struct ServerInner {
    options: parking_lot::RwLock<Arc<ServerOptions>>,
    auth: parking_lot::RwLock<Option<Arc<dyn AuthCallback>>>,
    peers: parking_lot::Mutex<HashMap<u64, RpcPeer>>,
    next_peer_id: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
    listeners: parking_lot::Mutex<Vec<SocketAddr>>,
    shutdown: CancellationToken,
}

impl ServerInner {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn server_ident(&self) -> String {
        self.options
            .read()
            .server_ident
            .clone()
            .unwrap_or_else(|| {
                format!(
                    "{}/{} ({})",
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION"),
                    std::env::consts::OS
                )
            })
    }
}

/// WebSocket RPC server.
///
/// # Example
///
/// ```rust,no_run
/// use ocpp_rpc::{RpcServer, ServerEvent, ServerOptions};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> ocpp_rpc::Result<()> {
///     let server = RpcServer::new(ServerOptions::new())?;
///     let mut events = server.events();
///     server.listen("0.0.0.0:9000").await?;
///
///     while let Ok(event) = events.recv().await {
///         if let ServerEvent::Client(peer) = event {
///             peer.handle("Heartbeat", |_call| async move {
///                 Ok(json!({"currentTime": "2024-01-01T00:00:00Z"}))
///             });
///         }
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    /// Create a server; fails fast on inconsistent options.
    pub fn new(options: ServerOptions) -> Result<Self> {
        options.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(ServerInner {
                options: parking_lot::RwLock::new(Arc::new(options)),
                auth: parking_lot::RwLock::new(None),
                peers: parking_lot::Mutex::new(HashMap::new()),
                next_peer_id: AtomicU64::new(0),
                events,
                listeners: parking_lot::Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Install the auth callback applied to future upgrades.
    pub fn auth<A>(&self, callback: A)
    where
        A: AuthCallback + 'static,
    {
        *self.inner.auth.write() = Some(Arc::new(callback));
    }

    /// Subscribe to server events.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Replace the options applied to future peers. Existing peers keep the
    /// options they were constructed with.
    pub fn reconfigure(&self, options: ServerOptions) -> Result<()> {
        options.validate()?;
        *self.inner.options.write() = Arc::new(options);
        Ok(())
    }

    /// Live peers, in no particular order.
    pub fn clients(&self) -> Vec<RpcPeer> {
        self.inner.peers.lock().values().cloned().collect()
    }

    /// Addresses of all active listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.listeners.lock().clone()
    }

    /// Bind a listener and start accepting upgrades on it.
    pub async fn listen<A>(&self, addr: A) -> Result<SocketAddr>
    where
        A: ToSocketAddrs,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::config("Server is closed"));
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.inner.listeners.lock().push(local);
        info!(addr = %local, "Listening");

        let inner = self.inner.clone();
        let cancel = self.inner.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    handle_request(inner.clone(), remote, req)
                                });
                                let conn = hyper::server::conn::http1::Builder::new()
                                    .serve_connection(io, service)
                                    .with_upgrades();
                                if let Err(e) = conn.await {
                                    debug!(remote = %remote, error = %e, "HTTP connection ended");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
            }
            debug!(addr = %local, "Listener stopped");
        });
        Ok(local)
    }

    /// Stop the listeners, then close every live peer with `options`.
    pub async fn close(&self, options: CloseOptions) -> Vec<CloseInfo> {
        self.inner.shutdown.cancel();
        let peers = self.clients();
        let closes = peers.iter().map(|peer| peer.close(options.clone()));
        futures_util::future::join_all(closes).await
    }
}

/// Emits `UpgradeAborted` if the handshake future is dropped mid-flight,
/// which is what happens when the transport dies during auth.
struct UpgradeGuard {
    inner: Arc<ServerInner>,
    identity: Option<String>,
    armed: bool,
}

impl UpgradeGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for UpgradeGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.emit(ServerEvent::UpgradeAborted {
                identity: self.identity.clone(),
                status: 400,
                message: String::from("Client disconnected during handshake"),
            });
        }
    }
}

async fn handle_request(
    inner: Arc<ServerInner>,
    remote: SocketAddr,
    mut req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let server_ident = inner.server_ident();

    let is_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .is_some();
    if !is_upgrade {
        // Plain HTTP gets the fallback response.
        return Ok(plain_response(
            StatusCode::NOT_FOUND,
            "Not found",
            &server_ident,
        ));
    }

    match try_upgrade(&inner, remote, &mut req).await {
        Ok(response) => Ok(response),
        Err(abort) => {
            inner.emit(ServerEvent::UpgradeAborted {
                identity: abort.identity.clone(),
                status: abort.status,
                message: abort.message.clone(),
            });
            debug!(
                remote = %remote,
                status = abort.status,
                message = %abort.message,
                "Upgrade aborted"
            );
            let status =
                StatusCode::from_u16(abort.status).unwrap_or(StatusCode::BAD_REQUEST);
            Ok(plain_response(status, &abort.message, &server_ident))
        }
    }
}

struct UpgradeAbort {
    identity: Option<String>,
    status: u16,
    message: String,
}

impl UpgradeAbort {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            identity: None,
            status,
            message: message.into(),
        }
    }

    fn with_identity(mut self, identity: &str) -> Self {
        self.identity = Some(identity.to_string());
        self
    }
}

async fn try_upgrade(
    inner: &Arc<ServerInner>,
    remote: SocketAddr,
    req: &mut Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, UpgradeAbort> {
    let headers = req.headers().clone();

    let upgrade_ok = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade_ok {
        return Err(UpgradeAbort::new(400, "Can only upgrade to websocket"));
    }
    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes())
        != Some(b"13")
    {
        return Err(UpgradeAbort::new(400, "Sec-WebSocket-Version must be 13"));
    }
    let Some(key) = headers.get(header::SEC_WEBSOCKET_KEY) else {
        return Err(UpgradeAbort::new(400, "Sec-WebSocket-Key header is missing"));
    };
    let accept_key = sec_websocket_accept(key.as_bytes());

    let path = req.uri().path().to_string();
    let (endpoint_path, identity_segment) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
    if identity_segment.is_empty() {
        return Err(UpgradeAbort::new(400, "Identity missing from path"));
    }
    let identity = match percent_decode_str(identity_segment).decode_utf8() {
        Ok(identity) => identity.into_owned(),
        Err(_) => return Err(UpgradeAbort::new(400, "Identity is not valid UTF-8")),
    };

    let requested_protocols = parse_protocols(&headers);
    let password = basic_password(&headers, &identity);
    let signal = inner.shutdown.child_token();

    let handshake = Handshake {
        identity: identity.clone(),
        remote_address: remote,
        headers,
        requested_protocols: requested_protocols.clone(),
        endpoint_path: endpoint_path.to_string(),
        query: req.uri().query().map(str::to_string),
        password,
        signal: signal.clone(),
    };

    // If the transport dies while the auth callback runs, this future is
    // dropped and the guard reports the aborted handshake.
    let mut guard = UpgradeGuard {
        inner: inner.clone(),
        identity: Some(identity.clone()),
        armed: true,
    };
    let auth = inner.auth.read().clone();
    let outcome = match auth {
        Some(callback) => callback.authenticate(handshake.clone()).await,
        None => AuthOutcome::accept(),
    };
    guard.disarm();

    let (session, selected_protocol) = match outcome {
        AuthOutcome::Reject { status, message } => {
            signal.cancel();
            return Err(UpgradeAbort::new(status, message).with_identity(&identity));
        }
        AuthOutcome::Accept { session, protocol } => {
            let selected = match protocol {
                Some(explicit) => {
                    if !requested_protocols.iter().any(|p| *p == explicit) {
                        return Err(UpgradeAbort::new(
                            400,
                            format!("Selected subprotocol {explicit:?} was not requested"),
                        )
                        .with_identity(&identity));
                    }
                    Some(explicit)
                }
                None => {
                    let options = inner.options.read().clone();
                    options
                        .peer
                        .protocols
                        .iter()
                        .find(|p| requested_protocols.iter().any(|r| r == *p))
                        .cloned()
                }
            };
            (session, selected)
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .header(header::SERVER, inner.server_ident());
    if let Some(protocol) = &selected_protocol {
        builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    let response = builder
        .body(Full::new(Bytes::new()))
        .expect("bug: failed to build upgrade response");

    let on_upgrade = hyper::upgrade::on(req);
    let inner = inner.clone();
    let options = inner.options.read().clone();
    let handshake = Arc::new(handshake);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                signal.cancel();
                inner.emit(ServerEvent::UpgradeAborted {
                    identity: Some(handshake.identity.clone()),
                    status: 400,
                    message: format!("Upgrade failed: {e}"),
                });
                return;
            }
        };
        let ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

        let shared = Arc::new(PeerShared::new(
            handshake.identity.clone(),
            selected_protocol,
            session,
            Some(handshake.clone()),
        ));
        let (cmd_tx, mut cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let peer = RpcPeer::new(cmd_tx, shared.clone());

        let peer_id = inner.next_peer_id.fetch_add(1, Ordering::Relaxed);
        inner.peers.lock().insert(peer_id, peer.clone());
        inner.emit(ServerEvent::Client(peer.clone()));
        info!(identity = %peer.identity(), remote = %handshake.remote_address, "Client connected");

        let actor = PeerActor::new(options.peer.clone(), shared);
        let (close, _local) = actor.run(ws, &mut cmd_rx, Vec::new()).await;
        signal.cancel();
        inner.peers.lock().remove(&peer_id);
        info!(
            identity = %handshake.identity,
            code = close.code,
            reason = %close.reason,
            "Client disconnected"
        );
    });

    Ok(response)
}

fn plain_response(status: StatusCode, body: &str, server_ident: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::SERVER, server_ident)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("bug: failed to build response")
}

fn parse_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Extract the Basic-auth password for `identity`.
///
/// The username is pre-committed to the URL identity, so a password may
/// contain colons and arbitrary bytes; a header that fails to parse simply
/// yields no password.
fn basic_password(headers: &HeaderMap, identity: &str) -> Option<Vec<u8>> {
    let value = headers.get(header::AUTHORIZATION)?.as_bytes();
    if value.len() < 6 || !value[..6].eq_ignore_ascii_case(b"basic ") {
        return None;
    }
    let decoded = BASE64_STANDARD.decode(value[6..].trim_ascii()).ok()?;
    let prefix = [identity.as_bytes(), b":"].concat();
    decoded
        .strip_prefix(prefix.as_slice())
        .map(<[u8]>::to_vec)
}

fn sec_websocket_accept(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WS_GUID);
    BASE64_STANDARD.encode(&sha1.finalize()[..])
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn headers_with_auth(value: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_bytes(value).expect("header value"),
        );
        headers
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        // The example handshake from RFC 6455 section 1.3.
        assert_eq!(
            sec_websocket_accept(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn basic_password_allows_colons_in_identity_and_password() {
        let creds = BASE64_STANDARD.encode(b"dev:1:p:q");
        let headers = headers_with_auth(format!("Basic {creds}").as_bytes());
        assert_eq!(
            basic_password(&headers, "dev:1"),
            Some(b"p:q".to_vec()),
            "identity dev:1 commits the prefix; the rest is the password"
        );
        // A different identity does not match the prefix.
        assert_eq!(basic_password(&headers, "dev"), Some(b"1:p:q".to_vec()));
        assert_eq!(basic_password(&headers, "other"), None);
    }

    #[test]
    fn basic_password_preserves_binary_bytes() {
        let mut raw = b"box:".to_vec();
        raw.extend([0xde, 0xad, 0xbe, 0xef]);
        let creds = BASE64_STANDARD.encode(&raw);
        let headers = headers_with_auth(format!("Basic {creds}").as_bytes());
        assert_eq!(
            basic_password(&headers, "box"),
            Some(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn unparsable_authorization_is_non_fatal() {
        let headers = headers_with_auth(b"Basic not-base64!!!");
        assert_eq!(basic_password(&headers, "dev"), None);

        let headers = headers_with_auth(b"Bearer token");
        assert_eq!(basic_password(&headers, "dev"), None);

        assert_eq!(basic_password(&HeaderMap::new(), "dev"), None);
    }

    #[test]
    fn protocol_header_parsing_splits_and_trims() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("ocpp1.6, ocpp2.0.1"),
        );
        headers.append(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("custom"),
        );
        assert_eq!(
            parse_protocols(&headers),
            vec!["ocpp1.6", "ocpp2.0.1", "custom"]
        );
    }
}
