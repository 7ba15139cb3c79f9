//! Dialing client with automatic reconnection.
//!
//! The client owns a supervisor task wrapping the same per-connection
//! engine the server uses. While disconnected, calls park in arrival order
//! and flush when the link comes back; the supervisor walks the backoff
//! schedule and gives up on fatal handshake errors or after
//! `max_reconnects` attempts.

use std::{sync::Arc, time::Duration};

use base64::prelude::*;
use http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::client::IntoClientRequest,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{Error, Result, RpcError},
    events::{CloseInfo, RpcEvent},
    handler::CallHandler,
    options::{CallOptions, ClientOptions, CloseOptions},
    peer::{COMMAND_CHANNEL_CAPACITY, PeerActor, PeerCommand, PeerShared, PeerState, RpcPeer},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket RPC client.
///
/// # Example
///
/// ```rust,no_run
/// use ocpp_rpc::{ClientOptions, RpcClient};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> ocpp_rpc::Result<()> {
///     let client = RpcClient::new(
///         ClientOptions::new("ws://localhost:9000/ocpp", "EVB-P1234"),
///     )?;
///     client.connect().await?;
///
///     let response = client
///         .call("Heartbeat", json!({}))
///         .await
///         .expect("heartbeat accepted");
///     println!("time: {response}");
///     Ok(())
/// }
/// ```
pub struct RpcClient {
    options: ClientOptions,
    peer: RpcPeer,
    cmd_rx: parking_lot::Mutex<Option<mpsc::Receiver<PeerCommand>>>,
}

impl RpcClient {
    /// Create a client; fails fast on inconsistent options.
    pub fn new(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let shared = Arc::new(PeerShared::new(
            options.identity.clone(),
            None,
            None,
            None,
        ));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        Ok(Self {
            options,
            peer: RpcPeer::new(cmd_tx, shared),
            cmd_rx: parking_lot::Mutex::new(Some(cmd_rx)),
        })
    }

    /// Dial the endpoint. Resolves with the negotiated subprotocol once the
    /// first attempt settles; reconnection continues in the background per
    /// the configured policy.
    pub async fn connect(&self) -> Result<Option<String>> {
        let Some(cmd_rx) = self.cmd_rx.lock().take() else {
            return Err(Error::config("Client was already started"));
        };
        let (first_tx, first_rx) = oneshot::channel();
        let supervisor = Supervisor {
            options: self.options.clone(),
            shared: self.peer.shared().clone(),
        };
        tokio::spawn(supervisor.run(cmd_rx, first_tx));
        first_rx
            .await
            .unwrap_or_else(|_| Err(Error::transport("Client task ended unexpectedly")))
    }

    /// Issue a call with default options.
    pub async fn call(&self, method: impl Into<String>, params: Value) -> std::result::Result<Value, RpcError> {
        self.peer.call(method, params).await
    }

    /// Issue a call with explicit options.
    pub async fn call_with_options(
        &self,
        method: impl Into<String>,
        params: Value,
        options: CallOptions,
    ) -> std::result::Result<Value, RpcError> {
        self.peer.call_with_options(method, params, options).await
    }

    /// Fire-and-forget call.
    pub async fn call_no_reply(
        &self,
        method: impl Into<String>,
        params: Value,
    ) -> std::result::Result<(), RpcError> {
        self.peer.call_no_reply(method, params).await
    }

    /// Register a handler for one method.
    pub fn handle<H>(&self, method: impl Into<String>, handler: H)
    where
        H: CallHandler + 'static,
    {
        self.peer.handle(method, handler);
    }

    /// Register the wildcard handler.
    pub fn wildcard<H>(&self, handler: H)
    where
        H: CallHandler + 'static,
    {
        self.peer.wildcard(handler);
    }

    /// Remove a method handler.
    pub fn remove_handler(&self, method: &str) -> bool {
        self.peer.remove_handler(method)
    }

    /// Close the connection (or abandon reconnection) with `options`.
    pub async fn close(&self, options: CloseOptions) -> CloseInfo {
        // Never started: settle the close locally.
        if self.cmd_rx.lock().is_some() {
            let shared = self.peer.shared();
            if let Some(info) = shared.stored_final_close() {
                return info;
            }
            let info = CloseInfo::new(options.code, options.reason);
            shared.set_state(PeerState::Closed);
            shared.store_final_close(info.clone());
            shared.emit(RpcEvent::Closing);
            shared.emit(RpcEvent::Close(info.clone()));
            return info;
        }
        self.peer.close(options).await
    }

    /// Subscribe to connection events.
    pub fn events(&self) -> broadcast::Receiver<RpcEvent> {
        self.peer.events()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        self.peer.state()
    }

    /// This client's identity.
    pub fn identity(&self) -> &str {
        self.peer.identity()
    }

    /// Negotiated subprotocol of the current connection.
    pub fn protocol(&self) -> Option<String> {
        self.peer.protocol()
    }

    /// Monotonic bad-message count for the current connection.
    pub fn bad_message_count(&self) -> u32 {
        self.peer.bad_message_count()
    }

    /// Last measured keepalive round-trip.
    pub fn ping_rtt(&self) -> Option<Duration> {
        self.peer.ping_rtt()
    }
}

struct Supervisor {
    options: ClientOptions,
    shared: Arc<PeerShared>,
}

enum DialWait {
    Connected(Box<WsStream>, Option<String>),
    Failed(Error),
    CloseRequested(CloseOptions, oneshot::Sender<CloseInfo>),
    HandlesGone,
}

impl Supervisor {
    async fn run(
        self,
        mut cmd_rx: mpsc::Receiver<PeerCommand>,
        first: oneshot::Sender<Result<Option<String>>>,
    ) {
        let mut first = Some(first);
        let mut parked: Vec<PeerCommand> = Vec::new();
        let mut pinned: Option<Vec<String>> = None;
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                if let Some(max) = self.options.max_reconnects {
                    if attempt > max {
                        warn!(attempt, "Giving up on reconnection");
                        self.finish(parked, CloseInfo::new(1001, "Giving up"), None);
                        return;
                    }
                }
                let delay = self.options.backoff.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis(), "Waiting before reconnect");
                match self.wait(&mut cmd_rx, &mut parked, tokio::time::sleep(delay)).await {
                    Some((options, done)) => {
                        let info = CloseInfo::new(options.code, options.reason);
                        self.shared.emit(RpcEvent::Closing);
                        self.finish(parked, info, Some(done));
                        return;
                    }
                    None => {}
                }
            }

            self.shared.set_state(PeerState::Connecting);
            self.shared.emit(RpcEvent::Connecting { attempt });

            let offered = pinned.as_deref().unwrap_or(&self.options.peer.protocols);
            let wait = {
                let dial = connect_attempt(&self.options, offered);
                tokio::pin!(dial);
                loop {
                    tokio::select! {
                        outcome = &mut dial => break match outcome {
                            Ok((ws, negotiated)) => DialWait::Connected(Box::new(ws), negotiated),
                            Err(e) => DialWait::Failed(e),
                        },
                        command = cmd_rx.recv() => match command {
                            Some(PeerCommand::Close { options, done }) => {
                                break DialWait::CloseRequested(options, done);
                            }
                            Some(command) => park(&mut parked, command),
                            None => break DialWait::HandlesGone,
                        },
                    }
                }
            };

            match wait {
                DialWait::Connected(ws, negotiated) => {
                    attempt = 0;
                    info!(
                        endpoint = %self.options.endpoint,
                        protocol = negotiated.as_deref().unwrap_or("<none>"),
                        "Connected"
                    );
                    self.shared.set_protocol(negotiated.clone());
                    if let Some(protocol) = &negotiated {
                        self.shared.emit(RpcEvent::Protocol(protocol.clone()));
                        // After the first successful connect, only the
                        // negotiated protocol is offered on reconnects.
                        if pinned.is_none() {
                            pinned = Some(vec![protocol.clone()]);
                        }
                    }
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(negotiated.clone()));
                    }

                    let actor = PeerActor::new(self.options.peer.clone(), self.shared.clone());
                    let initial = std::mem::take(&mut parked);
                    let (close, local) = actor.run(*ws, &mut cmd_rx, initial).await;
                    if local {
                        return;
                    }
                    if !self.options.reconnect {
                        debug!(code = close.code, "Disconnected; reconnect disabled");
                        return;
                    }
                    attempt = 1;
                }
                DialWait::Failed(error) => {
                    warn!(error = %error, attempt, "Connect failed");
                    let fatal = error.is_fatal();
                    let retry = self.options.reconnect && !fatal;
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(error));
                    } else {
                        self.shared.emit(RpcEvent::Error(error.to_string()));
                    }
                    if !retry {
                        let info = if fatal {
                            CloseInfo::new(1001, "Giving up")
                        } else {
                            CloseInfo::abnormal("Connection failed")
                        };
                        self.finish(parked, info, None);
                        return;
                    }
                    attempt += 1;
                }
                DialWait::CloseRequested(options, done) => {
                    let info = CloseInfo::new(options.code, options.reason);
                    self.shared.emit(RpcEvent::Closing);
                    self.finish(parked, info, Some(done));
                    return;
                }
                DialWait::HandlesGone => return,
            }
        }
    }

    /// Sleep out a backoff delay while still serving the mailbox. Returns a
    /// close request if one arrives.
    async fn wait(
        &self,
        cmd_rx: &mut mpsc::Receiver<PeerCommand>,
        parked: &mut Vec<PeerCommand>,
        sleep: tokio::time::Sleep,
    ) -> Option<(CloseOptions, oneshot::Sender<CloseInfo>)> {
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                command = cmd_rx.recv() => match command {
                    Some(PeerCommand::Close { options, done }) => return Some((options, done)),
                    Some(command) => park(parked, command),
                    None => {
                        // Wait out the delay anyway so a concurrent close can
                        // not race the shutdown; nothing else can arrive.
                        sleep.await;
                        return None;
                    }
                },
            }
        }
    }

    /// Terminal bookkeeping shared by every way the supervisor ends.
    fn finish(
        &self,
        parked: Vec<PeerCommand>,
        info: CloseInfo,
        done: Option<oneshot::Sender<CloseInfo>>,
    ) {
        for command in parked {
            if let PeerCommand::Call { sink, .. } = command {
                let _ = sink.send(Err(RpcError::disconnected()));
            }
        }
        self.shared.set_state(PeerState::Closed);
        self.shared.store_final_close(info.clone());
        self.shared.emit(RpcEvent::Close(info.clone()));
        if let Some(done) = done {
            let _ = done.send(info);
        }
    }
}

fn park(parked: &mut Vec<PeerCommand>, command: PeerCommand) {
    match command {
        PeerCommand::Abort { message_id } => {
            // The caller has already observed the abort; drop the parked
            // submission without side effects.
            parked.retain(|c| {
                !matches!(c, PeerCommand::Call { message_id: id, .. } if *id == message_id)
            });
        }
        command => parked.push(command),
    }
}

/// One connection attempt: URL construction, handshake, subprotocol checks.
async fn connect_attempt(
    options: &ClientOptions,
    offered: &[String],
) -> Result<(WsStream, Option<String>)> {
    let url = build_url(options)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(Error::from)?;

    if !offered.is_empty() {
        let value = offered.join(", ");
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            value
                .parse()
                .map_err(|_| Error::config("Subprotocol list is not a valid header value"))?,
        );
    }
    if let Some(password) = &options.password {
        let mut credentials = options.identity.clone().into_bytes();
        credentials.push(b':');
        credentials.extend_from_slice(password);
        let value = format!("Basic {}", BASE64_STANDARD.encode(credentials));
        request.headers_mut().insert(
            AUTHORIZATION,
            value
                .parse()
                .map_err(|_| Error::config("Credentials are not a valid header value"))?,
        );
    }

    let (ws, response) = tokio::time::timeout(options.connect_timeout, connect_async(request))
        .await
        .map_err(|_| Error::Timeout {
            duration: options.connect_timeout,
        })??;

    let negotiated = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match &negotiated {
        Some(protocol) if offered.is_empty() => {
            debug!(protocol = %protocol, "Unsolicited subprotocol");
            return Err(Error::fatal("Server sent a subprotocol but none was requested"));
        }
        Some(protocol) if !offered.iter().any(|p| p == protocol) => {
            return Err(Error::fatal("Server sent an invalid subprotocol"));
        }
        None if !offered.is_empty() => {
            return Err(Error::fatal("Server sent no subprotocol"));
        }
        _ => {}
    }

    Ok((ws, negotiated))
}

/// `endpoint + "/" + urlencode(identity) + ["?" + query]`.
fn build_url(options: &ClientOptions) -> Result<Url> {
    let mut url = Url::parse(&options.endpoint)?;
    url.path_segments_mut()
        .map_err(|_| Error::config("Endpoint URL cannot be a base"))?
        .pop_if_empty()
        .push(&options.identity);
    if let Some(query) = &options.query {
        url.set_query(Some(query));
    }
    Ok(url)
}
