//! The per-connection RPC engine.
//!
//! Every connection, dialed or accepted, is driven by a [`PeerActor`]
//! running in its own task. The actor owns the WebSocket, the pending-call
//! and pending-response tables, the outbound admission queue and the
//! keepalive timer; everything that happens on one connection is serialized
//! through its mailbox. [`RpcPeer`] is the cloneable handle the application
//! holds.

use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    time::Duration,
};

use futures_util::{FutureExt, SinkExt, StreamExt, stream::SplitSink};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc, oneshot},
    time::Instant,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{ErrorCode, RpcError, degraded_details},
    events::{CloseInfo, RpcEvent},
    handler::{CallHandler, HandlerRegistry, InboundCall},
    keepalive::{Keepalive, PingAction},
    options::{CallOptions, CloseOptions, PeerOptions},
    pending::{PendingCall, PendingCalls, PendingResponses},
    queue::{CallQueue, QueuedCall},
    server::Handshake,
    validator::{Direction, ValidationOutcome, Validator},
    wire::{self, WireMessage},
};

/// Grace period for the peer to acknowledge our close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 256;
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Opaque per-connection payload produced by the server auth callback.
pub type Session = Arc<dyn Any + Send + Sync>;

/// Lifecycle state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    /// Dialing or between reconnect attempts (client only).
    Connecting = 0,
    /// Calls may flow.
    Open = 1,
    /// A local close is in progress.
    Closing = 2,
    /// The connection is gone.
    Closed = 3,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

pub(crate) enum PeerCommand {
    Call {
        message_id: String,
        method: String,
        params: Value,
        options: CallOptions,
        sink: oneshot::Sender<Result<Value, RpcError>>,
    },
    Abort {
        message_id: String,
    },
    Close {
        options: CloseOptions,
        done: oneshot::Sender<CloseInfo>,
    },
}

/// State shared between the handle and the actor.
pub(crate) struct PeerShared {
    identity: String,
    protocol: parking_lot::RwLock<Option<String>>,
    session: Option<Session>,
    handshake: Option<Arc<Handshake>>,
    registry: HandlerRegistry,
    events: broadcast::Sender<RpcEvent>,
    state: AtomicU8,
    bad_messages: AtomicU32,
    ping_rtt: parking_lot::Mutex<Option<Duration>>,
    final_close: parking_lot::Mutex<Option<CloseInfo>>,
}

impl PeerShared {
    pub(crate) fn new(
        identity: String,
        protocol: Option<String>,
        session: Option<Session>,
        handshake: Option<Arc<Handshake>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            identity,
            protocol: parking_lot::RwLock::new(protocol),
            session,
            handshake,
            registry: HandlerRegistry::new(),
            events,
            state: AtomicU8::new(PeerState::Connecting as u8),
            bad_messages: AtomicU32::new(0),
            ping_rtt: parking_lot::Mutex::new(None),
            final_close: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_protocol(&self, protocol: Option<String>) {
        *self.protocol.write() = protocol;
    }

    pub(crate) fn emit(&self, event: RpcEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.events.subscribe()
    }

    pub(crate) fn store_final_close(&self, info: CloseInfo) {
        *self.final_close.lock() = Some(info);
    }

    pub(crate) fn stored_final_close(&self) -> Option<CloseInfo> {
        self.final_close.lock().clone()
    }
}

/// Handle to one RPC connection.
///
/// Cheap to clone; all clones address the same connection. Obtained from
/// [`crate::RpcServer`] events for accepted connections, or owned by a
/// [`crate::RpcClient`] for dialed ones.
#[derive(Clone)]
pub struct RpcPeer {
    cmd_tx: mpsc::Sender<PeerCommand>,
    shared: Arc<PeerShared>,
}

impl std::fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPeer")
            .field("identity", &self.shared.identity)
            .field("state", &self.state())
            .finish()
    }
}

impl RpcPeer {
    pub(crate) fn new(cmd_tx: mpsc::Sender<PeerCommand>, shared: Arc<PeerShared>) -> Self {
        Self { cmd_tx, shared }
    }

    /// Issue a call with default options and await the response payload.
    pub async fn call(&self, method: impl Into<String>, params: Value) -> Result<Value, RpcError> {
        self.call_with_options(method, params, CallOptions::default())
            .await
    }

    /// Issue a call with explicit options.
    pub async fn call_with_options(
        &self,
        method: impl Into<String>,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        let message_id = ulid::Ulid::new().to_string();
        let signal = options.signal.clone();
        let (tx, rx) = oneshot::channel();
        let command = PeerCommand::Call {
            message_id: message_id.clone(),
            method: method.into(),
            params,
            options,
            sink: tx,
        };
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| RpcError::disconnected())?;

        match signal {
            Some(signal) => {
                tokio::select! {
                    outcome = rx => outcome.unwrap_or_else(|_| Err(RpcError::disconnected())),
                    _ = signal.cancelled() => {
                        let _ = self
                            .cmd_tx
                            .send(PeerCommand::Abort {
                                message_id,
                            })
                            .await;
                        Err(RpcError::aborted())
                    }
                }
            }
            None => rx.await.unwrap_or_else(|_| Err(RpcError::disconnected())),
        }
    }

    /// Fire-and-forget call: resolves once the frame is on the wire.
    pub async fn call_no_reply(
        &self,
        method: impl Into<String>,
        params: Value,
    ) -> Result<(), RpcError> {
        self.call_with_options(method, params, CallOptions::default().no_reply(true))
            .await
            .map(|_| ())
    }

    /// Register a handler for one method.
    pub fn handle<H>(&self, method: impl Into<String>, handler: H)
    where
        H: CallHandler + 'static,
    {
        self.shared.registry.set_method(method, Arc::new(handler));
    }

    /// Register the wildcard handler used when no method handler matches.
    pub fn wildcard<H>(&self, handler: H)
    where
        H: CallHandler + 'static,
    {
        self.shared.registry.set_wildcard(Arc::new(handler));
    }

    /// Remove a method handler. Returns whether one was registered.
    pub fn remove_handler(&self, method: &str) -> bool {
        self.shared.registry.remove_method(method)
    }

    /// Remove the wildcard handler. Returns whether one was registered.
    pub fn remove_wildcard(&self) -> bool {
        self.shared.registry.remove_wildcard()
    }

    /// Close the connection. Idempotent: every caller observes the same
    /// `(code, reason)` outcome.
    pub async fn close(&self, options: CloseOptions) -> CloseInfo {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PeerCommand::Close { options, done: tx })
            .await
            .is_err()
        {
            return self.final_close_info();
        }
        match rx.await {
            Ok(info) => info,
            Err(_) => self.final_close_info(),
        }
    }

    fn final_close_info(&self) -> CloseInfo {
        self.shared
            .final_close
            .lock()
            .clone()
            .unwrap_or_else(|| CloseInfo::abnormal(""))
    }

    /// Subscribe to this peer's events.
    pub fn events(&self) -> broadcast::Receiver<RpcEvent> {
        self.shared.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// The peer's identity.
    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    /// Negotiated subprotocol, when one was selected.
    pub fn protocol(&self) -> Option<String> {
        self.shared.protocol.read().clone()
    }

    /// Session payload produced by the server auth callback.
    pub fn session(&self) -> Option<Session> {
        self.shared.session.clone()
    }

    /// Handshake record for accepted connections.
    pub fn handshake(&self) -> Option<Arc<Handshake>> {
        self.shared.handshake.clone()
    }

    /// Monotonic count of undecodable or uncorrelatable frames.
    pub fn bad_message_count(&self) -> u32 {
        self.shared.bad_messages.load(Ordering::Acquire)
    }

    /// Last measured keepalive round-trip.
    pub fn ping_rtt(&self) -> Option<Duration> {
        *self.shared.ping_rtt.lock()
    }

    pub(crate) fn shared(&self) -> &Arc<PeerShared> {
        &self.shared
    }
}

enum HandlerOutcome {
    Returned(Result<Value, RpcError>),
    Panicked(String),
}

struct HandlerDone {
    message_id: String,
    outcome: HandlerOutcome,
}

struct InboundWork {
    message_id: String,
    method: String,
    params: Value,
}

#[derive(Debug, Clone)]
enum Finish {
    /// A locally initiated close ran to completion.
    Graceful(CloseInfo),
    /// The transport dropped or the remote closed first.
    Disconnected(CloseInfo),
}

/// Drives one WebSocket connection.
pub(crate) struct PeerActor {
    opts: PeerOptions,
    shared: Arc<PeerShared>,
    validator: Option<Arc<Validator>>,
    pending_calls: PendingCalls,
    pending_responses: PendingResponses,
    queue: CallQueue,
    inbound_waiting: VecDeque<InboundWork>,
    inbound_active: usize,
    keepalive: Keepalive,
    conn_token: CancellationToken,
    internal_tx: mpsc::UnboundedSender<HandlerDone>,
    internal_rx: Option<mpsc::UnboundedReceiver<HandlerDone>>,
    closing: Option<CloseOptions>,
    close_waiters: Vec<oneshot::Sender<CloseInfo>>,
    close_frame_sent: bool,
    close_deadline: Option<Instant>,
    peer_close: Option<CloseInfo>,
    finished: Option<Finish>,
}

impl PeerActor {
    pub(crate) fn new(opts: PeerOptions, shared: Arc<PeerShared>) -> Self {
        let validator = opts.validator_for(shared.protocol.read().as_deref());
        let keepalive = Keepalive::new(
            opts.ping_interval,
            opts.defer_pings_on_activity,
            Instant::now(),
        );
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let queue = CallQueue::new(opts.call_concurrency);
        Self {
            opts,
            shared,
            validator,
            pending_calls: PendingCalls::default(),
            pending_responses: PendingResponses::default(),
            queue,
            inbound_waiting: VecDeque::new(),
            inbound_active: 0,
            keepalive,
            conn_token: CancellationToken::new(),
            internal_tx,
            internal_rx: Some(internal_rx),
            closing: None,
            close_waiters: Vec::new(),
            close_frame_sent: false,
            close_deadline: None,
            peer_close: None,
            finished: None,
        }
    }

    /// Run the connection to completion. Returns the final close info and
    /// whether the end was locally initiated.
    pub(crate) async fn run<S>(
        mut self,
        ws: WebSocketStream<S>,
        cmd_rx: &mut mpsc::Receiver<PeerCommand>,
        initial: Vec<PeerCommand>,
    ) -> (CloseInfo, bool)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        let mut internal_rx = self.internal_rx.take().expect("run called once");

        self.keepalive = Keepalive::new(
            self.opts.ping_interval,
            self.opts.defer_pings_on_activity,
            Instant::now(),
        );
        self.shared.bad_messages.store(0, Ordering::Release);
        self.shared.set_state(PeerState::Open);
        self.shared.emit(RpcEvent::Open {
            protocol: self.shared.protocol.read().clone(),
        });

        // Calls parked while the client was connecting flush first, in order.
        for command in initial {
            self.on_command(&mut sink, command).await;
            if self.finished.is_some() {
                break;
            }
        }

        let mut mailbox_open = true;
        while self.finished.is_none() {
            let next_timer = self.next_timer();
            tokio::select! {
                Some(done) = internal_rx.recv() => {
                    self.on_handler_done(&mut sink, done).await;
                }
                command = cmd_rx.recv(), if mailbox_open => match command {
                    Some(command) => self.on_command(&mut sink, command).await,
                    None => {
                        // Every handle is gone; nothing can observe this
                        // connection any more.
                        mailbox_open = false;
                        self.begin_close(&mut sink, CloseOptions::default(), None).await;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(message)) => self.on_frame(&mut sink, message).await,
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket stream error");
                        self.finished = Some(Finish::Disconnected(
                            self.peer_close.clone().unwrap_or_else(|| CloseInfo::abnormal(e.to_string())),
                        ));
                    }
                    None => {
                        self.finished = Some(if self.closing.is_some() {
                            Finish::Graceful(self.close_info_for_finish())
                        } else {
                            Finish::Disconnected(
                                self.peer_close
                                    .clone()
                                    .unwrap_or_else(|| CloseInfo::abnormal("")),
                            )
                        });
                    }
                },
                _ = tokio::time::sleep_until(next_timer) => {
                    self.on_timer(&mut sink).await;
                }
            }
        }

        let finish = self.finished.take().expect("loop exited with a finish");
        self.finish(finish)
    }

    fn next_timer(&self) -> Instant {
        let mut next = self.keepalive.next_due();
        if let Some(deadline) = self.pending_calls.next_deadline() {
            next = next.min(deadline);
        }
        if let Some(deadline) = self.close_deadline {
            next = next.min(deadline);
        }
        next
    }

    fn finish(mut self, finish: Finish) -> (CloseInfo, bool) {
        // Signals fire before any terminal event is observable.
        self.conn_token.cancel();
        self.pending_responses.cancel_all();
        self.pending_calls.fail_all(&RpcError::disconnected());
        self.queue.reject_waiting(&RpcError::disconnected());
        self.inbound_waiting.clear();

        let (info, local) = match finish {
            Finish::Graceful(info) => (info, true),
            Finish::Disconnected(info) => (info, false),
        };
        self.shared.set_state(PeerState::Closed);
        *self.shared.final_close.lock() = Some(info.clone());

        if !local {
            self.shared.emit(RpcEvent::Disconnect(info.clone()));
        }
        self.shared.emit(RpcEvent::Close(info.clone()));

        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(info.clone());
        }
        (info, local)
    }

    async fn on_command<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        command: PeerCommand,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match command {
            PeerCommand::Call {
                message_id,
                method,
                params,
                options,
                sink: call_sink,
            } => {
                if self.closing.is_some() {
                    let _ = call_sink.send(Err(RpcError::closing()));
                    return;
                }
                if let Some(signal) = &options.signal {
                    if signal.is_cancelled() {
                        let _ = call_sink.send(Err(RpcError::aborted()));
                        return;
                    }
                }
                let queued = QueuedCall {
                    message_id,
                    method,
                    params,
                    timeout: options.timeout,
                    no_reply: options.no_reply,
                    sink: call_sink,
                };
                if let Some(admitted) = self.queue.admit(queued) {
                    self.transmit_calls(sink, admitted).await;
                }
            }
            PeerCommand::Abort { message_id } => {
                if let Some(call) = self.queue.take_waiting(&message_id) {
                    let _ = call.sink.send(Err(RpcError::aborted()));
                } else if self.pending_calls.resolve(&message_id, Err(RpcError::aborted())) {
                    self.admit_next(sink).await;
                }
            }
            PeerCommand::Close { options, done } => {
                self.begin_close(sink, options, Some(done)).await;
            }
        }
    }

    /// Transmit an admitted call, then keep draining the queue while
    /// `no_reply` transmissions free their slot immediately.
    async fn transmit_calls<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        first: QueuedCall,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut next = Some(first);
        while let Some(call) = next.take() {
            let frame = WireMessage::Call {
                message_id: call.message_id.clone(),
                method: call.method.clone(),
                params: call.params.clone(),
            };
            if let Err(e) = self.send_text(sink, wire::encode(&frame)).await {
                let _ = call.sink.send(Err(RpcError::disconnected()));
                self.finished = Some(Finish::Disconnected(CloseInfo::abnormal(e)));
                return;
            }
            debug!(method = %call.method, message_id = %call.message_id, "Sent CALL");
            if call.no_reply {
                let _ = call.sink.send(Ok(Value::Null));
                next = self.queue.release();
            } else {
                let timeout = call.timeout.unwrap_or(self.opts.call_timeout);
                self.pending_calls.insert(
                    call.message_id,
                    PendingCall {
                        method: call.method,
                        deadline: Instant::now() + timeout,
                        sink: call.sink,
                    },
                );
            }
        }
    }

    /// A concurrency slot was freed; admit and transmit the next parked call.
    async fn admit_next<S>(&mut self, sink: &mut SplitSink<WebSocketStream<S>, Message>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(next) = self.queue.release() {
            self.transmit_calls(sink, next).await;
        }
        self.try_finish_close(sink).await;
    }

    async fn on_frame<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        message: Message,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.keepalive.on_activity(Instant::now());
        match message {
            Message::Text(text) => match wire::decode(&text) {
                Ok(WireMessage::Call {
                    message_id,
                    method,
                    params,
                }) => self.on_inbound_call(sink, message_id, method, params).await,
                Ok(WireMessage::Result {
                    message_id,
                    payload,
                }) => self.on_inbound_result(sink, &text, message_id, payload).await,
                Ok(WireMessage::Error {
                    message_id,
                    code,
                    description,
                    details,
                }) => {
                    self.on_inbound_error(sink, &text, message_id, code, description, details)
                        .await;
                }
                Err(malformed) => {
                    self.bad_message(sink, malformed.payload, malformed.reason)
                        .await;
                }
            },
            Message::Binary(_) => {
                self.bad_message(
                    sink,
                    String::from("<binary>"),
                    String::from("Binary frames are not supported"),
                )
                .await;
            }
            Message::Pong(_) => {
                if let Some(rtt) = self.keepalive.on_pong(Instant::now()) {
                    debug!(rtt_ms = rtt.as_millis(), "Pong received");
                    *self.shared.ping_rtt.lock() = Some(rtt);
                }
            }
            // tungstenite answers pings on its own; activity is recorded above.
            Message::Ping(_) => {}
            Message::Close(frame) => {
                let info = frame
                    .map(|f| CloseInfo::new(u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or_else(|| CloseInfo::abnormal(""));
                debug!(code = info.code, reason = %info.reason, "Close frame received");
                self.peer_close = Some(info);
            }
            Message::Frame(_) => {}
        }
    }

    async fn on_inbound_call<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        message_id: String,
        method: String,
        params: Value,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.closing.is_some() {
            self.send_error_frame(sink, &message_id, &RpcError::closing())
                .await;
            return;
        }

        if let Some(validator) = self.validator.clone() {
            match validator.validate(Direction::Request, &method, &params) {
                ValidationOutcome::Valid => {}
                ValidationOutcome::NoSchema => {
                    let error = RpcError::new(
                        ErrorCode::ProtocolError,
                        format!("No schema defined for method {method:?}"),
                    );
                    self.send_error_frame(sink, &message_id, &error).await;
                    return;
                }
                ValidationOutcome::Invalid(failure) => {
                    let error = RpcError::new(failure.error_code(), failure.message.clone())
                        .with_details(json!({"instancePath": failure.instance_path}));
                    self.send_error_frame(sink, &message_id, &error).await;
                    return;
                }
            }
        }

        let work = InboundWork {
            message_id,
            method,
            params,
        };
        if self.inbound_active < self.opts.call_concurrency {
            self.start_handler(sink, work).await;
        } else {
            self.inbound_waiting.push_back(work);
        }
    }

    async fn start_handler<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        work: InboundWork,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(handler) = self.shared.registry.resolve(&work.method) else {
            let error = RpcError::new(
                ErrorCode::NotImplemented,
                format!("Unable to handle {:?} calls", work.method),
            );
            self.send_error_frame(sink, &work.message_id, &error).await;
            return;
        };

        let signal = self
            .pending_responses
            .insert(work.message_id.clone(), &self.conn_token);
        self.inbound_active += 1;

        let call = InboundCall {
            method: work.method,
            params: work.params,
            message_id: work.message_id.clone(),
            signal,
        };
        let done_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let message_id = call.message_id.clone();
            let outcome = match std::panic::AssertUnwindSafe(handler.handle(call))
                .catch_unwind()
                .await
            {
                Ok(result) => HandlerOutcome::Returned(result),
                Err(panic) => HandlerOutcome::Panicked(panic_message(&panic)),
            };
            let _ = done_tx.send(HandlerDone {
                message_id,
                outcome,
            });
        });
    }

    async fn on_handler_done<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        done: HandlerDone,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.inbound_active = self.inbound_active.saturating_sub(1);

        // A cancelled or already-completed entry must not produce a frame.
        if self.pending_responses.complete(&done.message_id) {
            match done.outcome {
                HandlerOutcome::Returned(Ok(payload)) => {
                    // Handlers returning no payload still answer with an object.
                    let payload = if payload.is_null() { json!({}) } else { payload };
                    let frame = WireMessage::Result {
                        message_id: done.message_id.clone(),
                        payload,
                    };
                    if let Err(e) = self.send_text(sink, wire::encode(&frame)).await {
                        self.finished = Some(Finish::Disconnected(CloseInfo::abnormal(e)));
                        return;
                    }
                }
                HandlerOutcome::Returned(Err(error)) => {
                    self.send_error_frame(sink, &done.message_id, &error).await;
                }
                HandlerOutcome::Panicked(message) => {
                    warn!(message_id = %done.message_id, panic = %message, "Handler panicked");
                    let mut error = RpcError::new(ErrorCode::InternalError, "Internal error");
                    if self.opts.respond_with_detailed_errors {
                        error = error.with_details(degraded_details(&message, None));
                    }
                    self.send_error_frame(sink, &done.message_id, &error).await;
                }
            }
        }

        if self.finished.is_some() {
            return;
        }
        if self.inbound_active < self.opts.call_concurrency {
            if let Some(work) = self.inbound_waiting.pop_front() {
                self.start_handler(sink, work).await;
            }
        }
        self.try_finish_close(sink).await;
    }

    async fn on_inbound_result<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        raw: &str,
        message_id: String,
        payload: Value,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.pending_calls.contains(&message_id) {
            self.bad_message(
                sink,
                raw.chars().take(256).collect(),
                format!("Got a CALLRESULT for unknown message ID {message_id:?}"),
            )
            .await;
            return;
        }

        if let Some(validator) = self.validator.clone() {
            let method = self
                .pending_calls
                .method_of(&message_id)
                .unwrap_or_default()
                .to_string();
            match validator.validate(Direction::Response, &method, &payload) {
                ValidationOutcome::Valid | ValidationOutcome::NoSchema => {}
                ValidationOutcome::Invalid(failure) => {
                    let error = RpcError::new(failure.error_code(), failure.message.clone())
                        .with_details(json!({"instancePath": failure.instance_path}));
                    self.pending_calls.resolve(&message_id, Err(error));
                    self.admit_next(sink).await;
                    self.bad_message(
                        sink,
                        raw.chars().take(256).collect(),
                        format!("Response for {method:?} failed schema validation"),
                    )
                    .await;
                    return;
                }
            }
        }

        self.pending_calls.resolve(&message_id, Ok(payload));
        self.admit_next(sink).await;
    }

    async fn on_inbound_error<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        raw: &str,
        message_id: String,
        code: ErrorCode,
        description: String,
        details: Value,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let error = RpcError {
            code,
            description,
            details,
        };
        if self.pending_calls.resolve(&message_id, Err(error)) {
            self.admit_next(sink).await;
        } else {
            self.bad_message(
                sink,
                raw.chars().take(256).collect(),
                format!("Got a CALLERROR for unknown message ID {message_id:?}"),
            )
            .await;
        }
    }

    async fn bad_message<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        payload: String,
        reason: String,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let count = self.shared.bad_messages.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(count, reason = %reason, "Bad message");
        self.shared.emit(RpcEvent::BadMessage {
            payload,
            reason,
            count,
        });
        if let Some(max) = self.opts.max_bad_messages {
            if count > max {
                self.begin_close(
                    sink,
                    CloseOptions::new().code(1002).reason("Protocol error"),
                    None,
                )
                .await;
            }
        }
    }

    async fn on_timer<S>(&mut self, sink: &mut SplitSink<WebSocketStream<S>, Message>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let now = Instant::now();

        let expired = self.pending_calls.expire_due(now);
        for _ in 0..expired {
            self.admit_next(sink).await;
            if self.finished.is_some() {
                return;
            }
        }

        if let Some(deadline) = self.close_deadline {
            if now >= deadline {
                let info = self.close_info_for_finish();
                self.finished = Some(Finish::Graceful(info));
                return;
            }
        }

        if self.keepalive.is_due(now) {
            match self.keepalive.on_fire(now) {
                PingAction::Send => {
                    if let Err(e) = self.send_message(sink, Message::Ping(Vec::new())).await {
                        self.finished = Some(Finish::Disconnected(CloseInfo::abnormal(e)));
                    }
                }
                PingAction::Timeout => {
                    warn!("Ping timeout");
                    self.begin_close(
                        sink,
                        CloseOptions::new().code(1002).reason("Ping timeout"),
                        None,
                    )
                    .await;
                }
            }
        }
    }

    async fn begin_close<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        options: CloseOptions,
        done: Option<oneshot::Sender<CloseInfo>>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(waiter) = done {
            self.close_waiters.push(waiter);
        }
        if self.closing.is_some() {
            return;
        }

        self.shared.set_state(PeerState::Closing);
        self.shared.emit(RpcEvent::Closing);
        debug!(code = options.code, reason = %options.reason, "Closing");

        if !options.await_pending {
            self.pending_calls.fail_all(&RpcError::closing());
            self.queue.reset(&RpcError::closing());
            self.pending_responses.cancel_all();
            self.inbound_waiting.clear();
            self.inbound_active = 0;
        }

        if options.force {
            let info = CloseInfo::new(options.code, options.reason.clone());
            self.closing = Some(options);
            self.finished = Some(Finish::Graceful(info));
            return;
        }

        self.closing = Some(options);
        self.try_finish_close(sink).await;
    }

    /// When a close is pending and all tracked work has drained, send the
    /// close frame and arm the grace timer.
    async fn try_finish_close<S>(&mut self, sink: &mut SplitSink<WebSocketStream<S>, Message>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(options) = self.closing.clone() else {
            return;
        };
        if self.close_frame_sent || self.finished.is_some() {
            return;
        }
        let drained = self.pending_calls.is_empty()
            && self.queue.is_idle()
            && self.pending_responses.is_empty()
            && self.inbound_waiting.is_empty();
        if !drained {
            return;
        }

        let frame = CloseFrame {
            code: CloseCode::from(options.code),
            reason: options.reason.clone().into(),
        };
        self.close_frame_sent = true;
        self.close_deadline = Some(Instant::now() + CLOSE_GRACE);
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Close frame failed to send");
            let info = self.close_info_for_finish();
            self.finished = Some(Finish::Graceful(info));
        }
    }

    fn close_info_for_finish(&self) -> CloseInfo {
        if let Some(peer) = &self.peer_close {
            return peer.clone();
        }
        match &self.closing {
            Some(options) => CloseInfo::new(options.code, options.reason.clone()),
            None => CloseInfo::abnormal(""),
        }
    }

    async fn send_error_frame<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        message_id: &str,
        error: &RpcError,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = WireMessage::Error {
            message_id: message_id.to_string(),
            code: error.code,
            description: error.description.clone(),
            details: error.details.clone(),
        };
        if let Err(e) = self.send_text(sink, wire::encode(&frame)).await {
            self.finished = Some(Finish::Disconnected(CloseInfo::abnormal(e)));
        }
    }

    async fn send_text<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        text: String,
    ) -> Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.send_message(sink, Message::Text(text)).await
    }

    async fn send_message<S>(
        &mut self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        message: Message,
    ) -> Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.close_frame_sent {
            // The close handshake is in flight; nothing else may follow it.
            return Ok(());
        }
        self.keepalive.on_activity(Instant::now());
        sink.send(message).await.map_err(|e| e.to_string())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("handler panicked")
    }
}
