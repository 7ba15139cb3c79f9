//! # ocpp-rpc
//!
//! Symmetric OCPP-style JSON-RPC over WebSocket.
//!
//! Frames are the OCPP-J JSON arrays — CALL `[2, id, method, params]`,
//! CALLRESULT `[3, id, result]` and CALLERROR `[4, id, code, description,
//! details]` — and both ends of a connection get the same surface: register
//! method handlers, issue calls with per-call timeouts, bounded in-flight
//! concurrency, keepalive pings and graceful shutdown. [`RpcServer`]
//! accepts HTTP upgrades and promotes them to peers; [`RpcClient`] dials
//! out and reconnects with jittered exponential backoff.
//!
//! # Server Example
//!
//! ```rust,no_run
//! use ocpp_rpc::{RpcServer, ServerEvent, ServerOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> ocpp_rpc::Result<()> {
//!     let server = RpcServer::new(ServerOptions::new())?;
//!     let mut events = server.events();
//!     server.listen("0.0.0.0:3000").await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ServerEvent::Client(peer) = event {
//!             println!("{} connected", peer.identity());
//!             peer.handle("Heartbeat", |_call| async move {
//!                 Ok(json!({"currentTime": "2024-01-01T00:00:00Z"}))
//!             });
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Client Example
//!
//! ```rust,no_run
//! use ocpp_rpc::{ClientOptions, RpcClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> ocpp_rpc::Result<()> {
//!     let client = RpcClient::new(ClientOptions::new("ws://localhost:3000", "EVB-P1234"))?;
//!     client.connect().await?;
//!     let reply = client.call("Heartbeat", json!({})).await;
//!     println!("heartbeat: {reply:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Strict mode
//!
//! When a subprotocol is listed as strict and carries a [`Validator`], both
//! inbound requests and inbound responses are validated against its JSON
//! Schemas before they surface; violations answer with the mapped OCPP
//! error code instead of reaching a handler.

pub mod backoff;
mod client;
mod error;
mod events;
mod handler;
mod keepalive;
mod options;
mod pending;
mod peer;
mod queue;
mod server;
pub mod validator;
pub mod wire;

pub use backoff::BackoffOptions;
pub use client::RpcClient;
pub use error::{Error, ErrorCode, Result, RpcError};
pub use events::{CloseInfo, RpcEvent};
pub use handler::{CallHandler, InboundCall};
pub use options::{
    CallOptions, ClientOptions, CloseOptions, PeerOptions, ServerOptions, StrictMode,
};
pub use peer::{PeerState, RpcPeer, Session};
pub use server::{AuthCallback, AuthOutcome, Handshake, RpcServer, ServerEvent};
pub use validator::{Direction, ValidationFailure, ValidationOutcome, Validator};
