//! Observable connection events.

/// The `(code, reason)` pair observed when a connection ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code (1006 when the transport dropped without one).
    pub code: u16,
    /// Close reason text.
    pub reason: String,
}

impl CloseInfo {
    pub(crate) fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(1006, reason)
    }
}

/// Events emitted by a peer (and re-surfaced by the client).
#[derive(Debug, Clone)]
pub enum RpcEvent {
    /// A connection attempt is starting (client only).
    Connecting {
        /// 0 for the initial dial, then the reconnect attempt number.
        attempt: u32,
    },
    /// The connection is open and calls may flow.
    Open {
        /// Negotiated subprotocol, when one was selected.
        protocol: Option<String>,
    },
    /// A subprotocol was negotiated (client only).
    Protocol(String),
    /// A local close has begun.
    Closing,
    /// The connection ended; always the final event for a connection.
    Close(CloseInfo),
    /// The transport dropped without a local close; precedes [`RpcEvent::Close`].
    Disconnect(CloseInfo),
    /// A frame failed to decode or correlate.
    BadMessage {
        /// Excerpt of the offending payload.
        payload: String,
        /// Why it was rejected.
        reason: String,
        /// Monotonic bad-message count after this one.
        count: u32,
    },
    /// A connection-level error that is not fatal by itself.
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abnormal_close_uses_1006() {
        let info = CloseInfo::abnormal("connection reset");
        assert_eq!(info.code, 1006);
        assert_eq!(info.reason, "connection reset");
    }
}
