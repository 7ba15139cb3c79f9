//! Inbound call dispatch surface.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

/// An inbound CALL handed to a registered handler.
#[derive(Debug, Clone)]
pub struct InboundCall {
    /// Method name from the CALL frame.
    pub method: String,
    /// Params object from the CALL frame.
    pub params: Value,
    /// Correlation id of the CALL frame.
    pub message_id: String,
    /// Fires when the peer disconnects or closes; long handlers should
    /// select against it.
    pub signal: CancellationToken,
}

/// Handles inbound calls for one or more methods.
///
/// Returning `Ok(value)` produces a CALLRESULT; returning `Err` produces a
/// CALLERROR with the error's code, description and details. Closures of
/// the shape `Fn(InboundCall) -> impl Future<Output = Result<Value,
/// RpcError>>` implement this automatically.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Handle one inbound call.
    async fn handle(&self, call: InboundCall) -> Result<Value, RpcError>;
}

#[async_trait]
impl<F, Fut> CallHandler for F
where
    F: Fn(InboundCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn handle(&self, call: InboundCall) -> Result<Value, RpcError> {
        (self)(call).await
    }
}

#[derive(Default)]
struct Registered {
    methods: HashMap<String, Arc<dyn CallHandler>>,
    wildcard: Option<Arc<dyn CallHandler>>,
}

/// Shared, dynamically updatable handler table.
///
/// A method-specific handler wins; the wildcard is the fallback for
/// everything else. Registration may happen at any point in the peer's
/// lifetime.
#[derive(Clone, Default)]
pub(crate) struct HandlerRegistry {
    inner: Arc<RwLock<Registered>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_method(&self, method: impl Into<String>, handler: Arc<dyn CallHandler>) {
        self.inner.write().methods.insert(method.into(), handler);
    }

    pub(crate) fn remove_method(&self, method: &str) -> bool {
        self.inner.write().methods.remove(method).is_some()
    }

    pub(crate) fn set_wildcard(&self, handler: Arc<dyn CallHandler>) {
        self.inner.write().wildcard = Some(handler);
    }

    pub(crate) fn remove_wildcard(&self) -> bool {
        self.inner.write().wildcard.take().is_some()
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.write();
        inner.methods.clear();
        inner.wildcard = None;
    }

    /// Resolve the handler for `method`: specific first, wildcard fallback.
    pub(crate) fn resolve(&self, method: &str) -> Option<Arc<dyn CallHandler>> {
        let inner = self.inner.read();
        inner
            .methods
            .get(method)
            .cloned()
            .or_else(|| inner.wildcard.clone())
    }
}
