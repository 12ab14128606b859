// Middleware Chain for the Dispatch Pipeline
//
// A stage receives the erased message and a `Next` handle that runs the
// remainder of the chain, with the resolved handler innermost. The chain is
// composed once when the bus is built; the reference order is
// Logging -> Idempotency -> Validation -> Retry -> CircuitBreaker -> Handler.
//
// Each stage must forward the inner result unchanged unless the
// transformation is the stage's own responsibility (retry collapsing
// repeated failures, idempotency replaying a stored result, the breaker
// fast-failing while open).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::handler::ErasedHandler;
use crate::message::{BoxedMessage, BoxedOutput, MessageMeta};

/// Outcome of a chain stage.
pub type StageResult = Result<BoxedOutput, DispatchError>;

/// A cross-cutting stage wrapping handler invocation.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, message: BoxedMessage, next: Next) -> StageResult;
}

/// Handle to the remainder of the chain.
///
/// Cheap to clone: the retry stage re-enters the chain by cloning its `Next`
/// for every attempt.
#[derive(Clone)]
pub struct Next {
    stack: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    handler: Arc<dyn ErasedHandler>,
    meta: Arc<MessageMeta>,
}

impl Next {
    pub(crate) fn new(
        stack: Arc<[Arc<dyn Middleware>]>,
        handler: Arc<dyn ErasedHandler>,
        meta: Arc<MessageMeta>,
    ) -> Self {
        Self {
            stack,
            index: 0,
            handler,
            meta,
        }
    }

    /// Dispatch-time descriptor of the message being processed.
    pub fn meta(&self) -> &MessageMeta {
        &self.meta
    }

    /// Runs the rest of the chain with the given message.
    pub async fn run(mut self, message: BoxedMessage) -> StageResult {
        match self.stack.get(self.index).cloned() {
            Some(stage) => {
                self.index += 1;
                stage.handle(message, self).await
            }
            None => self.handler.call(message).await,
        }
    }
}

/// Structured logging stage, outermost in the default chain.
///
/// Records message type and kind, a per-dispatch execution id, duration and
/// success/failure status.
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, message: BoxedMessage, next: Next) -> StageResult {
        let meta = next.meta().clone();
        let execution_id = Uuid::new_v4();
        let start = Instant::now();

        tracing::debug!(
            message.kind = meta.kind.as_str(),
            message.type = meta.name,
            execution.id = %execution_id,
            "Message received"
        );

        let result = next.run(message).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                tracing::info!(
                    message.type = meta.name,
                    execution.id = %execution_id,
                    duration.ms = elapsed_ms,
                    "Dispatch succeeded"
                );
            }
            Err(err) => {
                tracing::error!(
                    message.type = meta.name,
                    execution.id = %execution_id,
                    duration.ms = elapsed_ms,
                    error = %err,
                    "Dispatch failed"
                );
            }
        }

        result
    }
}

/// Validation stage.
///
/// Rejects structurally invalid messages before any side effect is
/// attempted; a hard validation failure never consumes retry budget or
/// trips a breaker because those stages sit further in.
#[derive(Debug, Clone, Default)]
pub struct ValidationMiddleware;

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn handle(&self, message: BoxedMessage, next: Next) -> StageResult {
        if let Err(err) = message.validate() {
            tracing::warn!(
                message.type = next.meta().name,
                error = %err,
                "Message rejected by validation"
            );
            return Err(err);
        }
        next.run(message).await
    }
}
