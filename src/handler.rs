// Handler traits and type-erased adapters.
//
// Handlers are supplied by business-logic modules at registration time; the
// adapters below erase their concrete types for registry storage and catch
// panics so a crashing handler surfaces as `Err(Fatal)` instead of unwinding
// past dispatch.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::{DispatchError, DispatchResult};
use crate::message::{
    BoxedMessage, BoxedOutput, Command, CommandEnvelope, Query, QueryEnvelope,
};

/// Business logic bound to exactly one command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Execute the command and return the result.
    async fn handle(&self, command: C) -> DispatchResult<C::Output>;
}

/// Business logic bound to exactly one query type.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    /// Execute the query and return the result.
    async fn handle(&self, query: Q) -> DispatchResult<Q::Output>;
}

/// Object-safe handler invocation over an erased message.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn call(&self, message: BoxedMessage) -> Result<BoxedOutput, DispatchError>;
}

pub(crate) struct CommandHandlerAdapter<C: Command, H: CommandHandler<C>> {
    handler: Arc<H>,
    _marker: PhantomData<fn() -> C>,
}

impl<C: Command, H: CommandHandler<C>> CommandHandlerAdapter<C, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<C: Command, H: CommandHandler<C>> ErasedHandler for CommandHandlerAdapter<C, H> {
    async fn call(&self, message: BoxedMessage) -> Result<BoxedOutput, DispatchError> {
        let envelope = message
            .into_any()
            .downcast::<CommandEnvelope<C>>()
            .map_err(|_| DispatchError::Fatal {
                reason: format!("message payload does not match handler for {}", C::NAME),
            })?;

        match AssertUnwindSafe(self.handler.handle(envelope.0))
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => Ok(Box::new(output) as BoxedOutput),
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(DispatchError::Fatal {
                reason: panic_reason(panic),
            }),
        }
    }
}

pub(crate) struct QueryHandlerAdapter<Q: Query, H: QueryHandler<Q>> {
    handler: Arc<H>,
    _marker: PhantomData<fn() -> Q>,
}

impl<Q: Query, H: QueryHandler<Q>> QueryHandlerAdapter<Q, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<Q: Query, H: QueryHandler<Q>> ErasedHandler for QueryHandlerAdapter<Q, H> {
    async fn call(&self, message: BoxedMessage) -> Result<BoxedOutput, DispatchError> {
        let envelope = message
            .into_any()
            .downcast::<QueryEnvelope<Q>>()
            .map_err(|_| DispatchError::Fatal {
                reason: format!("message payload does not match handler for {}", Q::NAME),
            })?;

        match AssertUnwindSafe(self.handler.handle(envelope.0))
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => Ok(Box::new(output) as BoxedOutput),
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(DispatchError::Fatal {
                reason: panic_reason(panic),
            }),
        }
    }
}

/// Extracts a human-readable reason from a caught panic payload.
pub(crate) fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
