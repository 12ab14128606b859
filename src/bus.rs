// Command Bus / Query Bus
//
// The public entry points: a builder owns handler registration and chain
// configuration, the built bus resolves handlers by TypeId and runs the
// middleware chain around them. Registration is a setup-phase operation;
// a built bus is immutable, cheap to clone and safe to share across tasks.

use std::any::TypeId;
use std::sync::Arc;

use crate::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerMiddleware, CircuitBreakerRegistry,
};
use crate::error::{DispatchError, DispatchResult};
use crate::handler::{CommandHandler, CommandHandlerAdapter, QueryHandler, QueryHandlerAdapter};
use crate::idempotency::{IdempotencyConfig, IdempotencyGuard, IdempotencyMiddleware};
use crate::message::{
    BoxedMessage, BoxedOutput, Command, CommandEnvelope, MessageKind, MessageMeta, Query,
    QueryEnvelope,
};
use crate::middleware::{LoggingMiddleware, Middleware, Next, ValidationMiddleware};
use crate::registry::HandlerRegistry;
use crate::retry::{RetryMiddleware, RetryPolicy};

struct BusCore {
    registry: HandlerRegistry,
    stack: Arc<[Arc<dyn Middleware>]>,
}

impl BusCore {
    async fn dispatch_erased(
        &self,
        type_id: TypeId,
        meta: MessageMeta,
        message: BoxedMessage,
    ) -> Result<BoxedOutput, DispatchError> {
        let Some(handler) = self.registry.get(&type_id) else {
            tracing::error!(message.type = meta.name, "No handler registered");
            return Err(DispatchError::UnregisteredHandler {
                message_type: meta.name,
            });
        };

        let next = Next::new(Arc::clone(&self.stack), Arc::clone(handler), Arc::new(meta));
        next.run(message).await
    }
}

fn downcast_output<T: 'static>(output: BoxedOutput, name: &'static str) -> DispatchResult<T> {
    output
        .into_any()
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| DispatchError::Fatal {
            reason: format!("output type mismatch for {name}"),
        })
}

/// Write-side dispatch entry point.
///
/// Built once at startup via [`CommandBusBuilder`]. The default chain is
/// Logging -> Idempotency -> Validation -> Retry -> CircuitBreaker -> Handler.
#[derive(Clone)]
pub struct CommandBus {
    core: Arc<BusCore>,
}

impl CommandBus {
    pub fn builder() -> CommandBusBuilder {
        CommandBusBuilder::new()
    }

    /// Dispatches `command` through the middleware chain to its handler.
    ///
    /// Always returns a result; unexpected faults (including a panicking
    /// handler) surface as `Err(Fatal)` rather than unwinding.
    pub async fn dispatch<C: Command>(&self, command: C) -> DispatchResult<C::Output> {
        let meta = MessageMeta {
            kind: MessageKind::Command,
            name: C::NAME,
            idempotency_key: command.idempotency_key().map(|key| key.into_owned()),
            idempotency_ttl: command.idempotency_ttl(),
        };
        let output = self
            .core
            .dispatch_erased(TypeId::of::<C>(), meta, Box::new(CommandEnvelope(command)))
            .await?;
        downcast_output::<C::Output>(output, C::NAME)
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.core.registry.len()
    }
}

/// Builder for [`CommandBus`].
///
/// Registration happens only here, before the first dispatch; registering a
/// second handler for a command type fails immediately.
pub struct CommandBusBuilder {
    registry: HandlerRegistry,
    retry: RetryPolicy,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    breaker_config: CircuitBreakerConfig,
    idempotency: Option<Arc<IdempotencyGuard>>,
    idempotency_config: IdempotencyConfig,
    extra: Vec<Arc<dyn Middleware>>,
}

impl CommandBusBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            retry: RetryPolicy::default(),
            breakers: None,
            breaker_config: CircuitBreakerConfig::default(),
            idempotency: None,
            idempotency_config: IdempotencyConfig::default(),
            extra: Vec::new(),
        }
    }

    /// Registers `handler` for command type `C`.
    pub fn register<C, H>(mut self, handler: H) -> DispatchResult<Self>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.registry.insert(
            TypeId::of::<C>(),
            C::NAME,
            Arc::new(CommandHandlerAdapter::new(handler)),
        )?;
        Ok(self)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Shares an application-owned breaker registry with this bus.
    pub fn with_circuit_breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(registry);
        self
    }

    /// Default config for the bus-private breaker registry; ignored when a
    /// registry is injected.
    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Shares an application-owned idempotency guard with this bus.
    pub fn with_idempotency_guard(mut self, guard: Arc<IdempotencyGuard>) -> Self {
        self.idempotency = Some(guard);
        self
    }

    /// Config for the bus-private idempotency guard; ignored when a guard is
    /// injected.
    pub fn with_idempotency_config(mut self, config: IdempotencyConfig) -> Self {
        self.idempotency_config = config;
        self
    }

    /// Appends a custom stage innermost, between the breaker and the handler.
    pub fn with_middleware(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.extra.push(stage);
        self
    }

    pub fn build(self) -> CommandBus {
        let breakers = self
            .breakers
            .unwrap_or_else(|| Arc::new(CircuitBreakerRegistry::new(self.breaker_config)));
        let guard = self
            .idempotency
            .unwrap_or_else(|| Arc::new(IdempotencyGuard::new(self.idempotency_config)));

        let mut stack: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(LoggingMiddleware::new()),
            Arc::new(IdempotencyMiddleware::new(guard)),
            Arc::new(ValidationMiddleware::new()),
            Arc::new(RetryMiddleware::new(self.retry)),
            Arc::new(CircuitBreakerMiddleware::new(breakers)),
        ];
        stack.extend(self.extra);

        CommandBus {
            core: Arc::new(BusCore {
                registry: self.registry,
                stack: stack.into(),
            }),
        }
    }
}

impl Default for CommandBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side dispatch entry point.
///
/// Same machinery as the command bus, parameterized by message category;
/// queries are naturally repeatable, so the default chain carries no
/// idempotency stage: Logging -> Validation -> Retry -> CircuitBreaker ->
/// Handler.
#[derive(Clone)]
pub struct QueryBus {
    core: Arc<BusCore>,
}

impl QueryBus {
    pub fn builder() -> QueryBusBuilder {
        QueryBusBuilder::new()
    }

    /// Dispatches `query` through the middleware chain to its handler.
    pub async fn dispatch<Q: Query>(&self, query: Q) -> DispatchResult<Q::Output> {
        let meta = MessageMeta {
            kind: MessageKind::Query,
            name: Q::NAME,
            idempotency_key: None,
            idempotency_ttl: None,
        };
        let output = self
            .core
            .dispatch_erased(TypeId::of::<Q>(), meta, Box::new(QueryEnvelope(query)))
            .await?;
        downcast_output::<Q::Output>(output, Q::NAME)
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.core.registry.len()
    }
}

/// Builder for [`QueryBus`].
pub struct QueryBusBuilder {
    registry: HandlerRegistry,
    retry: RetryPolicy,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    breaker_config: CircuitBreakerConfig,
    extra: Vec<Arc<dyn Middleware>>,
}

impl QueryBusBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            retry: RetryPolicy::default(),
            breakers: None,
            breaker_config: CircuitBreakerConfig::default(),
            extra: Vec::new(),
        }
    }

    /// Registers `handler` for query type `Q`.
    pub fn register<Q, H>(mut self, handler: H) -> DispatchResult<Self>
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        self.registry.insert(
            TypeId::of::<Q>(),
            Q::NAME,
            Arc::new(QueryHandlerAdapter::new(handler)),
        )?;
        Ok(self)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Shares an application-owned breaker registry with this bus.
    pub fn with_circuit_breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(registry);
        self
    }

    /// Default config for the bus-private breaker registry; ignored when a
    /// registry is injected.
    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Appends a custom stage innermost, between the breaker and the handler.
    pub fn with_middleware(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.extra.push(stage);
        self
    }

    pub fn build(self) -> QueryBus {
        let breakers = self
            .breakers
            .unwrap_or_else(|| Arc::new(CircuitBreakerRegistry::new(self.breaker_config)));

        let mut stack: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(LoggingMiddleware::new()),
            Arc::new(ValidationMiddleware::new()),
            Arc::new(RetryMiddleware::new(self.retry)),
            Arc::new(CircuitBreakerMiddleware::new(breakers)),
        ];
        stack.extend(self.extra);

        QueryBus {
            core: Arc::new(BusCore {
                registry: self.registry,
                stack: stack.into(),
            }),
        }
    }
}

impl Default for QueryBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}
