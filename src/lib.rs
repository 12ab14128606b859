//! Resilient command/query dispatch core.
//!
//! Every write (command) and read (query) flows through a bus that resolves
//! the registered handler and wraps it in a middleware chain composed at
//! startup: idempotency, validation, retry with exponential backoff, and a
//! named circuit breaker. Expected failures travel as [`DispatchError`]
//! values; `dispatch` never lets a handler fault unwind past it.
//!
//! ```ignore
//! let bus = CommandBus::builder()
//!     .register::<CreateJob, _>(CreateJobHandler::new(repo))?
//!     .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(100)))
//!     .build();
//!
//! let job_id = bus.dispatch(CreateJob { spec }).await?;
//! ```

pub mod bus;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod handler;
pub mod idempotency;
pub mod message;
pub mod middleware;
pub mod retry;

mod registry;

#[cfg(test)]
mod tests;

pub use bus::{CommandBus, CommandBusBuilder, QueryBus, QueryBusBuilder};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMiddleware,
    CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{DispatchError, DispatchResult, ErrorKind, ValidationError};
pub use handler::{CommandHandler, QueryHandler};
pub use idempotency::{
    Admission, IdempotencyConfig, IdempotencyGuard, IdempotencyMiddleware, IdempotencyStats,
    InFlightPolicy, InFlightWaiter,
};
pub use message::{
    AnyMessage, AnyOutput, BoxedMessage, BoxedOutput, Command, MessageKind, MessageMeta, Query,
};
pub use middleware::{LoggingMiddleware, Middleware, Next, StageResult, ValidationMiddleware};
pub use retry::{RetryMiddleware, RetryPolicy};
