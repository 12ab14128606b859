// Message Model
//
// Command and Query traits plus the type-erased envelopes that carry them
// through the middleware chain.

use std::any::Any;
use std::borrow::Cow;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::{DispatchError, ValidationError};

/// Message category flowing through a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command,
    Query,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Query => "query",
        }
    }
}

/// A write intent dispatched through the command bus.
///
/// Commands must be `Clone` so the retry stage can re-issue them, and their
/// output must be `Clone` so an idempotent replay can hand the stored result
/// to every caller presenting the same key.
pub trait Command: Debug + Clone + Send + Sync + 'static {
    /// Stable type identifier used for routing, breaker naming and logs.
    const NAME: &'static str;

    /// Value produced by the handler.
    type Output: Clone + Send + Sync + 'static;

    /// Key ensuring at-most-one effective execution. `None` opts this
    /// command out of the idempotency stage.
    fn idempotency_key(&self) -> Option<Cow<'_, str>> {
        None
    }

    /// Per-command override of the guard's default record TTL.
    fn idempotency_ttl(&self) -> Option<Duration> {
        None
    }

    /// Structural validation, run by the validation stage before any side
    /// effect, retry budget or breaker accounting is touched.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// A read-only request dispatched through the query bus.
pub trait Query: Debug + Clone + Send + Sync + 'static {
    /// Stable type identifier used for routing, breaker naming and logs.
    const NAME: &'static str;

    /// Value produced by the handler.
    type Output: Clone + Send + Sync + 'static;

    /// Structural validation, run before the query reaches its handler.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Dispatch-time descriptor shared with every middleware stage.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub kind: MessageKind,
    /// Stable message type identifier.
    pub name: &'static str,
    /// Idempotency key carried by the message, if any.
    pub idempotency_key: Option<String>,
    /// Per-message TTL override for the idempotency record.
    pub idempotency_ttl: Option<Duration>,
}

/// Type-erased message moving through the middleware chain.
pub trait AnyMessage: Send + 'static {
    /// Clones the payload; the retry stage re-issues attempts from this.
    fn clone_boxed(&self) -> BoxedMessage;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    /// Runs the payload's validation hook.
    fn validate(&self) -> Result<(), DispatchError>;
}

/// Boxed erased message.
pub type BoxedMessage = Box<dyn AnyMessage>;

/// Type-erased handler output.
pub trait AnyOutput: Send + Sync + 'static {
    /// Clones the value; idempotent replays hand each caller its own copy.
    fn clone_boxed(&self) -> BoxedOutput;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Boxed erased output.
pub type BoxedOutput = Box<dyn AnyOutput>;

impl<T: Clone + Send + Sync + 'static> AnyOutput for T {
    fn clone_boxed(&self) -> BoxedOutput {
        Box::new(self.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

pub(crate) struct CommandEnvelope<C: Command>(pub(crate) C);

impl<C: Command> AnyMessage for CommandEnvelope<C> {
    fn clone_boxed(&self) -> BoxedMessage {
        Box::new(CommandEnvelope(self.0.clone()))
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn validate(&self) -> Result<(), DispatchError> {
        self.0.validate().map_err(|err| DispatchError::Validation {
            message_type: C::NAME,
            reason: err.reason,
        })
    }
}

pub(crate) struct QueryEnvelope<Q: Query>(pub(crate) Q);

impl<Q: Query> AnyMessage for QueryEnvelope<Q> {
    fn clone_boxed(&self) -> BoxedMessage {
        Box::new(QueryEnvelope(self.0.clone()))
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn validate(&self) -> Result<(), DispatchError> {
        self.0.validate().map_err(|err| DispatchError::Validation {
            message_type: Q::NAME,
            reason: err.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Ping;

    impl Command for Ping {
        const NAME: &'static str = "Ping";
        type Output = ();
    }

    #[test]
    fn command_defaults_carry_no_key() {
        let cmd = Ping;
        assert!(cmd.idempotency_key().is_none());
        assert!(cmd.idempotency_ttl().is_none());
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn envelope_clone_preserves_payload() {
        #[derive(Debug, Clone)]
        struct Keyed(String);

        impl Command for Keyed {
            const NAME: &'static str = "Keyed";
            type Output = ();

            fn idempotency_key(&self) -> Option<Cow<'_, str>> {
                Some(Cow::Borrowed(&self.0))
            }
        }

        let envelope = CommandEnvelope(Keyed("abc".to_string()));
        let cloned = envelope.clone_boxed();
        let payload = cloned
            .into_any()
            .downcast::<CommandEnvelope<Keyed>>()
            .expect("payload type");
        assert_eq!(payload.0 .0, "abc");
    }
}
