// Dispatch Core Tests
//
// Crate-level tests for bus wiring: registration, resolution, validation
// short-circuiting, panic isolation and custom stages. The longer resilience
// scenarios live in tests/bus_it.rs.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    BoxedMessage, Command, CommandBus, CommandHandler, DispatchError, DispatchResult, Middleware,
    Next, Query, QueryBus, QueryHandler, StageResult, ValidationError,
};

// === Test Commands ===

#[derive(Debug, Clone)]
struct CreateNote {
    body: String,
}

impl Command for CreateNote {
    const NAME: &'static str = "CreateNote";
    type Output = String;

    fn idempotency_key(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(&self.body))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.body.is_empty() {
            return Err(ValidationError::new("body must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct UnboundCommand;

impl Command for UnboundCommand {
    const NAME: &'static str = "UnboundCommand";
    type Output = ();
}

#[derive(Debug, Clone)]
struct CrashingCommand;

impl Command for CrashingCommand {
    const NAME: &'static str = "CrashingCommand";
    type Output = ();
}

// === Test Handlers ===

struct CreateNoteHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl CommandHandler<CreateNote> for CreateNoteHandler {
    async fn handle(&self, command: CreateNote) -> DispatchResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("note: {}", command.body))
    }
}

struct CrashingHandler;

#[async_trait]
impl CommandHandler<CrashingCommand> for CrashingHandler {
    async fn handle(&self, _command: CrashingCommand) -> DispatchResult<()> {
        panic!("handler blew up");
    }
}

// === Tests ===

#[tokio::test]
async fn dispatch_resolves_registered_handler() {
    let calls = Arc::new(AtomicU32::new(0));
    let bus = CommandBus::builder()
        .register::<CreateNote, _>(CreateNoteHandler {
            calls: calls.clone(),
        })
        .expect("register")
        .build();

    let result = bus
        .dispatch(CreateNote {
            body: "hello".to_string(),
        })
        .await;

    assert_eq!(result.expect("dispatch"), "note: hello");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.handler_count(), 1);
}

#[tokio::test]
async fn dispatch_without_handler_fails_terminally() {
    let bus = CommandBus::builder().build();

    let result = bus.dispatch(UnboundCommand).await;
    assert!(matches!(
        result,
        Err(DispatchError::UnregisteredHandler {
            message_type: "UnboundCommand"
        })
    ));
}

#[tokio::test]
async fn duplicate_registration_fails_at_setup() {
    let builder = CommandBus::builder()
        .register::<CreateNote, _>(CreateNoteHandler {
            calls: Arc::new(AtomicU32::new(0)),
        })
        .expect("first registration");

    let result = builder.register::<CreateNote, _>(CreateNoteHandler {
        calls: Arc::new(AtomicU32::new(0)),
    });
    assert!(matches!(
        result,
        Err(DispatchError::DuplicateHandler {
            message_type: "CreateNote"
        })
    ));
}

#[tokio::test]
async fn validation_rejects_before_handler_runs() {
    let calls = Arc::new(AtomicU32::new(0));
    let bus = CommandBus::builder()
        .register::<CreateNote, _>(CreateNoteHandler {
            calls: calls.clone(),
        })
        .expect("register")
        .build();

    let result = bus
        .dispatch(CreateNote {
            body: String::new(),
        })
        .await;

    assert!(matches!(result, Err(DispatchError::Validation { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn panicking_handler_surfaces_as_fatal() {
    let bus = CommandBus::builder()
        .register::<CrashingCommand, _>(CrashingHandler)
        .expect("register")
        .build();

    let result = bus.dispatch(CrashingCommand).await;
    match result {
        Err(DispatchError::Fatal { reason }) => assert!(reason.contains("handler blew up")),
        other => panic!("expected Fatal, got {other:?}"),
    }
}

#[tokio::test]
async fn query_bus_dispatches_reads() {
    #[derive(Debug, Clone)]
    struct NoteCount;

    impl Query for NoteCount {
        const NAME: &'static str = "NoteCount";
        type Output = usize;
    }

    struct NoteCountHandler;

    #[async_trait]
    impl QueryHandler<NoteCount> for NoteCountHandler {
        async fn handle(&self, _query: NoteCount) -> DispatchResult<usize> {
            Ok(42)
        }
    }

    let bus = QueryBus::builder()
        .register::<NoteCount, _>(NoteCountHandler)
        .expect("register")
        .build();

    assert_eq!(bus.dispatch(NoteCount).await.expect("dispatch"), 42);
}

#[tokio::test]
async fn query_validation_short_circuits() {
    #[derive(Debug, Clone)]
    struct BadQuery;

    impl Query for BadQuery {
        const NAME: &'static str = "BadQuery";
        type Output = ();

        fn validate(&self) -> Result<(), ValidationError> {
            Err(ValidationError::new("limit out of range"))
        }
    }

    struct BadQueryHandler;

    #[async_trait]
    impl QueryHandler<BadQuery> for BadQueryHandler {
        async fn handle(&self, _query: BadQuery) -> DispatchResult<()> {
            panic!("must not run");
        }
    }

    let bus = QueryBus::builder()
        .register::<BadQuery, _>(BadQueryHandler)
        .expect("register")
        .build();

    let result = bus.dispatch(BadQuery).await;
    match result {
        Err(DispatchError::Validation {
            message_type,
            reason,
        }) => {
            assert_eq!(message_type, "BadQuery");
            assert!(reason.contains("limit"));
        }
        other => panic!("expected Validation, got {other:?}"),
    }
}

#[tokio::test]
async fn custom_middleware_runs_innermost() {
    struct CountingStage {
        passes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Middleware for CountingStage {
        async fn handle(&self, message: BoxedMessage, next: Next) -> StageResult {
            self.passes.fetch_add(1, Ordering::SeqCst);
            next.run(message).await
        }
    }

    let passes = Arc::new(AtomicU32::new(0));
    let calls = Arc::new(AtomicU32::new(0));
    let bus = CommandBus::builder()
        .register::<CreateNote, _>(CreateNoteHandler {
            calls: calls.clone(),
        })
        .expect("register")
        .with_middleware(Arc::new(CountingStage {
            passes: passes.clone(),
        }))
        .build();

    bus.dispatch(CreateNote {
        body: "x".to_string(),
    })
    .await
    .expect("dispatch");

    assert_eq!(passes.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
