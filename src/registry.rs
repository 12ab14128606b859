// Handler Registry - TypeId-keyed handler storage
//
// Populated only while the owning bus is being built; immutable and
// concurrently readable afterwards. Duplicate registration is a
// configuration fault surfaced at register time, not at dispatch.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DispatchError;
use crate::handler::ErasedHandler;

/// Storage for handlers keyed by message `TypeId`.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: HashMap<TypeId, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub(crate) fn insert(
        &mut self,
        type_id: TypeId,
        name: &'static str,
        handler: Arc<dyn ErasedHandler>,
    ) -> Result<(), DispatchError> {
        if self.handlers.contains_key(&type_id) {
            return Err(DispatchError::DuplicateHandler { message_type: name });
        }
        self.handlers.insert(type_id, handler);
        Ok(())
    }

    pub(crate) fn get(&self, type_id: &TypeId) -> Option<&Arc<dyn ErasedHandler>> {
        self.handlers.get(type_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::message::{BoxedMessage, BoxedOutput};

    struct NoopHandler;

    #[async_trait]
    impl ErasedHandler for NoopHandler {
        async fn call(&self, _message: BoxedMessage) -> Result<BoxedOutput, DispatchError> {
            Ok(Box::new(()))
        }
    }

    struct Marker;

    #[test]
    fn registers_and_resolves() {
        let mut registry = HandlerRegistry::new();
        registry
            .insert(TypeId::of::<Marker>(), "Marker", Arc::new(NoopHandler))
            .expect("first registration");

        assert!(registry.get(&TypeId::of::<Marker>()).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let mut registry = HandlerRegistry::new();
        registry
            .insert(TypeId::of::<Marker>(), "Marker", Arc::new(NoopHandler))
            .expect("first registration");

        let result = registry.insert(TypeId::of::<Marker>(), "Marker", Arc::new(NoopHandler));
        assert!(matches!(
            result,
            Err(DispatchError::DuplicateHandler {
                message_type: "Marker"
            })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_type_resolves_to_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.get(&TypeId::of::<Marker>()).is_none());
    }
}
