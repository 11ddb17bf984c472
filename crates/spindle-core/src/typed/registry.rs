//! HandlerRegistry - task type name -> handler.
//!
//! Built mutably during start-up, then frozen behind an `Arc` when the
//! engine is built. There is no registration API on a running engine, so
//! register-before-submit holds by construction.

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{Handler, TaskHandler, TypedHandler};
use super::task::Task;
use crate::domain::TaskType;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task type '{0}' is already registered")]
    AlreadyRegistered(TaskType),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Register a typed handler under `T::TYPE`.
    pub fn register_typed<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register(T::TYPE, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn resolve(&self, name: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &TaskType) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
