//! Workflow definitions and the registry the engine resolves them from.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;

use super::context::WorkflowContext;
use super::error::FlowError;
use crate::repository::workflow::WorkflowStore;

/// Boxed workflow handler: `(context, input) -> result`.
pub type WorkflowHandler<S> =
    Arc<dyn Fn(WorkflowContext<S>, Value) -> BoxFuture<'static, Result<Value, FlowError>> + Send + Sync>;

/// Payload check run when a signal is delivered, before it is stored.
pub type SignalValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// A versioned workflow handler.
///
/// `event_schemas` validate signal payloads per event name at delivery
/// time; a rejected signal is never persisted.
pub struct WorkflowDefinition<S: WorkflowStore> {
    pub id: String,
    pub version: String,
    handler: WorkflowHandler<S>,
    event_schemas: HashMap<String, SignalValidator>,
}

impl<S: WorkflowStore + 'static> WorkflowDefinition<S> {
    pub fn new<F, Fut>(id: &str, version: &str, handler: F) -> Self
    where
        F: Fn(WorkflowContext<S>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FlowError>> + Send + 'static,
    {
        Self {
            id: id.to_string(),
            version: version.to_string(),
            handler: Arc::new(move |ctx, input| Box::pin(handler(ctx, input))),
            event_schemas: HashMap::new(),
        }
    }

    /// Attach a payload validator for signals named `event_name`.
    pub fn with_event_schema<F>(mut self, event_name: &str, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.event_schemas
            .insert(event_name.to_string(), Arc::new(validator));
        self
    }

    pub(crate) fn invoke(
        &self,
        ctx: WorkflowContext<S>,
        input: Value,
    ) -> BoxFuture<'static, Result<Value, FlowError>> {
        (self.handler)(ctx, input)
    }

    /// Validate a signal payload against the schema declared for its event.
    ///
    /// Events without a declared schema accept any payload.
    pub fn validate_signal(&self, event_name: &str, payload: &Value) -> Result<(), String> {
        match self.event_schemas.get(event_name) {
            Some(validator) => validator(payload),
            None => Ok(()),
        }
    }
}

impl<S: WorkflowStore> std::fmt::Debug for WorkflowDefinition<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("event_schemas", &self.event_schemas.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkflowRegistry
// ---------------------------------------------------------------------------

/// Registered workflow definitions keyed by workflow ID.
///
/// Explicit process state: cloned handles share the same table, and
/// `clear()` empties it.
pub struct WorkflowRegistry<S: WorkflowStore> {
    definitions: Arc<DashMap<String, Arc<WorkflowDefinition<S>>>>,
}

impl<S: WorkflowStore> Clone for WorkflowRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            definitions: Arc::clone(&self.definitions),
        }
    }
}

impl<S: WorkflowStore> Default for WorkflowRegistry<S> {
    fn default() -> Self {
        Self {
            definitions: Arc::new(DashMap::new()),
        }
    }
}

impl<S: WorkflowStore> WorkflowRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a definition.
    pub fn register(&self, definition: WorkflowDefinition<S>) {
        tracing::debug!(
            workflow_id = %definition.id,
            version = %definition.version,
            "registered workflow"
        );
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition<S>>> {
        self.definitions.get(workflow_id).map(|d| Arc::clone(&d))
    }

    /// `(id, version)` pairs sorted by ID.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .definitions
            .iter()
            .map(|d| (d.id.clone(), d.version.clone()))
            .collect();
        list.sort();
        list
    }

    pub fn clear(&self) {
        self.definitions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use serde_json::json;

    fn noop() -> WorkflowDefinition<MemoryStore> {
        WorkflowDefinition::new("noop", "1", |_ctx, input| async move { Ok(input) })
    }

    #[test]
    fn registry_register_get_clear() {
        let registry = WorkflowRegistry::new();
        registry.register(noop());
        let shared = registry.clone();

        assert_eq!(shared.get("noop").unwrap().version, "1");
        assert_eq!(shared.list(), vec![("noop".to_string(), "1".to_string())]);
        assert!(shared.get("missing").is_none());

        registry.clear();
        assert!(shared.get("noop").is_none());
    }

    #[test]
    fn signal_validation_uses_declared_schema() {
        let def = noop().with_event_schema("approve", |payload| {
            if payload.get("approved").is_some_and(Value::is_boolean) {
                Ok(())
            } else {
                Err("'approved' must be a boolean".to_string())
            }
        });

        assert!(def.validate_signal("approve", &json!({"approved": true})).is_ok());
        assert!(def.validate_signal("approve", &json!({"approved": "yes"})).is_err());
        assert!(def.validate_signal("other", &json!(null)).is_ok());
    }
}
