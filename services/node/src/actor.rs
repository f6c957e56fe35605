//! Actor descriptors and the handler capability interface.
//!
//! Actors are a closed set behind a common `handle(message) -> result`
//! interface, registered in a name-keyed map built once at startup.
//! Built-in and user actors use the same descriptor; there is no special
//! code path for either.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use hornet_wire::{actor_module, ActorMessage};

/// Errors returned by actor handlers, classified for the executor's
/// retry state machine.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient failure; consumes retry budget and is re-enqueued.
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// Permanent failure; the message is marked done-as-failed.
    #[error("terminal failure: {0}")]
    Terminal(String),

    /// Unclassified failure; treated as retryable.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    /// Whether the executor should stop retrying.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandlerError::Terminal(_))
    }
}

/// A unit of behavior processing messages addressed to its name.
///
/// Handlers are invoked concurrently by the executor workers; any state
/// they share must be synchronized internally.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process one message. `Ok(Some(value))` becomes the reply payload for
    /// ask messages and is ignored for fire-and-forget.
    async fn handle(&self, msg: &ActorMessage) -> Result<Option<Value>, HandlerError>;
}

/// Errors when building the actor set.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("duplicate actor name '{0}'")]
    DuplicateName(String),

    #[error("actor name '{0}' must be of the form 'module.name'")]
    InvalidName(String),

    #[error("invalid {kind} schema for actor '{name}': {detail}")]
    InvalidSchema {
        name: String,
        kind: &'static str,
        detail: String,
    },
}

/// Uniform description of one actor: name, handler, optional timer, and
/// optional payload schemas compiled at registration.
pub struct ActorDescriptor {
    name: String,
    handler: Arc<dyn Handler>,
    timer_interval: Option<Duration>,
    input_schema: Option<jsonschema::Validator>,
    output_schema: Option<jsonschema::Validator>,
}

impl ActorDescriptor {
    pub fn new(name: impl Into<String>, handler: impl Handler) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            timer_interval: None,
            input_schema: None,
            output_schema: None,
        }
    }

    /// Re-enqueue a self-addressed message on this interval, independent of
    /// external traffic.
    #[must_use]
    pub fn with_timer(mut self, interval: Duration) -> Self {
        self.timer_interval = Some(interval);
        self
    }

    /// Compile and attach an input schema; content is validated against it
    /// before dispatch.
    pub fn with_input_schema(mut self, schema: &Value) -> Result<Self, ActorError> {
        self.input_schema = Some(compile_schema(&self.name, "input", schema)?);
        Ok(self)
    }

    /// Compile and attach an output schema; reply payloads are validated
    /// against it after handling.
    pub fn with_output_schema(mut self, schema: &Value) -> Result<Self, ActorError> {
        self.output_schema = Some(compile_schema(&self.name, "output", schema)?);
        Ok(self)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn module(&self) -> &str {
        actor_module(&self.name)
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    #[must_use]
    pub fn timer_interval(&self) -> Option<Duration> {
        self.timer_interval
    }

    #[must_use]
    pub fn input_schema(&self) -> Option<&jsonschema::Validator> {
        self.input_schema.as_ref()
    }

    #[must_use]
    pub fn output_schema(&self) -> Option<&jsonschema::Validator> {
        self.output_schema.as_ref()
    }
}

impl std::fmt::Debug for ActorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorDescriptor")
            .field("name", &self.name)
            .field("timer_interval", &self.timer_interval)
            .finish_non_exhaustive()
    }
}

fn compile_schema(
    name: &str,
    kind: &'static str,
    schema: &Value,
) -> Result<jsonschema::Validator, ActorError> {
    jsonschema::validator_for(schema).map_err(|e| ActorError::InvalidSchema {
        name: name.to_string(),
        kind,
        detail: e.to_string(),
    })
}

/// The node's closed set of actors, keyed by name, built once at startup.
#[derive(Debug)]
pub struct ActorSet {
    actors: HashMap<String, Arc<ActorDescriptor>>,
}

impl ActorSet {
    pub fn new(descriptors: Vec<ActorDescriptor>) -> Result<Self, ActorError> {
        let mut actors = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let name = descriptor.name().to_string();
            if !name.contains('.') || name.starts_with('.') || name.ends_with('.') {
                return Err(ActorError::InvalidName(name));
            }
            if actors.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(ActorError::DuplicateName(name));
            }
        }
        Ok(Self { actors })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<ActorDescriptor>> {
        self.actors.get(name)
    }

    /// The set of modules these actors span, advertised in the node spec.
    #[must_use]
    pub fn modules(&self) -> BTreeSet<String> {
        self.actors
            .values()
            .map(|a| a.module().to_string())
            .collect()
    }

    /// Actors declaring a periodic timer.
    #[must_use]
    pub fn timer_actors(&self) -> Vec<Arc<ActorDescriptor>> {
        let mut timers: Vec<_> = self
            .actors
            .values()
            .filter(|a| a.timer_interval().is_some())
            .cloned()
            .collect();
        timers.sort_by(|a, b| a.name().cmp(b.name()));
        timers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    struct NoopActor;

    #[async_trait]
    impl Handler for NoopActor {
        async fn handle(&self, _msg: &ActorMessage) -> Result<Option<Value>, HandlerError> {
            Ok(None)
        }
    }

    #[test]
    fn test_actor_set_modules() {
        let set = ActorSet::new(vec![
            ActorDescriptor::new("feed.sync", NoopActor),
            ActorDescriptor::new("feed.clean", NoopActor),
            ActorDescriptor::new("mail.send", NoopActor),
        ])
        .unwrap();

        let modules = set.modules();
        assert_eq!(modules.len(), 2);
        assert!(modules.contains("feed"));
        assert!(modules.contains("mail"));
    }

    #[test]
    fn test_actor_set_rejects_duplicates() {
        let err = ActorSet::new(vec![
            ActorDescriptor::new("feed.sync", NoopActor),
            ActorDescriptor::new("feed.sync", NoopActor),
        ])
        .unwrap_err();
        assert!(matches!(err, ActorError::DuplicateName(_)));
    }

    #[rstest]
    #[case("nomodule")]
    #[case(".sync")]
    #[case("feed.")]
    fn test_actor_set_rejects_bad_names(#[case] name: &str) {
        let err = ActorSet::new(vec![ActorDescriptor::new(name, NoopActor)]).unwrap_err();
        assert!(matches!(err, ActorError::InvalidName(_)));
    }

    #[test]
    fn test_input_schema_validation() {
        let descriptor = ActorDescriptor::new("feed.sync", NoopActor)
            .with_input_schema(&json!({
                "type": "object",
                "required": ["feed_id"],
                "properties": {"feed_id": {"type": "integer"}}
            }))
            .unwrap();

        let schema = descriptor.input_schema().unwrap();
        assert!(schema.is_valid(&json!({"feed_id": 42})));
        assert!(!schema.is_valid(&json!({"feed_id": "nope"})));
        assert!(!schema.is_valid(&json!({})));
    }

    #[test]
    fn test_invalid_schema_rejected_at_registration() {
        let err = ActorDescriptor::new("feed.sync", NoopActor)
            .with_input_schema(&json!({"type": "not-a-type"}))
            .unwrap_err();
        assert!(matches!(err, ActorError::InvalidSchema { kind: "input", .. }));
    }

    #[test]
    fn test_timer_actors_sorted() {
        let set = ActorSet::new(vec![
            ActorDescriptor::new("b.tick", NoopActor).with_timer(Duration::from_secs(1)),
            ActorDescriptor::new("a.tick", NoopActor).with_timer(Duration::from_secs(2)),
            ActorDescriptor::new("c.plain", NoopActor),
        ])
        .unwrap();

        let timers = set.timer_actors();
        let names: Vec<_> = timers.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["a.tick", "b.tick"]);
    }
}
