//! ID handler registry: pluggable primary key generation keyed by name.
//!
//! Entities declared with a custom handler register it under `entity_<name>`
//! at construction time, so building such an entity is not pure with respect
//! to the registry it is given.

use crate::error::ConfigError;
use async_trait::async_trait;
use futures::FutureExt;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Generates primary key values for an entity.
#[async_trait]
pub trait IdHandler: Send + Sync {
    /// Produce a key for a row of `entity`. `data` is the row about to be inserted.
    async fn generate(&self, entity: &str, data: Option<&Value>) -> Result<Value, HandlerError>;

    /// Check a handler config document before registration.
    fn validate_config(&self, _config: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// Adapter for synchronous closures.
pub struct FnIdHandler<F>(F);

#[async_trait]
impl<F> IdHandler for FnIdHandler<F>
where
    F: Fn(&str, Option<&Value>) -> Result<Value, HandlerError> + Send + Sync,
{
    async fn generate(&self, entity: &str, data: Option<&Value>) -> Result<Value, HandlerError> {
        (self.0)(entity, data)
    }
}

/// Wrap a closure as a shareable handler.
pub fn id_handler_fn<F>(f: F) -> Arc<dyn IdHandler>
where
    F: Fn(&str, Option<&Value>) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnIdHandler(f))
}

/// Result of running a handler. Failures are values, not errors, so one bad
/// row in a batch stays attributable to that row.
#[derive(Clone, Debug, PartialEq)]
pub enum IdOutcome {
    Generated(Value),
    Failed(String),
}

impl IdOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, IdOutcome::Generated(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            IdOutcome::Generated(v) => Some(v),
            IdOutcome::Failed(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self {
            IdOutcome::Generated(v) => Ok(v),
            IdOutcome::Failed(e) => Err(e),
        }
    }
}

impl Serialize for IdOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("IdOutcome", 2)?;
        match self {
            IdOutcome::Generated(v) => {
                s.serialize_field("success", &true)?;
                s.serialize_field("value", v)?;
            }
            IdOutcome::Failed(e) => {
                s.serialize_field("success", &false)?;
                s.serialize_field("error", e)?;
            }
        }
        s.end()
    }
}

/// Shared handle to the handler table. Clones see the same registrations.
#[derive(Clone, Default)]
pub struct IdHandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn IdHandler>>>>,
}

impl fmt::Debug for IdHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdHandlerRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl IdHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn IdHandler>>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn IdHandler>>> {
        self.handlers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `handler` under `key`. Re-registering the same handler is a no-op.
    pub fn register(&self, key: &str, handler: Arc<dyn IdHandler>) -> Result<(), ConfigError> {
        let mut map = self.write();
        if let Some(existing) = map.get(key) {
            if Arc::ptr_eq(existing, &handler) {
                return Ok(());
            }
            return Err(ConfigError::HandlerConflict(key.to_string()));
        }
        tracing::debug!(key = %key, "id handler registered");
        map.insert(key.to_string(), handler);
        Ok(())
    }

    /// Like [`register`](Self::register), running the handler's config check first.
    pub fn register_with_config(
        &self,
        key: &str,
        handler: Arc<dyn IdHandler>,
        config: Option<&Value>,
    ) -> Result<(), ConfigError> {
        if let Some(cfg) = config {
            handler
                .validate_config(cfg)
                .map_err(|message| ConfigError::HandlerConfig {
                    key: key.to_string(),
                    message,
                })?;
        }
        self.register(key, handler)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Run the handler for `key`. Never fails: errors come back as [`IdOutcome::Failed`].
    pub async fn execute(&self, key: &str, entity: &str, data: Option<&Value>) -> IdOutcome {
        let handler = self.read().get(key).cloned();
        let Some(handler) = handler else {
            return IdOutcome::Failed(format!("no id handler registered for '{}'", key));
        };
        match AssertUnwindSafe(handler.generate(entity, data)).catch_unwind().await {
            Ok(Ok(Value::Null)) => IdOutcome::Failed(format!("id handler '{}' returned null", key)),
            Ok(Ok(v)) => IdOutcome::Generated(v),
            Ok(Err(e)) => {
                tracing::warn!(key = %key, entity = %entity, error = %e, "id generation failed");
                IdOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(key = %key, entity = %entity, panic = %message, "id handler panicked");
                IdOutcome::Failed(format!("id handler '{}' panicked: {}", key, message))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(v: &'static str) -> Arc<dyn IdHandler> {
        id_handler_fn(move |_, _| Ok(Value::String(v.to_string())))
    }

    #[test]
    fn register_same_handler_twice_is_noop() {
        let registry = IdHandlerRegistry::new();
        let h = constant("a");
        registry.register("k", h.clone()).unwrap();
        registry.register("k", h).unwrap();
        assert_eq!(registry.keys(), vec!["k".to_string()]);
    }

    #[test]
    fn register_different_handler_fails() {
        let registry = IdHandlerRegistry::new();
        registry.register("k", constant("a")).unwrap();
        let err = registry.register("k", constant("b")).unwrap_err();
        assert_eq!(err, ConfigError::HandlerConflict("k".into()));
    }

    #[test]
    fn clones_share_state_and_clear_empties() {
        let registry = IdHandlerRegistry::new();
        let other = registry.clone();
        registry.register("k", constant("a")).unwrap();
        assert!(other.contains("k"));
        other.clear();
        assert!(!registry.contains("k"));
    }

    #[tokio::test]
    async fn execute_captures_failures() {
        let registry = IdHandlerRegistry::new();
        registry
            .register("boom", id_handler_fn(|_, _| Err("sequence exhausted".into())))
            .unwrap();
        let out = registry.execute("boom", "users", None).await;
        assert_eq!(out, IdOutcome::Failed("sequence exhausted".into()));
        let missing = registry.execute("nope", "users", None).await;
        assert!(!missing.is_success());
    }

    #[tokio::test]
    async fn execute_captures_panics() {
        let registry = IdHandlerRegistry::new();
        registry
            .register("panics", id_handler_fn(|_, _| panic!("counter poisoned")))
            .unwrap();
        match registry.execute("panics", "users", None).await {
            IdOutcome::Failed(message) => assert!(message.contains("counter poisoned"), "{}", message),
            other => panic!("expected failure, got {:?}", other),
        }
        // the registry stays usable afterwards
        registry.register("ok", constant("a")).unwrap();
        assert!(registry.execute("ok", "users", None).await.is_success());
    }

    #[tokio::test]
    async fn execute_passes_entity_and_data() {
        let registry = IdHandlerRegistry::new();
        registry
            .register(
                "prefixed",
                id_handler_fn(|entity, data| {
                    let name = data
                        .and_then(|d| d.get("username"))
                        .and_then(Value::as_str)
                        .unwrap_or("anon");
                    Ok(Value::String(format!("{}-{}", entity, name)))
                }),
            )
            .unwrap();
        let out = registry
            .execute("prefixed", "users", Some(&json!({"username": "ada"})))
            .await;
        assert_eq!(out.value(), Some(&json!("users-ada")));
    }

    #[test]
    fn outcome_serializes_success_flag() {
        assert_eq!(
            serde_json::to_value(IdOutcome::Generated(json!(7))).unwrap(),
            json!({"success": true, "value": 7})
        );
        assert_eq!(
            serde_json::to_value(IdOutcome::Failed("x".into())).unwrap(),
            json!({"success": false, "error": "x"})
        );
    }

    struct Strict;

    #[async_trait]
    impl IdHandler for Strict {
        async fn generate(&self, _: &str, _: Option<&Value>) -> Result<Value, HandlerError> {
            Ok(json!("strict"))
        }

        fn validate_config(&self, config: &Value) -> Result<(), String> {
            if config.get("prefix").is_some() {
                Ok(())
            } else {
                Err("prefix required".into())
            }
        }
    }

    #[test]
    fn config_is_checked_before_registration() {
        let registry = IdHandlerRegistry::new();
        let err = registry
            .register_with_config("s", Arc::new(Strict), Some(&json!({})))
            .unwrap_err();
        assert!(matches!(err, ConfigError::HandlerConfig { .. }));
        assert!(!registry.contains("s"));
        registry
            .register_with_config("s", Arc::new(Strict), Some(&json!({"prefix": "u"})))
            .unwrap();
        assert!(registry.contains("s"));
    }
}
