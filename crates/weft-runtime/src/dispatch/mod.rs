//! Handler dispatchers.
//!
//! The [`HandlerDispatcher`] capability is how the engine invokes a
//! facet handler without knowing its implementation. Variants:
//!
//! - [`InMemoryDispatcher`] — a name → callable map, for tests and
//!   lightweight setups.
//! - [`RegistryDispatcher`] — consults persisted handler registrations
//!   and resolves entrypoints against a statically-linked
//!   [`EntrypointTable`] (the substitute for a host-runtime module
//!   loader), memoizing resolutions by `(module_uri, checksum)`.
//! - [`SubprocessDispatcher`] — resolves an external artifact and runs
//!   it out of process (see [`subprocess`]).
//! - [`CompositeDispatcher`] — ordered list, first capable wins.
//!
//! Short-name fallback applies everywhere: the exact qualified name is
//! tried first, then the trailing dot-segment. Exact qualified names
//! always win when both are registered.

pub mod subprocess;

pub use subprocess::{ArtifactCoordinate, SubprocessConfig, SubprocessDispatcher};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::RuntimeError;
use crate::persistence::{HandlerRegistration, WorkflowStore};

/// Dispatcher failure taxonomy. Bubbles to `fail_step`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// No handler is available for the facet.
    #[error("no handler for facet '{0}'")]
    NoHandler(String),

    /// Module / entrypoint resolution failed.
    #[error("load error: {0}")]
    Load(String),

    /// The handler ran and failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// Subprocess timeout or non-zero exit.
    #[error("subprocess error: {0}")]
    Subprocess(String),

    /// Persistence failure while resolving or reading back.
    #[error("store error: {0}")]
    Store(String),
}

impl From<DispatchError> for RuntimeError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::NoHandler(m) => RuntimeError::Load(format!("no handler for '{m}'")),
            DispatchError::Load(m) => RuntimeError::Load(m),
            DispatchError::Handler(m) => RuntimeError::Handler(m),
            DispatchError::Subprocess(m) => RuntimeError::Subprocess(m),
            DispatchError::Store(m) => RuntimeError::Store(m),
        }
    }
}

/// Handler payload and result shape: plain JSON maps.
pub type Payload = Map<String, Value>;

/// A registered handler callable.
pub type HandlerFn =
    Arc<dyn Fn(Payload) -> BoxFuture<'static, Result<Payload, String>> + Send + Sync>;

/// Wrap an async closure into a [`HandlerFn`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, String>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Capability for invoking facet handlers.
#[async_trait]
pub trait HandlerDispatcher: Send + Sync {
    /// Whether a handler is available for the facet.
    async fn can_dispatch(&self, facet_name: &str) -> bool;

    /// Invoke the handler with the step's params and return the result
    /// map that becomes the step's returns.
    async fn dispatch(&self, facet_name: &str, payload: Payload)
        -> Result<Payload, DispatchError>;
}

/// Trailing dot-segment of a qualified name.
fn short_name(facet_name: &str) -> Option<&str> {
    facet_name.rsplit_once('.').map(|(_, short)| short)
}

// =============================================================================
// In-Memory Dispatcher
// =============================================================================

/// Name → callable map.
///
/// # Example
///
/// ```
/// use weft_runtime::dispatch::InMemoryDispatcher;
///
/// let dispatcher = InMemoryDispatcher::new();
/// dispatcher.register("ns.Greet", |payload| async move {
///     let name = payload.get("name").and_then(|v| v.as_str()).unwrap_or("World");
///     let mut result = serde_json::Map::new();
///     result.insert("message".into(), format!("Hello, {name}!").into());
///     Ok(result)
/// });
/// ```
#[derive(Default)]
pub struct InMemoryDispatcher {
    handlers: parking_lot::RwLock<HashMap<String, HandlerFn>>,
}

impl InMemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for a facet name.
    pub fn register<F, Fut>(&self, facet_name: &str, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, String>> + Send + 'static,
    {
        self.handlers
            .write()
            .insert(facet_name.to_string(), handler_fn(handler));
    }

    /// Registered facet names.
    pub fn registered_names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    fn find(&self, facet_name: &str) -> Option<HandlerFn> {
        let handlers = self.handlers.read();
        if let Some(h) = handlers.get(facet_name) {
            return Some(Arc::clone(h));
        }
        short_name(facet_name)
            .and_then(|short| handlers.get(short))
            .map(Arc::clone)
    }
}

#[async_trait]
impl HandlerDispatcher for InMemoryDispatcher {
    async fn can_dispatch(&self, facet_name: &str) -> bool {
        self.find(facet_name).is_some()
    }

    async fn dispatch(
        &self,
        facet_name: &str,
        payload: Payload,
    ) -> Result<Payload, DispatchError> {
        let handler = self
            .find(facet_name)
            .ok_or_else(|| DispatchError::NoHandler(facet_name.to_string()))?;
        handler(payload).await.map_err(DispatchError::Handler)
    }
}

// =============================================================================
// Entrypoint Table
// =============================================================================

/// Statically-linked entrypoints a [`RegistryDispatcher`] can resolve
/// registrations against. The compiled-in analogue of a module loader:
/// a registration's `entrypoint` names an entry here.
#[derive(Default, Clone)]
pub struct EntrypointTable {
    entries: HashMap<String, HandlerFn>,
}

impl EntrypointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(mut self, entrypoint: &str, handler: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, String>> + Send + 'static,
    {
        self.entries
            .insert(entrypoint.to_string(), handler_fn(handler));
        self
    }

    pub fn get(&self, entrypoint: &str) -> Option<HandlerFn> {
        self.entries.get(entrypoint).map(Arc::clone)
    }
}

// =============================================================================
// Registry Dispatcher
// =============================================================================

/// Persistence-backed dispatcher.
///
/// Looks up handler registrations in the store, resolves their
/// entrypoints against the table, and memoizes resolutions by
/// `(module_uri, checksum)` so a re-registration with a new checksum
/// picks up the new binding.
pub struct RegistryDispatcher {
    store: Arc<dyn WorkflowStore>,
    table: EntrypointTable,
    resolved: DashMap<(String, String), HandlerFn>,
}

impl RegistryDispatcher {
    pub fn new(store: Arc<dyn WorkflowStore>, table: EntrypointTable) -> Self {
        Self {
            store,
            table,
            resolved: DashMap::new(),
        }
    }

    /// Number of memoized resolutions (for tests).
    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    async fn find_registration(&self, facet_name: &str) -> Option<HandlerRegistration> {
        match self.store.get_handler_registration(facet_name).await {
            Ok(Some(reg)) => Some(reg),
            Ok(None) => match short_name(facet_name) {
                Some(short) => self
                    .store
                    .get_handler_registration(short)
                    .await
                    .ok()
                    .flatten(),
                None => None,
            },
            Err(_) => None,
        }
    }

    fn resolve(&self, reg: &HandlerRegistration) -> Result<HandlerFn, DispatchError> {
        let key = (reg.module_uri.clone(), reg.checksum.clone());
        if let Some(handler) = self.resolved.get(&key) {
            return Ok(Arc::clone(&handler));
        }

        let handler = self.table.get(&reg.entrypoint).ok_or_else(|| {
            DispatchError::Load(format!(
                "entrypoint '{}' in '{}' is not linked into this worker",
                reg.entrypoint, reg.module_uri
            ))
        })?;

        self.resolved.insert(key, Arc::clone(&handler));
        Ok(handler)
    }
}

#[async_trait]
impl HandlerDispatcher for RegistryDispatcher {
    async fn can_dispatch(&self, facet_name: &str) -> bool {
        self.find_registration(facet_name).await.is_some()
    }

    async fn dispatch(
        &self,
        facet_name: &str,
        payload: Payload,
    ) -> Result<Payload, DispatchError> {
        let reg = self
            .find_registration(facet_name)
            .await
            .ok_or_else(|| DispatchError::NoHandler(facet_name.to_string()))?;
        let handler = self.resolve(&reg)?;

        // Dispatch metadata rides along in the payload.
        let mut payload = payload;
        payload.insert("_facet_name".to_string(), Value::String(facet_name.to_string()));
        if !reg.metadata.is_empty() {
            payload.insert(
                "_handler_metadata".to_string(),
                Value::Object(reg.metadata.clone()),
            );
        }

        debug!(facet = facet_name, module = %reg.module_uri, "dispatching registered handler");
        handler(payload).await.map_err(DispatchError::Handler)
    }
}

// =============================================================================
// Composite Dispatcher
// =============================================================================

/// Chains dispatchers with priority ordering: the first that
/// `can_dispatch` a facet wins.
#[derive(Default)]
pub struct CompositeDispatcher {
    dispatchers: Vec<Arc<dyn HandlerDispatcher>>,
}

impl CompositeDispatcher {
    pub fn new(dispatchers: Vec<Arc<dyn HandlerDispatcher>>) -> Self {
        Self { dispatchers }
    }

    pub fn push(&mut self, dispatcher: Arc<dyn HandlerDispatcher>) {
        self.dispatchers.push(dispatcher);
    }
}

#[async_trait]
impl HandlerDispatcher for CompositeDispatcher {
    async fn can_dispatch(&self, facet_name: &str) -> bool {
        for d in &self.dispatchers {
            if d.can_dispatch(facet_name).await {
                return true;
            }
        }
        false
    }

    async fn dispatch(
        &self,
        facet_name: &str,
        payload: Payload,
    ) -> Result<Payload, DispatchError> {
        for d in &self.dispatchers {
            if d.can_dispatch(facet_name).await {
                return d.dispatch(facet_name, payload).await;
            }
        }
        Err(DispatchError::NoHandler(facet_name.to_string()))
    }
}
