//! The per-request context handed to every handler.
//!
//! ```text
//! ProcessedContext
//! ├── request   ProcessedRequest   method, path, params, headers, cookies, body, query
//! ├── response  ResponseBuilder
//! ├── app       AppContext         user data + plugin providers
//! └── plugins   Plugins            the registry this request was built from
//! ```
//!
//! The user data inside [`AppContext`] is a shared handle ([`ContextData`]):
//! plugin proxies see later writes made by the handler during the same
//! request. A fresh handle is created for every request; nothing is cached.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::error::BoxError;
use crate::plugin::{BoundProxy, JobsProxy, LogProvider, Plugins, StoreAdapter, TelemetryProvider};
use crate::request::ProcessedRequest;
use crate::response::ResponseBuilder;

// ── Context specifier ─────────────────────────────────────────────────────────

/// Produces the user part of the application context, once per request.
///
/// Implemented for any `Fn() -> impl Future<Output = Result<Value, BoxError>>`.
/// The result must be a JSON object; anything else is replaced by `{}`.
#[async_trait]
pub trait ContextFactory: Send + Sync + 'static {
    async fn create(&self) -> Result<Value, BoxError>;
}

#[async_trait]
impl<F, Fut> ContextFactory for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    async fn create(&self) -> Result<Value, BoxError> {
        (self)().await
    }
}

/// How an application describes its per-request context.
#[derive(Clone, Default)]
pub enum ContextSpec {
    /// No user context: `{}`.
    #[default]
    Absent,
    /// The same object for every request.
    Value(Value),
    /// Built on demand.
    Factory(Arc<dyn ContextFactory>),
}

impl ContextSpec {
    pub fn factory(factory: impl ContextFactory) -> Self {
        Self::Factory(Arc::new(factory))
    }
}

impl fmt::Debug for ContextSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent     => f.write_str("Absent"),
            Self::Value(v)   => f.debug_tuple("Value").field(v).finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

/// What [`ContextBuilder::build`](crate::ContextBuilder::build) needs from
/// the application: its context specifier and plugins.
#[derive(Clone, Debug, Default)]
pub struct AppConfig {
    pub context: ContextSpec,
    pub plugins: Plugins,
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(mut self, context: ContextSpec) -> Self {
        self.context = context;
        self
    }

    pub fn plugins(mut self, plugins: Plugins) -> Self {
        self.plugins = plugins;
        self
    }
}

// ── User data ─────────────────────────────────────────────────────────────────

/// Shared, concurrently writable user data for one request.
///
/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct ContextData(Arc<DashMap<String, Value>>);

impl ContextData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(Arc::new(map.into_iter().collect()))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.get(key).map(|v| v.value().clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.remove(key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A point-in-time copy, keys sorted.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Whether both handles point at the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ContextData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

// ── Application context ───────────────────────────────────────────────────────

/// User data plus whatever providers the enhancement phase injected.
#[derive(Clone, Default)]
pub struct AppContext {
    pub(crate) data: ContextData,
    pub(crate) store: Option<Arc<dyn StoreAdapter>>,
    pub(crate) logger: Option<Arc<dyn LogProvider>>,
    pub(crate) telemetry: Option<Arc<dyn TelemetryProvider>>,
    pub(crate) jobs: Option<Arc<dyn JobsProxy>>,
    pub(crate) plugins: BTreeMap<String, BoundProxy>,
}

impl AppContext {
    pub(crate) fn with_data(data: ContextData) -> Self {
        Self { data, ..Self::default() }
    }

    pub fn data(&self) -> &ContextData { &self.data }

    /// Shorthand for `self.data().get(key)`.
    pub fn get(&self, key: &str) -> Option<Value> { self.data.get(key) }

    pub fn store(&self) -> Option<&Arc<dyn StoreAdapter>> { self.store.as_ref() }
    pub fn logger(&self) -> Option<&Arc<dyn LogProvider>> { self.logger.as_ref() }
    pub fn telemetry(&self) -> Option<&Arc<dyn TelemetryProvider>> { self.telemetry.as_ref() }

    /// The job queue. Present whenever a jobs plugin is registered, even if
    /// it is down (then every call resolves to `None`).
    pub fn jobs(&self) -> Option<&Arc<dyn JobsProxy>> { self.jobs.as_ref() }

    /// A custom plugin's per-request proxy.
    pub fn plugin(&self, name: &str) -> Option<&BoundProxy> { self.plugins.get(name) }

    pub fn plugins(&self) -> &BTreeMap<String, BoundProxy> { &self.plugins }
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("data", &self.data)
            .field("store", &self.store.is_some())
            .field("logger", &self.logger.is_some())
            .field("telemetry", &self.telemetry.is_some())
            .field("jobs", &self.jobs.is_some())
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Everything a handler receives for one request.
#[derive(Debug)]
pub struct ProcessedContext {
    pub request: ProcessedRequest,
    pub response: ResponseBuilder,
    pub app: AppContext,
    pub plugins: Plugins,
}
