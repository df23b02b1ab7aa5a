//! Plugins: optional capability providers exposed on every request context.
//!
//! Four kinds are built in (store, logger, telemetry, jobs). Anything else is
//! a custom plugin whose per-request surface comes from a [`PluginManager`].
//! The kind is fixed when a plugin is registered, so the pipeline walks typed
//! [`PluginEntry`] values instead of re-deriving it from the name.

mod enhance;
mod jobs;
mod plan;
pub(crate) mod proxy;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{BoxError, PluginError};

pub use enhance::EnhancementReport;
pub(crate) use enhance::Executor;
pub use jobs::UnavailableJobs;
pub use plan::{PluginDependency, PluginExecutionPlan, plan};
pub use proxy::{BoundProxy, PluginManager, PluginProxy};

// ── Plugin contracts ──────────────────────────────────────────────────────────

/// Scheduling hints a plugin declares about itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PluginMetadata {
    /// Names of plugins that must be enhanced before this one.
    pub dependencies: Vec<String>,
    /// Lower runs earlier. `None` keeps the kind's default.
    pub priority: Option<i64>,
}

/// Common supertrait for every plugin instance.
///
/// Built-in kinds have fixed priorities that override whatever is declared
/// here; custom plugins are scheduled entirely from it.
pub trait Plugin: Send + Sync + 'static {
    fn metadata(&self) -> Result<PluginMetadata, PluginError> {
        Ok(PluginMetadata::default())
    }
}

/// Key-value store adapter.
#[async_trait]
pub trait StoreAdapter: Plugin {
    async fn get(&self, key: &str) -> Result<Option<Value>, BoxError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), BoxError>;
    async fn delete(&self, key: &str) -> Result<(), BoxError>;
}

/// Application-facing logger.
pub trait LogProvider: Plugin {
    fn log(&self, level: tracing::Level, message: &str, fields: &Value);
}

/// Telemetry sink.
pub trait TelemetryProvider: Plugin {
    fn record(&self, name: &str, attributes: &Value);
}

/// Job queue. Each request gets its own proxy.
#[async_trait]
pub trait JobsProvider: Plugin {
    /// `Ok(None)` counts as an invalid result and degrades to [`UnavailableJobs`].
    async fn create_proxy(&self) -> Result<Option<Arc<dyn JobsProxy>>, BoxError>;
}

/// Per-request handle onto the job queue.
#[async_trait]
pub trait JobsProxy: Send + Sync + 'static {
    /// Enqueues `job`. Returns the queue's receipt, if any.
    async fn dispatch(&self, job: &str, payload: Value) -> Result<Option<Value>, BoxError>;
    async fn status(&self, id: &str) -> Result<Option<Value>, BoxError>;
}

// ── Kinds and entries ─────────────────────────────────────────────────────────

/// What a registered plugin is.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PluginKind {
    Store,
    Logger,
    Telemetry,
    Jobs,
    Custom(String),
}

impl PluginKind {
    pub const STORE: &'static str = "store";
    pub const LOGGER: &'static str = "logger";
    pub const TELEMETRY: &'static str = "telemetry";
    pub const JOBS: &'static str = "jobs";

    /// The built-in kind registered under `name`, if any.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            Self::STORE     => Some(Self::Store),
            Self::LOGGER    => Some(Self::Logger),
            Self::TELEMETRY => Some(Self::Telemetry),
            Self::JOBS      => Some(Self::Jobs),
            _               => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Store     => Self::STORE,
            Self::Logger    => Self::LOGGER,
            Self::Telemetry => Self::TELEMETRY,
            Self::Jobs      => Self::JOBS,
            Self::Custom(n) => n,
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A registered plugin instance, tagged with its kind.
#[derive(Clone)]
pub enum PluginEntry {
    Store(Arc<dyn StoreAdapter>),
    Logger(Arc<dyn LogProvider>),
    Telemetry(Arc<dyn TelemetryProvider>),
    Jobs(Arc<dyn JobsProvider>),
    Custom(String, Arc<dyn Plugin>),
}

impl PluginEntry {
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Store(_)        => PluginKind::Store,
            Self::Logger(_)       => PluginKind::Logger,
            Self::Telemetry(_)    => PluginKind::Telemetry,
            Self::Jobs(_)         => PluginKind::Jobs,
            Self::Custom(name, _) => PluginKind::Custom(name.clone()),
        }
    }

    pub fn metadata(&self) -> Result<PluginMetadata, PluginError> {
        match self {
            Self::Store(p)     => p.metadata(),
            Self::Logger(p)    => p.metadata(),
            Self::Telemetry(p) => p.metadata(),
            Self::Jobs(p)      => p.metadata(),
            Self::Custom(_, p) => p.metadata(),
        }
    }
}

impl fmt::Debug for PluginEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PluginEntry").field(&self.kind()).finish()
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// The plugins attached to an application, keyed by name.
///
/// Cloning is cheap: entries are reference-counted and shared by every
/// in-flight request.
#[derive(Clone, Debug, Default)]
pub struct Plugins {
    entries: BTreeMap<String, PluginEntry>,
}

impl Plugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn StoreAdapter>) -> Self {
        self.entries.insert(PluginKind::STORE.to_owned(), PluginEntry::Store(store));
        self
    }

    pub fn logger(mut self, logger: Arc<dyn LogProvider>) -> Self {
        self.entries.insert(PluginKind::LOGGER.to_owned(), PluginEntry::Logger(logger));
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetryProvider>) -> Self {
        self.entries.insert(PluginKind::TELEMETRY.to_owned(), PluginEntry::Telemetry(telemetry));
        self
    }

    pub fn jobs(mut self, jobs: Arc<dyn JobsProvider>) -> Self {
        self.entries.insert(PluginKind::JOBS.to_owned(), PluginEntry::Jobs(jobs));
        self
    }

    /// Registers a custom plugin. Built-in names are rejected.
    pub fn custom(mut self, name: impl Into<String>, plugin: Arc<dyn Plugin>) -> Result<Self, PluginError> {
        let name = name.into();
        if PluginKind::builtin(&name).is_some() {
            return Err(PluginError::ReservedName(name));
        }
        self.entries.insert(name.clone(), PluginEntry::Custom(name, plugin));
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&PluginEntry> {
        self.entries.get(name)
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PluginEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
