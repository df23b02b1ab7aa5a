//! Dependency planning: which plugins may be enhanced together, and in what order.
//!
//! Plugins are grouped into batches by repeated topological peeling. Each
//! round takes every plugin whose dependencies are already resolved and, of
//! those, keeps only the lowest priority tier. A tier runs concurrently; the
//! next round starts after it.
//!
//! ```text
//! logger(5) → store(10) → jobs(50, needs store) → telemetry(90) → custom(100)
//! ```
//!
//! A cycle or a dependency on an unknown plugin would stall the loop. When no
//! plugin is ready but some remain, every remaining plugin is forced into one
//! final batch and recorded as an error: liveness wins over strict ordering.

use std::collections::{BTreeSet, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{error, warn};

use super::{PluginEntry, PluginKind, Plugins};
use crate::error::PluginError;
use crate::guard;

const DEFAULT_PRIORITY: i64 = 100;

/// Scheduling record for one plugin, rebuilt on every planning run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginDependency {
    pub name: String,
    pub dependencies: BTreeSet<String>,
    /// Lower is scheduled no later.
    pub priority: i64,
}

impl PluginDependency {
    /// Builds the record for `entry`, applying the built-in overrides.
    ///
    /// | Kind | Priority | Dependencies |
    /// |---|---|---|
    /// | logger | 5 | declared |
    /// | store | 10 | declared |
    /// | jobs | 50 | `store` |
    /// | telemetry | 90 | declared |
    /// | custom | declared, else 100 | declared |
    ///
    /// A panicking `metadata()` is reported as [`PluginError::Metadata`].
    pub fn for_entry(name: &str, entry: &PluginEntry) -> Result<Self, PluginError> {
        let meta = catch_unwind(AssertUnwindSafe(|| entry.metadata())).map_err(|panic| PluginError::Metadata {
            plugin: name.to_owned(),
            reason: format!("panicked: {}", guard::panic_message(panic.as_ref())),
        })??;
        let mut dependencies: BTreeSet<String> = meta.dependencies.into_iter().collect();
        let priority = match entry.kind() {
            PluginKind::Logger    => 5,
            PluginKind::Store     => 10,
            PluginKind::Telemetry => 90,
            PluginKind::Jobs => {
                dependencies = BTreeSet::from([PluginKind::STORE.to_owned()]);
                50
            }
            PluginKind::Custom(_) => meta.priority.unwrap_or(DEFAULT_PRIORITY),
        };
        Ok(Self { name: name.to_owned(), dependencies, priority })
    }
}

/// Ordered batches of plugin names.
///
/// Every planned name appears in exactly one batch, and each dependency sits
/// in an earlier batch, except for names in `errors`, which share the final
/// batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PluginExecutionPlan {
    pub batches: Vec<Vec<String>>,
    pub errors: Vec<String>,
}

impl PluginExecutionPlan {
    /// Index of the batch that runs `name`.
    pub fn batch_of(&self, name: &str) -> Option<usize> {
        self.batches.iter().position(|b| b.iter().any(|n| n == name))
    }

    pub fn plugin_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

/// Plans enhancement order for `plugins`.
///
/// Never fails: plugins whose metadata cannot be read are logged, recorded in
/// `errors`, and run in the final batch.
pub fn plan(plugins: &Plugins) -> PluginExecutionPlan {
    let mut records = Vec::with_capacity(plugins.len());
    let mut unreadable = Vec::new();

    for (name, entry) in plugins.iter() {
        match PluginDependency::for_entry(name, entry) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(plugin = name, error = %e, "failed to extract plugin dependencies");
                unreadable.push(name.to_owned());
            }
        }
    }

    let (mut batches, stuck) = schedule(records);

    if !unreadable.is_empty() {
        match batches.last_mut() {
            Some(last) if !stuck.is_empty() => last.extend(unreadable.iter().cloned()),
            _ => batches.push(unreadable.clone()),
        }
    }

    let mut errors = unreadable;
    errors.extend(stuck);
    PluginExecutionPlan { batches, errors }
}

/// Topological batching. Returns the batches and the names that had to be
/// forced into the last one.
fn schedule(records: Vec<PluginDependency>) -> (Vec<Vec<String>>, Vec<String>) {
    let mut remaining = records;
    let mut resolved: HashSet<String> = HashSet::with_capacity(remaining.len());
    let mut batches = Vec::new();

    while !remaining.is_empty() {
        let tier = remaining
            .iter()
            .filter(|r| r.dependencies.iter().all(|d| resolved.contains(d)))
            .map(|r| r.priority)
            .min();

        let Some(tier) = tier else {
            let mut forced: Vec<String> = remaining.into_iter().map(|r| r.name).collect();
            forced.sort();
            error!(remaining = ?forced, "circular or unresolvable plugin dependencies");
            batches.push(forced.clone());
            return (batches, forced);
        };

        let (mut batch, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|r| {
            r.priority == tier && r.dependencies.iter().all(|d| resolved.contains(d))
        });
        remaining = rest;

        batch.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<String> = batch.into_iter().map(|r| r.name).collect();
        resolved.extend(names.iter().cloned());
        batches.push(names);
    }

    (batches, Vec::new())
}
