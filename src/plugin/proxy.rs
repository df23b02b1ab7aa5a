//! Per-request proxies for custom plugins.
//!
//! A [`PluginManager`] owns long-lived proxies shared by every request. For
//! each request the injector wraps each one in a [`BoundProxy`] that carries
//! the request's [`ContextData`] and an emitter routed back through the
//! manager. The shared proxy is never mutated, so concurrent requests cannot
//! observe each other's context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::context::ContextData;
use crate::error::BoxError;
use crate::guard::{self, GuardError};

/// Source of custom plugin proxies and sink for their events.
///
/// Invoked concurrently by every in-flight request.
#[async_trait]
pub trait PluginManager: Send + Sync + 'static {
    /// Every custom plugin's shared proxy. `None` marks a plugin that has no
    /// per-request surface; it is skipped.
    fn proxies(&self) -> Vec<(String, Option<Arc<dyn PluginProxy>>)>;

    /// Delivers an event emitted by `plugin`.
    async fn emit(&self, plugin: &str, event: &str, payload: Value) -> Result<(), BoxError>;
}

/// The actions a custom plugin exposes to handlers.
#[async_trait]
pub trait PluginProxy: Send + Sync + 'static {
    /// Per-request setup, run under the proxy-setup deadline before the proxy
    /// is handed to handler code. A failure drops this plugin for the request.
    async fn bind(&self, _context: &ContextData) -> Result<(), BoxError> {
        Ok(())
    }

    /// Runs `action`. `scope` gives access to the request context and emitter.
    async fn call(&self, action: &str, input: Value, scope: &BoundProxy) -> Result<Value, BoxError>;
}

/// A plugin proxy bound to one request.
#[derive(Clone)]
pub struct BoundProxy {
    name: String,
    proxy: Arc<dyn PluginProxy>,
    context: ContextData,
    manager: Arc<dyn PluginManager>,
    emit_timeout: Duration,
}

impl BoundProxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The request's user data. Same storage as `ctx.app.data()`.
    pub fn context(&self) -> &ContextData {
        &self.context
    }

    /// The namespaced channel an event travels on: `plugin:<name>:<event>`.
    pub fn channel(&self, event: &str) -> String {
        format!("plugin:{}:{event}", self.name)
    }

    /// Emits `event` through the plugin manager.
    ///
    /// Failures and timeouts are logged and swallowed.
    pub async fn emit(&self, event: &str, payload: Value) {
        let channel = self.channel(event);
        debug!(plugin = %self.name, event, channel = %channel, "plugin event emitted");

        let op = format!("Plugin event emit: {channel}");
        let sent = guard::guarded(|| self.manager.emit(&self.name, event, payload), self.emit_timeout, &op).await;
        if let Err(e) = sent {
            error!(plugin = %self.name, event, error = %e, "plugin event emission failed");
        }
    }

    /// Invokes one of the plugin's actions.
    pub async fn call(&self, action: &str, input: Value) -> Result<Value, BoxError> {
        self.proxy.call(action, input, self).await
    }
}

impl fmt::Debug for BoundProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundProxy").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Binds every proxy the manager offers to `context`.
///
/// Each proxy is set up under its own deadline and awaited independently;
/// one failing plugin never affects the others.
pub(crate) async fn inject(
    context: &ContextData,
    manager: &Arc<dyn PluginManager>,
    timeout: Duration,
) -> BTreeMap<String, BoundProxy> {
    let listed = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| manager.proxies())) {
        Ok(listed) => listed,
        Err(_) => {
            error!("plugin manager panicked while listing proxies");
            return BTreeMap::new();
        }
    };

    let candidates: Vec<_> = listed
        .into_iter()
        .filter_map(|(name, proxy)| proxy.map(|p| (name, p)))
        .collect();
    if candidates.is_empty() {
        debug!("no plugin proxies found");
        return BTreeMap::new();
    }

    let setups = candidates.into_iter().map(|(name, proxy)| async move {
        let op = format!("Plugin proxy setup: {name}");
        match guard::guarded(|| proxy.bind(context), timeout, &op).await {
            Ok(()) => Some(BoundProxy {
                name,
                proxy,
                context: context.clone(),
                manager: Arc::clone(manager),
                emit_timeout: timeout,
            }),
            Err(e) => {
                log_setup_failure(&name, &e);
                None
            }
        }
    });

    let bound: BTreeMap<_, _> = join_all(setups)
        .await
        .into_iter()
        .flatten()
        .map(|p| (p.name.clone(), p))
        .collect();

    if !bound.is_empty() {
        debug!(count = bound.len(), "plugin proxies injected");
    }
    bound
}

fn log_setup_failure(name: &str, e: &GuardError<BoxError>) {
    match e {
        GuardError::Timeout(_) => warn!(plugin = name, error = %e, "plugin proxy setup timed out"),
        _ => warn!(plugin = name, error = %e, "plugin proxy setup failed"),
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::*;
    use super::*;
    use crate::test_support::capture_logs;

    fn manager(m: RecordingManager) -> Arc<dyn PluginManager> {
        Arc::new(m)
    }

    #[tokio::test]
    async fn binds_every_non_null_proxy() {
        let m = manager(RecordingManager::with(vec![
            ("audit", proxy(EchoProxy)),
            ("ghost", None),
        ]));
        let bound = inject(&ContextData::new(), &m, Duration::from_secs(1)).await;
        assert_eq!(bound.keys().collect::<Vec<_>>(), ["audit"]);
    }

    #[tokio::test]
    async fn proxy_sees_later_context_writes() {
        let m = manager(RecordingManager::with(vec![("audit", proxy(EchoProxy))]));
        let data = ContextData::new();
        let bound = inject(&data, &m, Duration::from_secs(1)).await;

        data.insert("user", json!("alice"));
        let seen = bound["audit"].call("whoami", Value::Null).await.unwrap();
        assert_eq!(seen, json!("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_and_hanging_setups_drop_only_themselves() {
        let m = manager(RecordingManager::with(vec![
            ("audit", proxy(EchoProxy)),
            ("broken", proxy(BrokenProxy)),
            ("hanging", proxy(HangingProxy)),
            ("metrics", proxy(EchoProxy)),
        ]));
        let bound = inject(&ContextData::new(), &m, Duration::from_millis(100)).await;
        assert_eq!(bound.keys().collect::<Vec<_>>(), ["audit", "metrics"]);
    }

    #[tokio::test]
    async fn events_are_namespaced_and_routed_through_manager() {
        let recording = Arc::new(RecordingManager::with(vec![("audit", proxy(EchoProxy))]));
        let m: Arc<dyn PluginManager> = recording.clone();
        let bound = inject(&ContextData::new(), &m, Duration::from_secs(1)).await;
        let audit = &bound["audit"];

        assert_eq!(audit.channel("notified"), "plugin:audit:notified");
        audit.call("notify", json!({"id": 1})).await.unwrap();

        let emitted = recording.emitted.lock().unwrap();
        assert_eq!(*emitted, [("audit".to_owned(), "notified".to_owned(), json!({"id": 1}))]);
    }

    #[tokio::test]
    async fn emit_failures_are_logged_and_swallowed() {
        let m = manager(RecordingManager {
            proxies: vec![("audit".to_owned(), proxy(EchoProxy))],
            fail_emits: true,
            ..RecordingManager::default()
        });
        let bound = inject(&ContextData::new(), &m, Duration::from_secs(1)).await;

        let (_guard, logs) = capture_logs();
        bound["audit"].emit("anything", Value::Null).await;

        let out = logs.contents();
        assert!(out.contains("plugin event emission failed"), "{out}");
        assert!(out.contains("audit"), "{out}");
        assert!(out.contains("bus offline"), "{out}");
    }

    #[tokio::test]
    async fn synchronous_bind_panic_drops_only_that_proxy() {
        let m = manager(RecordingManager::with(vec![
            ("audit", proxy(EchoProxy)),
            ("bad", proxy(ThrowingProxy)),
            ("metrics", proxy(EchoProxy)),
        ]));
        let bound = inject(&ContextData::new(), &m, Duration::from_secs(1)).await;
        assert_eq!(bound.keys().collect::<Vec<_>>(), ["audit", "metrics"]);
    }

    #[tokio::test]
    async fn empty_manager_yields_nothing() {
        let m = manager(RecordingManager::default());
        assert!(inject(&ContextData::new(), &m, Duration::from_secs(1)).await.is_empty());
    }
}
