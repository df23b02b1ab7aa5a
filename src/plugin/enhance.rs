//! Plugin enhancement: walks a plan batch by batch and merges each plugin's
//! contribution into the application context.
//!
//! Within a batch every routine starts together and is collected as it
//! settles. The batch as a whole has a deadline; routines still pending when
//! it passes are dropped (cancelled at their next suspension point) and the
//! next batch starts. Results are applied by the executor alone, after each
//! routine settles, so an abandoned routine can never write to the context.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, warn};

use super::jobs::UnavailableJobs;
use super::plan::PluginExecutionPlan;
use super::proxy::{self, BoundProxy, PluginManager};
use super::{JobsProvider, JobsProxy, LogProvider, PluginEntry, Plugins, StoreAdapter, TelemetryProvider};
use crate::config::Timeouts;
use crate::context::{AppContext, ContextData};
use crate::guard::{self, GuardError};

/// What the enhancement phase did, for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnhancementReport {
    /// Providers injected, in the order they settled.
    pub injected: Vec<String>,
    /// Routines abandoned because their batch deadline passed.
    pub abandoned: Vec<String>,
    /// Plugins with dependency problems (see [`PluginExecutionPlan::errors`]).
    pub plan_errors: Vec<String>,
}

/// One routine's contribution to the context.
enum Contribution {
    Store(Arc<dyn StoreAdapter>),
    Logger(Arc<dyn LogProvider>),
    Telemetry(Arc<dyn TelemetryProvider>),
    Jobs(Arc<dyn JobsProxy>),
    Proxies(BTreeMap<String, BoundProxy>),
}

type Routine<'a> = BoxFuture<'a, (String, Option<Contribution>)>;

/// Runs a plan against an accumulator context.
pub(crate) struct Executor<'a> {
    pub timeouts: &'a Timeouts,
    pub manager: Option<&'a Arc<dyn PluginManager>>,
}

impl Executor<'_> {
    pub async fn run(&self, plan: &PluginExecutionPlan, plugins: &Plugins, app: &mut AppContext) -> EnhancementReport {
        let mut report = EnhancementReport { plan_errors: plan.errors.clone(), ..Default::default() };
        let total = plan.batches.len();

        for (i, batch) in plan.batches.iter().enumerate() {
            debug!(batch = i + 1, total, plugins = ?batch, "executing plugin batch");
            self.run_batch(i + 1, batch, plugins, app, &mut report).await;
        }
        report
    }

    async fn run_batch(
        &self,
        number: usize,
        batch: &[String],
        plugins: &Plugins,
        app: &mut AppContext,
        report: &mut EnhancementReport,
    ) {
        let deadline = Instant::now() + self.timeouts.plugin_batch();
        let mut pending: FuturesUnordered<Routine<'_>> = FuturesUnordered::new();
        let mut labels: Vec<String> = Vec::with_capacity(batch.len());
        let mut has_custom = false;

        for name in batch {
            let routine: Routine<'_> = match plugins.get(name) {
                Some(PluginEntry::Store(s))     => ready(name, Contribution::Store(Arc::clone(s))),
                Some(PluginEntry::Logger(l))    => ready(name, Contribution::Logger(Arc::clone(l))),
                Some(PluginEntry::Telemetry(t)) => ready(name, Contribution::Telemetry(Arc::clone(t))),
                Some(PluginEntry::Jobs(j))      => self.jobs(name, Arc::clone(j)),
                Some(PluginEntry::Custom(..))   => {
                    has_custom = true;
                    continue;
                }
                None => continue,
            };
            labels.push(name.clone());
            pending.push(routine);
        }

        // Custom plugins share one injection round per batch.
        if let Some(manager) = self.manager.filter(|_| has_custom) {
            labels.push("plugins".to_owned());
            pending.push(self.proxies(app.data.clone(), manager));
        }

        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((label, contribution))) => {
                    labels.retain(|l| *l != label);
                    if let Some(c) = contribution {
                        apply(c, app, report);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        batch = number,
                        unsettled = ?labels,
                        timeout_ms = self.timeouts.plugin_batch_ms,
                        "plugin batch timed out, continuing without unsettled plugins"
                    );
                    report.abandoned.append(&mut labels);
                    break;
                }
            }
        }
    }

    fn jobs(&self, name: &str, provider: Arc<dyn JobsProvider>) -> Routine<'static> {
        let name = name.to_owned();
        let timeout = self.timeouts.plugin_proxy();
        Box::pin(async move {
            let created = guard::guarded(|| provider.create_proxy(), timeout, "Jobs proxy creation").await;
            let proxy: Arc<dyn JobsProxy> = match created {
                Ok(Some(proxy)) => {
                    debug!("jobs proxy created");
                    proxy
                }
                Ok(None) => {
                    warn!("jobs create_proxy returned no proxy, using fallback");
                    Arc::new(UnavailableJobs)
                }
                Err(e @ GuardError::Failed(_)) => {
                    error!(error = %e, "jobs proxy injection failed, using fallback");
                    Arc::new(UnavailableJobs)
                }
                Err(e) => {
                    error!(error = %e, "jobs proxy creation did not complete, using fallback");
                    Arc::new(UnavailableJobs)
                }
            };
            (name, Some(Contribution::Jobs(proxy)))
        })
    }

    fn proxies<'m>(&self, data: ContextData, manager: &'m Arc<dyn PluginManager>) -> Routine<'m> {
        let timeout = self.timeouts.plugin_proxy();
        Box::pin(async move {
            debug!("injecting plugin proxies");
            let injected = guard::contained(|| proxy::inject(&data, manager, timeout)).await;
            match injected {
                Ok(bound) if !bound.is_empty() => ("plugins".to_owned(), Some(Contribution::Proxies(bound))),
                Ok(_) => ("plugins".to_owned(), None),
                Err(panic) => {
                    error!(error = %panic, "plugin proxy injection failed");
                    ("plugins".to_owned(), None)
                }
            }
        })
    }
}

fn ready(name: &str, contribution: Contribution) -> Routine<'static> {
    let name = name.to_owned();
    Box::pin(async move { (name, Some(contribution)) })
}

fn apply(contribution: Contribution, app: &mut AppContext, report: &mut EnhancementReport) {
    match contribution {
        Contribution::Store(s) => {
            app.store = Some(s);
            report.injected.push("store".to_owned());
        }
        Contribution::Logger(l) => {
            app.logger = Some(l);
            report.injected.push("logger".to_owned());
        }
        Contribution::Telemetry(t) => {
            app.telemetry = Some(t);
            report.injected.push("telemetry".to_owned());
        }
        Contribution::Jobs(j) => {
            app.jobs = Some(j);
            report.injected.push("jobs".to_owned());
        }
        Contribution::Proxies(bound) => {
            report.injected.push(format!("plugins ({})", bound.len()));
            app.plugins.extend(bound);
        }
    }
}
