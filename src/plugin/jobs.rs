//! Degraded job queue used when the real one cannot produce a proxy.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::JobsProxy;
use crate::error::BoxError;

/// Stand-in [`JobsProxy`] installed when the jobs plugin is down.
///
/// Every call logs a warning and resolves to `Ok(None)`, so handler code can
/// call `ctx.app.jobs()` unconditionally.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableJobs;

#[async_trait]
impl JobsProxy for UnavailableJobs {
    async fn dispatch(&self, job: &str, _payload: Value) -> Result<Option<Value>, BoxError> {
        warn!(job, "jobs fallback: dispatch called but no jobs provider available");
        Ok(None)
    }

    async fn status(&self, id: &str) -> Result<Option<Value>, BoxError> {
        warn!(id, "jobs fallback: status called but no jobs provider available");
        Ok(None)
    }
}
