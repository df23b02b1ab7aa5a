//! Per-request context construction and plugin enhancement.
//!
//! ```text
//! build()                                   enhance_with_plugins()
//! ┌──────────────────────┐                  ┌──────────────────────────────┐
//! │ base context ─┐      │                  │ plan(plugins)                │
//! │               ├ join ├→ ProcessedContext→│ batch 1 ─ batch 2 ─ … ─ last │→ ProcessedContext
//! │ body parse  ──┘      │                  │ (concurrent within a batch)  │
//! └──────────────────────┘                  └──────────────────────────────┘
//! ```
//!
//! Neither phase can fail. Every collaborator call runs under its own
//! deadline from [`Timeouts`](crate::Timeouts); a slow, failing or panicking
//! collaborator costs the request that one field, never the whole context.

use std::collections::HashMap;
use std::error::Error as _;
use std::future::Future;
use std::sync::Arc;

use http::Uri;
use serde_json::Value;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, Span, debug, debug_span, error, warn};

use crate::body::{BodyParser, ContentTypeParser};
use crate::config::PipelineConfig;
use crate::context::{AppConfig, AppContext, ContextData, ContextSpec, ProcessedContext};
use crate::guard::{self, GuardError};
use crate::plugin::{self, EnhancementReport, Executor, PluginManager};
use crate::request::{ProcessedRequest, RawRequest};
use crate::response::Response;

/// Builds and enhances [`ProcessedContext`]s.
///
/// One builder serves every request. Where its diagnostics go is decided by
/// whoever constructs it:
///
/// - [`with_dispatch`](Self::with_dispatch) sends every event and span the
///   builder produces to that dispatcher, whatever the process default is;
/// - without one, the ambient default dispatcher is used;
/// - [`with_span`](Self::with_span) only sets the parent span (by default a
///   `context_builder` span). It adds context, it does not pick a sink.
pub struct ContextBuilder {
    config: PipelineConfig,
    body_parser: Arc<dyn BodyParser>,
    span: Span,
    dispatch: Option<Dispatch>,
}

impl ContextBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            body_parser: Arc::new(ContentTypeParser),
            span: debug_span!("context_builder"),
            dispatch: None,
        }
    }

    /// Routes all of the builder's diagnostics to `dispatch`.
    ///
    /// Replaces the parent span with a fresh `context_builder` span owned by
    /// `dispatch`; call [`with_span`](Self::with_span) afterwards to override it.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.span = tracing::dispatcher::with_default(&dispatch, || debug_span!("context_builder"));
        self.dispatch = Some(dispatch);
        self
    }

    pub fn with_body_parser(mut self, parser: impl BodyParser) -> Self {
        self.body_parser = Arc::new(parser);
        self
    }

    /// Parent span for every diagnostic the builder emits.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Assembles the context for one request.
    ///
    /// The user context and the body are produced concurrently. `url` supplies
    /// the path and query; `route_params` come from the router.
    pub async fn build(
        &self,
        config: &AppConfig,
        request: RawRequest,
        route_params: HashMap<String, String>,
        url: &Uri,
    ) -> ProcessedContext {
        self.scoped(async {
            let span = debug_span!(parent: &self.span, "build", method = %request.method(), path = url.path());
            async {
                debug!("context building started");

                let (data, body) = tokio::join!(
                    self.base_context(&config.context),
                    self.parse_body(&request),
                );

                let request = ProcessedRequest::new(request, url, route_params, body);
                debug!(
                    has_body = request.body().is_some(),
                    query_params = ?request.query_params().keys().collect::<Vec<_>>(),
                    route_params = ?request.params().keys().collect::<Vec<_>>(),
                    "context built"
                );

                ProcessedContext {
                    request,
                    response: Response::builder(),
                    app: AppContext::with_data(data),
                    plugins: config.plugins.clone(),
                }
            }
            .instrument(span)
            .await
        })
        .await
    }

    /// Injects the context's plugins. See [`enhance_with_report`](Self::enhance_with_report).
    pub async fn enhance_with_plugins(
        &self,
        context: ProcessedContext,
        plugin_manager: Option<&Arc<dyn PluginManager>>,
    ) -> ProcessedContext {
        self.enhance_with_report(context, plugin_manager).await.0
    }

    /// Plans and runs plugin enhancement, returning the enhanced context and
    /// what was injected.
    ///
    /// The returned context carries a new [`AppContext`] that shares the
    /// input's user data; the input's providers are kept unless a plugin
    /// replaces them.
    pub async fn enhance_with_report(
        &self,
        context: ProcessedContext,
        plugin_manager: Option<&Arc<dyn PluginManager>>,
    ) -> (ProcessedContext, EnhancementReport) {
        self.scoped(async move {
            let span = debug_span!(parent: &self.span, "enhance", plugins = context.plugins.len());
            async move {
                debug!("context enhancement started");
                let ProcessedContext { request, response, app, plugins } = context;
                let mut enhanced = app;

                let plan = plugin::plan(&plugins);
                if !plan.errors.is_empty() {
                    warn!(errors = ?plan.errors, "some plugins have dependency issues");
                }
                debug!(
                    batches = plan.batches.len(),
                    total_plugins = plan.plugin_count(),
                    "plugin execution plan created"
                );

                let executor = Executor { timeouts: &self.config.timeouts, manager: plugin_manager };
                let report = executor.run(&plan, &plugins, &mut enhanced).await;

                if report.injected.is_empty() {
                    debug!("no providers injected");
                } else {
                    debug!(providers = ?report.injected, "context enhanced");
                }

                (ProcessedContext { request, response, app: enhanced, plugins }, report)
            }
            .instrument(span)
            .await
        })
        .await
    }

    /// Runs `fut` under the builder's dispatcher, if it has one.
    async fn scoped<F: Future>(&self, fut: F) -> F::Output {
        match &self.dispatch {
            Some(dispatch) => fut.with_subscriber(dispatch.clone()).await,
            None => fut.await,
        }
    }

    async fn base_context(&self, spec: &ContextSpec) -> ContextData {
        let factory = match spec {
            ContextSpec::Absent => return ContextData::new(),
            ContextSpec::Value(Value::Object(map)) => {
                debug!("static context used");
                return ContextData::from_map(map.clone());
            }
            ContextSpec::Value(other) => {
                warn!(returned = json_type(other), "invalid context configuration, using fallback");
                return ContextData::new();
            }
            ContextSpec::Factory(factory) => factory,
        };

        debug!("user context executing");
        let timeout = self.config.timeouts.context_creation();
        match guard::guarded(|| factory.create(), timeout, "Context creation").await {
            Ok(Value::Object(map)) => {
                debug!("base context created successfully");
                ContextData::from_map(map)
            }
            Ok(other) => {
                warn!(returned = json_type(&other), "context factory returned a non-object, using fallback");
                ContextData::new()
            }
            Err(e) => {
                let source = match &e {
                    GuardError::Failed(err) => err.source().map(ToString::to_string),
                    _ => None,
                };
                error!(error = %e, source = ?source, "base context creation failed, using fallback");
                ContextData::new()
            }
        }
    }

    async fn parse_body(&self, request: &RawRequest) -> Option<Value> {
        let timeout = self.config.timeouts.body_parsing();
        match guard::guarded(|| self.body_parser.parse(request), timeout, "Body parsing").await {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    error = %e,
                    method = %request.method(),
                    content_type = request.content_type().unwrap_or("none"),
                    "body parsing failed, using empty body"
                );
                None
            }
        }
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null      => "null",
        Value::Bool(_)   => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_)  => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http::{HeaderMap, HeaderValue, Method};
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::config::Timeouts;
    use crate::context::ContextFactory;
    use crate::error::BoxError;
    use crate::plugin::Plugins;
    use crate::plugin::proxy::testing::*;
    use crate::plugin::testing::*;
    use crate::test_support::{capture_logs, log_dispatch};

    fn get(uri: &str) -> (RawRequest, Uri) {
        let uri: Uri = uri.parse().unwrap();
        (RawRequest::new(Method::GET, uri.clone(), HeaderMap::new(), Bytes::new()), uri)
    }

    async fn build_with(spec: ContextSpec) -> ProcessedContext {
        let (req, url) = get("/");
        ContextBuilder::default()
            .build(&AppConfig::new().context(spec), req, HashMap::new(), &url)
            .await
    }

    #[tokio::test]
    async fn absent_spec_yields_empty_object() {
        let ctx = build_with(ContextSpec::Absent).await;
        assert!(ctx.app.data().is_empty());
    }

    #[tokio::test]
    async fn static_object_is_used_as_is() {
        let ctx = build_with(ContextSpec::Value(json!({"region": "eu"}))).await;
        assert_eq!(ctx.app.get("region"), Some(json!("eu")));
    }

    #[tokio::test]
    async fn static_non_object_falls_back() {
        let ctx = build_with(ContextSpec::Value(json!(42))).await;
        assert!(ctx.app.data().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_factory_within_deadline_is_used() {
        let spec = ContextSpec::factory(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, BoxError>(json!({"db": "conn"}))
        });
        let ctx = build_with(spec).await;
        assert_eq!(ctx.app.get("db"), Some(json!("conn")));
    }

    #[tokio::test]
    async fn primitive_factory_result_falls_back_with_warning() {
        let (_guard, logs) = capture_logs();
        let ctx = build_with(ContextSpec::factory(|| async { Ok::<_, BoxError>(json!("oops")) })).await;

        assert_eq!(Value::Object(ctx.app.data().snapshot()), json!({}));
        let out = logs.contents();
        assert!(out.contains("WARN"), "{out}");
        assert!(out.contains("context factory returned a non-object"), "{out}");
        assert!(out.contains("string"), "{out}");
    }

    #[tokio::test]
    async fn failing_factory_falls_back() {
        let spec = ContextSpec::factory(|| async { Err::<Value, BoxError>("database unreachable".into()) });
        let ctx = build_with(spec).await;
        assert!(ctx.app.data().is_empty());
    }

    #[tokio::test]
    async fn panicking_factory_falls_back() {
        let spec = ContextSpec::factory(|| async {
            if true {
                panic!("factory bug");
            }
            Ok::<_, BoxError>(json!({}))
        });
        let ctx = build_with(spec).await;
        assert!(ctx.app.data().is_empty());
    }

    #[tokio::test]
    async fn factory_throwing_on_call_falls_back() {
        struct Throwing;
        impl ContextFactory for Throwing {
            fn create<'life0, 'async_trait>(&'life0 self) -> BoxFuture<'async_trait, Result<Value, BoxError>>
            where
                'life0: 'async_trait,
                Self: 'async_trait,
            {
                panic!("factory threw")
            }
        }

        let (_guard, logs) = capture_logs();
        let ctx = build_with(ContextSpec::factory(Throwing)).await;
        assert!(ctx.app.data().is_empty());
        assert!(logs.contents().contains("factory threw"));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_factory_is_cut_off_at_deadline() {
        let spec = ContextSpec::factory(|| std::future::pending::<Result<Value, BoxError>>());
        let started = Instant::now();
        let ctx = build_with(spec).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_millis(5_100));
        assert!(ctx.app.data().is_empty());
    }

    #[tokio::test]
    async fn request_metadata_is_merged() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("cookie", HeaderValue::from_static("sid=s1"));
        let url: Uri = "/users/7?expand=orders".parse().unwrap();
        let req = RawRequest::new(Method::POST, url.clone(), headers, &br#"{"name":"bob"}"#[..]);
        let params = HashMap::from([("id".to_owned(), "7".to_owned())]);

        let ctx = ContextBuilder::default().build(&AppConfig::new(), req, params, &url).await;
        assert_eq!(ctx.request.method(), &Method::POST);
        assert_eq!(ctx.request.path(), "/users/7");
        assert_eq!(ctx.request.param("id"), Some("7"));
        assert_eq!(ctx.request.query("expand"), Some("orders"));
        assert_eq!(ctx.request.cookie("sid"), Some("s1"));
        assert_eq!(ctx.request.body(), Some(&json!({"name": "bob"})));
    }

    #[tokio::test]
    async fn body_parse_failure_yields_absent_body() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let url: Uri = "/".parse().unwrap();
        let req = RawRequest::new(Method::POST, url.clone(), headers, &b"{broken"[..]);

        let (_guard, logs) = capture_logs();
        let ctx = ContextBuilder::default().build(&AppConfig::new(), req, HashMap::new(), &url).await;
        assert_eq!(ctx.request.body(), None);
        let out = logs.contents();
        assert!(out.contains("body parsing failed"), "{out}");
        assert!(out.contains("application/json"), "{out}");
    }

    #[tokio::test]
    async fn body_parser_throwing_on_call_yields_absent_body() {
        struct Throwing;
        impl BodyParser for Throwing {
            fn parse<'life0, 'life1, 'async_trait>(
                &'life0 self,
                _request: &'life1 RawRequest,
            ) -> BoxFuture<'async_trait, Result<Option<Value>, BoxError>>
            where
                'life0: 'async_trait,
                'life1: 'async_trait,
                Self: 'async_trait,
            {
                panic!("parser threw")
            }
        }

        let (req, url) = get("/");
        let ctx = ContextBuilder::default()
            .with_body_parser(Throwing)
            .build(&AppConfig::new().context(ContextSpec::Value(json!({"ok": true}))), req, HashMap::new(), &url)
            .await;
        assert_eq!(ctx.request.body(), None);
        assert_eq!(ctx.app.get("ok"), Some(json!(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_body_parser_is_cut_off() {
        struct Hanging;
        #[async_trait]
        impl BodyParser for Hanging {
            async fn parse(&self, _: &RawRequest) -> Result<Option<Value>, BoxError> {
                std::future::pending().await
            }
        }

        let builder = ContextBuilder::new(
            PipelineConfig::new().timeouts(Timeouts::default().with_body_parsing(Duration::from_millis(20))),
        )
        .with_body_parser(Hanging);
        let (req, url) = get("/");
        let ctx = builder.build(&AppConfig::new(), req, HashMap::new(), &url).await;
        assert_eq!(ctx.request.body(), None);
    }

    #[tokio::test]
    async fn store_and_failing_jobs_scenario() {
        let store: Arc<dyn crate::plugin::StoreAdapter> = Arc::new(MemoryStore);
        let config = AppConfig::new().plugins(Plugins::new().store(Arc::clone(&store)).jobs(Arc::new(DownJobs)));
        let builder = ContextBuilder::default();
        let (req, url) = get("/");

        let ctx = builder.build(&config, req, HashMap::new(), &url).await;
        let ctx = builder.enhance_with_plugins(ctx, None).await;

        assert!(Arc::ptr_eq(ctx.app.store().unwrap(), &store));
        assert_eq!(ctx.app.jobs().unwrap().dispatch("welcome", Value::Null).await.unwrap(), None);
    }

    #[tokio::test]
    async fn panicking_plugin_metadata_does_not_abort_enhancement() {
        let config = AppConfig::new().plugins(
            Plugins::new()
                .store(Arc::new(MemoryStore))
                .custom("bad", Arc::new(Exploding))
                .unwrap(),
        );
        let builder = ContextBuilder::default();
        let (req, url) = get("/");

        let ctx = builder.build(&config, req, HashMap::new(), &url).await;
        let (ctx, report) = builder.enhance_with_report(ctx, None).await;
        assert!(ctx.app.store().is_some());
        assert_eq!(report.plan_errors, ["bad"]);
    }

    #[tokio::test]
    async fn injected_dispatch_receives_diagnostics() {
        let (dispatch, logs) = log_dispatch();
        let builder = ContextBuilder::default().with_dispatch(dispatch);
        let config = AppConfig::new().context(ContextSpec::factory(|| async { Ok::<_, BoxError>(json!("oops")) }));
        let (req, url) = get("/");

        builder.build(&config, req, HashMap::new(), &url).await;

        let out = logs.contents();
        assert!(out.contains("context factory returned a non-object"), "{out}");
    }

    #[tokio::test]
    async fn enhancement_keeps_user_data_handle() {
        let builder = ContextBuilder::default();
        let (req, url) = get("/");
        let config = AppConfig::new()
            .context(ContextSpec::Value(json!({"user": "alice"})))
            .plugins(Plugins::new().custom("audit", Declared::new(&[], None)).unwrap());
        let manager: Arc<dyn PluginManager> = Arc::new(RecordingManager::with(vec![("audit", proxy(EchoProxy))]));

        let ctx = builder.build(&config, req, HashMap::new(), &url).await;
        let before = ctx.app.data().clone();
        let ctx = builder.enhance_with_plugins(ctx, Some(&manager)).await;

        assert!(ctx.app.data().ptr_eq(&before));
        ctx.app.data().insert("user", json!("bob"));
        let seen = ctx.app.plugin("audit").unwrap().call("whoami", Value::Null).await.unwrap();
        assert_eq!(seen, json!("bob"));
    }

    #[tokio::test]
    async fn identical_inputs_give_equal_contexts() {
        let config = AppConfig::new()
            .context(ContextSpec::factory(|| async { Ok::<_, BoxError>(json!({"tenant": "acme"})) }))
            .plugins(
                Plugins::new()
                    .store(Arc::new(MemoryStore))
                    .logger(Arc::new(NullLogger))
                    .jobs(Arc::new(RecordingJobs)),
            );
        let builder = ContextBuilder::default();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (req, url) = get("/orders?page=2");
            let ctx = builder.build(&config, req, HashMap::new(), &url).await;
            let (ctx, report) = builder.enhance_with_report(ctx, None).await;
            seen.push((ctx.request, ctx.app.data().snapshot(), format!("{:?}", ctx.app), report));
        }
        assert_eq!(seen[0], seen[1]);
    }
}
