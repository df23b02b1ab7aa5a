//! Radix-tree request router and the per-request pipeline.
//!
//! One tree per HTTP method. A matched request is turned into a
//! [`ProcessedContext`](crate::ProcessedContext) by the router's
//! [`ContextBuilder`], enhanced with the application's plugins, then handed
//! to the handler.

use std::collections::HashMap;
use std::sync::Arc;

use http::{Method, StatusCode};
use matchit::Router as MatchitRouter;
use tracing::debug;

use crate::builder::ContextBuilder;
use crate::config::PipelineConfig;
use crate::context::{AppConfig, ContextSpec};
use crate::error::Error;
use crate::handler::{BoxedHandler, Handler};
use crate::plugin::{PluginManager, Plugins};
use crate::request::RawRequest;
use crate::response::Response;

/// The application router.
///
/// Build it once at startup and pass it to [`Server::serve`](crate::Server::serve).
/// Each registration returns `self` so calls chain naturally.
pub struct Router {
    routes: HashMap<Method, MatchitRouter<BoxedHandler>>,
    app: AppConfig,
    manager: Option<Arc<dyn PluginManager>>,
    builder: ContextBuilder,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            app: AppConfig::default(),
            manager: None,
            builder: ContextBuilder::default(),
        }
    }

    /// Register a handler for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax; `ctx.request.param("name")`
    /// retrieves them:
    ///
    /// ```rust,no_run
    /// # use kindle::{ProcessedContext, Response, Router};
    /// # use http::Method;
    /// # async fn get_user(_: ProcessedContext) -> Response { Response::text("") }
    /// # async fn create_user(_: ProcessedContext) -> Response { Response::text("") }
    /// Router::new()
    ///     .on(Method::GET,  "/users/{id}", get_user)
    ///     .on(Method::POST, "/users",      create_user);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `path` is malformed or conflicts with an existing route. Use
    /// [`try_on`](Self::try_on) to handle that as an error.
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.try_on(method, path, handler)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_on(mut self, method: Method, path: &str, handler: impl Handler) -> Result<Self, Error> {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, handler.into_boxed_handler())
            .map_err(|source| Error::Route { path: path.to_owned(), source })?;
        Ok(self)
    }

    /// Per-request user context: a fixed object or a factory.
    pub fn context(mut self, context: ContextSpec) -> Self {
        self.app.context = context;
        self
    }

    pub fn plugins(mut self, plugins: Plugins) -> Self {
        self.app.plugins = plugins;
        self
    }

    /// Source of custom plugin proxies.
    pub fn plugin_manager(mut self, manager: Arc<dyn PluginManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Replaces the context builder's timeouts.
    pub fn pipeline(mut self, config: PipelineConfig) -> Self {
        self.builder = ContextBuilder::new(config);
        self
    }

    /// Replaces the context builder entirely (custom body parser, span).
    pub fn builder(mut self, builder: ContextBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Runs one request through routing, context building, enhancement and
    /// the matched handler. Unmatched requests get `404`.
    pub async fn handle(&self, request: RawRequest) -> Response {
        let uri = request.uri().clone();
        let Some((handler, params)) = self.lookup(request.method(), uri.path()) else {
            debug!(method = %request.method(), path = uri.path(), "no route matched");
            return Response::status(StatusCode::NOT_FOUND);
        };

        let ctx = self.builder.build(&self.app, request, params, &uri).await;
        let ctx = self.builder.enhance_with_plugins(ctx, self.manager.as_ref()).await;
        handler.call(ctx).await
    }

    pub(crate) fn lookup(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(BoxedHandler, HashMap<String, String>)> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let handler = Arc::clone(matched.value);
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((handler, params))
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}
