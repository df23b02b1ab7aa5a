//! # kindle
//!
//! An async HTTP framework whose handlers receive one fully assembled,
//! fault-tolerant context per request.
//!
//! ## The contract
//!
//! Every request is turned into a [`ProcessedContext`] before your handler
//! runs: the routed and parsed request, a response builder, the application
//! context, and whatever plugins the application registered. Building that
//! context never fails. A slow context factory, a malformed body, a plugin
//! that hangs or panics: each one costs the request a single field, logged
//! through `tracing`, and the handler still runs.
//!
//! - Radix-tree routing via [`matchit`]
//! - HTTP/1.1 and HTTP/2 via hyper, graceful shutdown on SIGTERM / Ctrl-C
//! - Per-operation deadlines, see [`Timeouts`]
//! - Plugins scheduled in dependency order, see [`plugin`]
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::{Method, StatusCode};
//! use kindle::{BoxError, ContextSpec, ProcessedContext, Response, Router, Server};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kindle::Error> {
//!     let app = Router::new()
//!         .context(ContextSpec::factory(|| async { Ok::<_, BoxError>(json!({"region": "eu"})) }))
//!         .on(Method::GET,  "/users/{id}", get_user)
//!         .on(Method::POST, "/users",      create_user);
//!
//!     Server::bind("0.0.0.0:3000")?.serve(app).await
//! }
//!
//! async fn get_user(ctx: ProcessedContext) -> Response {
//!     let id = ctx.request.param("id").unwrap_or("unknown");
//!     Response::json(&json!({"id": id, "region": ctx.app.get("region")}))
//! }
//!
//! async fn create_user(ctx: ProcessedContext) -> Response {
//!     let Some(body) = ctx.request.body() else {
//!         return Response::status(StatusCode::BAD_REQUEST);
//!     };
//!     ctx.response
//!         .status(StatusCode::CREATED)
//!         .header("location", "/users/99")
//!         .json(body)
//! }
//! ```

mod body;
mod builder;
mod config;
mod context;
mod error;
mod guard;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod plugin;

#[cfg(test)]
mod test_support;

pub use body::{BodyParser, ContentTypeParser};
pub use builder::ContextBuilder;
pub use config::{PipelineConfig, Timeouts};
pub use context::{AppConfig, AppContext, ContextData, ContextFactory, ContextSpec, ProcessedContext};
pub use error::{BoxError, Error, PluginError, TimeoutError};
pub use guard::with_timeout;
pub use handler::Handler;
pub use request::{ProcessedRequest, RawRequest};
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
