//! Handler trait and type erasure.
//!
//! The router stores handlers of different concrete types in one tree per
//! method, so each one is erased behind `dyn ErasedHandler`:
//!
//! ```text
//! async fn show(ctx: ProcessedContext) -> Response { … }   ← user writes this
//!        ↓ router.on(Method::GET, "/", show)
//! show.into_boxed_handler()                                ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(show))                                ← stored as BoxedHandler
//!        ↓
//! handler.call(ctx)  at request time                       ← one vtable dispatch
//! ```

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::context::ProcessedContext;
use crate::response::{IntoResponse, Response};

#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, ctx: ProcessedContext) -> BoxFuture<'static, Response>;
}

/// A type-erased handler shared across concurrent requests.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid route handler.
///
/// Satisfied automatically by any function with the signature:
///
/// ```text
/// async fn name(ctx: ProcessedContext) -> impl IntoResponse
/// ```
///
/// Sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(ProcessedContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(ProcessedContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(ProcessedContext) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, ctx: ProcessedContext) -> BoxFuture<'static, Response> {
        let fut = (self.0)(ctx);
        Box::pin(async move { fut.await.into_response() })
    }
}
