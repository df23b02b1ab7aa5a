//! Minimal kindle example: JSON endpoints with a per-request context, a
//! store plugin and a custom plugin.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42?verbose=1
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl -X DELETE http://localhost:3000/users/42

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::{Method, StatusCode};
use kindle::plugin::{BoundProxy, Plugin, PluginManager, PluginProxy, Plugins, StoreAdapter};
use kindle::{BoxError, ContextSpec, ProcessedContext, Response, Router, Server};
use serde_json::{Value, json};

#[tokio::main]
async fn main() -> Result<(), kindle::Error> {
    tracing_subscriber::fmt::init();

    let plugins = Plugins::new()
        .store(Arc::new(MemoryStore::default()))
        .custom("audit", Arc::new(Audit))?;

    let app = Router::new()
        .context(ContextSpec::factory(|| async { Ok::<_, BoxError>(json!({"region": "eu-west"})) }))
        .plugins(plugins)
        .plugin_manager(Arc::new(Manager))
        .on(Method::GET,    "/users/{id}", get_user)
        .on(Method::POST,   "/users",      create_user)
        .on(Method::DELETE, "/users/{id}", delete_user);

    Server::bind("0.0.0.0:3000")?.serve(app).await
}

// GET /users/{id}
async fn get_user(ctx: ProcessedContext) -> Response {
    let id = ctx.request.param("id").unwrap_or("unknown");
    let Some(store) = ctx.app.store() else {
        return Response::status(StatusCode::SERVICE_UNAVAILABLE);
    };
    match store.get(id).await {
        Ok(Some(user)) => Response::json(&user),
        Ok(None) => Response::status(StatusCode::NOT_FOUND),
        Err(_) => Response::status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

// POST /users
async fn create_user(ctx: ProcessedContext) -> Response {
    let Some(user) = ctx.request.body().cloned() else {
        return Response::status(StatusCode::BAD_REQUEST);
    };
    if let Some(store) = ctx.app.store() {
        let _ = store.set("99", user.clone()).await;
    }
    if let Some(audit) = ctx.app.plugin("audit") {
        let _ = audit.call("record", json!({"created": "99"})).await;
    }
    ctx.response
        .status(StatusCode::CREATED)
        .header("location", "/users/99")
        .json(&json!({"id": "99", "user": user, "region": ctx.app.get("region")}))
}

// DELETE /users/{id} → 204 No Content
async fn delete_user(ctx: ProcessedContext) -> Response {
    if let (Some(store), Some(id)) = (ctx.app.store(), ctx.request.param("id")) {
        let _ = store.delete(id).await;
    }
    Response::status(StatusCode::NO_CONTENT)
}

#[derive(Default)]
struct MemoryStore(Mutex<HashMap<String, Value>>);

impl Plugin for MemoryStore {}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, BoxError> {
        Ok(self.0.lock().map_err(|e| e.to_string())?.get(key).cloned())
    }
    async fn set(&self, key: &str, value: Value) -> Result<(), BoxError> {
        self.0.lock().map_err(|e| e.to_string())?.insert(key.to_owned(), value);
        Ok(())
    }
    async fn delete(&self, key: &str) -> Result<(), BoxError> {
        self.0.lock().map_err(|e| e.to_string())?.remove(key);
        Ok(())
    }
}

struct Audit;

impl Plugin for Audit {}

#[async_trait]
impl PluginProxy for Audit {
    async fn call(&self, action: &str, input: Value, scope: &BoundProxy) -> Result<Value, BoxError> {
        scope.emit(action, input).await;
        Ok(Value::Null)
    }
}

struct Manager;

#[async_trait]
impl PluginManager for Manager {
    fn proxies(&self) -> Vec<(String, Option<Arc<dyn PluginProxy>>)> {
        let audit: Arc<dyn PluginProxy> = Arc::new(Audit);
        vec![("audit".to_owned(), Some(audit))]
    }

    async fn emit(&self, plugin: &str, event: &str, payload: Value) -> Result<(), BoxError> {
        tracing::info!(plugin, event, %payload, "audit event");
        Ok(())
    }
}
