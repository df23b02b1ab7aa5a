//! Request body parsing.
//!
//! The pipeline only depends on the [`BodyParser`] trait. [`ContentTypeParser`]
//! is the default and covers the content types most JSON APIs see; swap in
//! your own via [`ContextBuilder::with_body_parser`](crate::ContextBuilder::with_body_parser).

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::BoxError;
use crate::request::RawRequest;

/// Turns a raw request body into an untyped value.
///
/// `Ok(None)` means "no body". Errors are contained by the pipeline, which
/// logs them and hands the handler an absent body.
#[async_trait]
pub trait BodyParser: Send + Sync + 'static {
    async fn parse(&self, request: &RawRequest) -> Result<Option<Value>, BoxError>;
}

/// Content-type driven parser.
///
/// | Content type | Result |
/// |---|---|
/// | `application/json`, `*+json` | parsed JSON |
/// | `application/x-www-form-urlencoded` | object of string fields |
/// | `text/*` | JSON string |
/// | anything else, or empty body | `None` |
#[derive(Clone, Copy, Debug, Default)]
pub struct ContentTypeParser;

#[async_trait]
impl BodyParser for ContentTypeParser {
    async fn parse(&self, request: &RawRequest) -> Result<Option<Value>, BoxError> {
        let body = request.body();
        if body.is_empty() {
            return Ok(None);
        }

        let mime = request
            .content_type()
            .and_then(|ct| ct.split(';').next())
            .map(|m| m.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if mime == "application/json" || mime.ends_with("+json") {
            return Ok(Some(serde_json::from_slice(body)?));
        }
        if mime == "application/x-www-form-urlencoded" {
            let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)?;
            let fields: Map<String, Value> = pairs
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            return Ok(Some(Value::Object(fields)));
        }
        if mime.starts_with("text/") {
            return Ok(Some(Value::String(std::str::from_utf8(body)?.to_owned())));
        }
        Ok(None)
    }
}
