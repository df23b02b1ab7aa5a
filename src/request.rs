//! Request types: the raw incoming request and its processed, per-handler form.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use serde_json::Value;

/// An incoming HTTP request with its body fully collected.
///
/// This is what body parsers see. Handlers receive a [`ProcessedRequest`]
/// through the [`ProcessedContext`](crate::ProcessedContext) instead.
#[derive(Clone, Debug)]
pub struct RawRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl RawRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self { method, uri, headers, body: body.into() }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &Bytes { &self.body }

    /// Case-insensitive header lookup. Non-UTF-8 values are treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(http::header::CONTENT_TYPE.as_str())
    }
}

/// A request as handed to handlers: routed, parsed, immutable.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) params: HashMap<String, String>,
    pub(crate) headers: HeaderMap,
    pub(crate) cookies: BTreeMap<String, String>,
    pub(crate) body: Option<Value>,
    pub(crate) query: HashMap<String, String>,
}

impl ProcessedRequest {
    pub(crate) fn new(
        raw: RawRequest,
        url: &Uri,
        params: HashMap<String, String>,
        body: Option<Value>,
    ) -> Self {
        let cookies = parse_cookies(&raw.headers);
        let query = parse_query(url.query());
        Self {
            method: raw.method,
            path: url.path().to_owned(),
            params,
            headers: raw.headers,
            cookies,
            body,
            query,
        }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn path(&self) -> &str { &self.path }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn params(&self) -> &HashMap<String, String> { &self.params }
    pub fn query_params(&self) -> &HashMap<String, String> { &self.query }
    pub fn cookies(&self) -> &BTreeMap<String, String> { &self.cookies }

    /// The parsed body, or `None` when the request had none or parsing failed.
    pub fn body(&self) -> Option<&Value> { self.body.as_ref() }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns a query-string parameter. Repeated keys keep the last value.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return HashMap::new();
    };
    match serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
        Ok(pairs) => pairs.into_iter().collect(),
        Err(e) => {
            tracing::debug!(error = %e, "malformed query string ignored");
            HashMap::new()
        }
    }
}

fn parse_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((name.to_owned(), value.to_owned()))
        })
        .collect()
}
