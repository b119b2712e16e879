//! REST adapter: HTTP calls routed through a [`RequestExecutor`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::Invalidation;
use crate::config::NetConfig;
use crate::error::{ConfigError, NetError};
use crate::executor::{CallContext, ExecuteOptions, Operation, RequestExecutor};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    pub fn is_mutation(self) -> bool {
        !matches!(self, Self::Get)
    }

    /// Safe to repeat after a transient failure.
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::Get | Self::Put | Self::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Path relative to the service base URL, e.g. `/airlines/7`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), query: Vec::new(), body: None }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Executor arguments; equal requests produce equal cache keys.
    ///
    /// The query becomes sorted `[key, value]` pairs, so repeated keys stay
    /// distinct and parameter order does not matter.
    fn args(&self) -> Vec<Value> {
        let mut pairs: Vec<&(String, String)> = self.query.iter().collect();
        pairs.sort();
        let query = pairs
            .into_iter()
            .map(|(key, value)| Value::Array(vec![Value::String(key.clone()), Value::String(value.clone())]))
            .collect();
        match &self.body {
            Some(body) => vec![Value::Array(query), body.clone()],
            None => vec![Value::Array(query)],
        }
    }
}

/// Sends one HTTP request and classifies the outcome into [`NetError`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest, cancel: CancellationToken) -> Result<Value, NetError>;
}

/// [`HttpTransport`] over `reqwest`.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    base_url: String,
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, NetError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| NetError::connection(format!("http client: {err}")))?;
        Ok(Self::with_client(base_url, http))
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self { base_url: base_url.into(), http }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest, cancel: CancellationToken) -> Result<Value, NetError> {
        let url = join_url(&self.base_url, &request.path);
        let mut builder = self
            .http
            .request(request.method.into(), &url)
            .header("accept", "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetError::Aborted),
            response = builder.send() => response,
        }
        .map_err(|err| NetError::transient(format!("{} {url}: {err}", request.method)))?;

        let status = response.status();
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetError::Aborted),
            text = response.text() => text,
        }
        .map_err(|err| NetError::transient(format!("{} {url}: reading body: {err}", request.method)))?;

        if !status.is_success() {
            log::debug!("rest: {} {url} status={}", request.method, status.as_u16());
            return Err(NetError::from_status(status.as_u16(), error_message(&text, status)));
        }
        decode_body(text)
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn decode_body(text: String) -> Result<Value, NetError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|err| NetError::decode(err.to_string(), text))
}

/// Prefers a `message` field from a JSON error body.
fn error_message(body: &str, status: reqwest::StatusCode) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_owned()
            } else {
                body.trim().to_owned()
            }
        })
}

/// One REST service behind the request executor.
///
/// Reads are cached and deduplicated. A successful write drops every cached
/// read of the same top-level resource.
#[derive(Clone)]
pub struct RestClient {
    service: String,
    executor: RequestExecutor,
    transport: Arc<dyn HttpTransport>,
}

impl RestClient {
    pub fn new(
        service: impl Into<String>,
        executor: RequestExecutor,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self { service: service.into(), executor, transport }
    }

    /// Client for `service` as listed under `[services]`.
    pub fn from_config(
        config: &NetConfig,
        service: &str,
        executor: RequestExecutor,
    ) -> Result<Self, ConfigError> {
        let base_url = config
            .service_url(service)
            .ok_or_else(|| ConfigError::invalid("services", format!("unknown service '{service}'")))?;
        let transport = ReqwestTransport::new(base_url)
            .map_err(|err| ConfigError::invalid("services", err.to_string()))?;
        Ok(Self::new(service, executor, Arc::new(transport)))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn context(&self) -> CallContext {
        self.executor.context()
    }

    /// Operation id used in cache keys, e.g. `flights:GET /airlines`.
    pub fn operation_id(&self, method: HttpMethod, path: &str) -> String {
        format!("{}:{method} {path}", self.service)
    }

    /// Operation id of the top-level resource `path` belongs to.
    pub fn resource_prefix(&self, path: &str) -> String {
        let resource = path.trim_start_matches('/').split(['/', '?']).next().unwrap_or_default();
        self.operation_id(HttpMethod::Get, &format!("/{resource}"))
    }

    /// Drops cached reads of the resource and of paths below it, but not of
    /// siblings sharing a name prefix (`/airline` spares `/airlines`).
    pub fn invalidate_resource(&self, path: &str) -> usize {
        let prefix = self.resource_prefix(path);
        [format!("{prefix}:"), format!("{prefix}/")]
            .into_iter()
            .map(|boundary| self.executor.invalidate(&Invalidation::Prefix(boundary)))
            .sum()
    }

    pub async fn execute(
        &self,
        ctx: &CallContext,
        request: HttpRequest,
        options: &ExecuteOptions,
    ) -> Result<Option<Value>, NetError> {
        let method = request.method;
        let path = request.path.clone();
        let operation_id = self.operation_id(method, &path);
        let args = request.args();

        let mut options = options.clone();
        if method.is_mutation() {
            options.cache = false;
        }
        if !method.is_idempotent() {
            options.retry_attempts = 0;
        }

        let transport = Arc::clone(&self.transport);
        let operation: Arc<dyn Operation> =
            Arc::new(move |_args: Vec<Value>, cancel: CancellationToken| {
                let transport = Arc::clone(&transport);
                let request = request.clone();
                async move { transport.send(request, cancel).await }
            });

        let result = ctx.execute(&operation_id, operation, args, &options).await;
        // Superseded or cancelled writes may never have reached the server.
        if method.is_mutation() && matches!(result, Ok(Some(_))) {
            let removed = self.invalidate_resource(&path);
            log::debug!("rest: {method} {path} invalidated={removed}");
        }
        result
    }

    pub async fn get(
        &self,
        ctx: &CallContext,
        path: &str,
        query: Vec<(String, String)>,
    ) -> Result<Option<Value>, NetError> {
        let request = HttpRequest::new(HttpMethod::Get, path).with_query(query);
        self.execute(ctx, request, self.executor.defaults()).await
    }

    pub async fn post(&self, ctx: &CallContext, path: &str, body: Value) -> Result<Option<Value>, NetError> {
        let request = HttpRequest::new(HttpMethod::Post, path).with_body(body);
        self.execute(ctx, request, self.executor.defaults()).await
    }

    pub async fn put(&self, ctx: &CallContext, path: &str, body: Value) -> Result<Option<Value>, NetError> {
        let request = HttpRequest::new(HttpMethod::Put, path).with_body(body);
        self.execute(ctx, request, self.executor.defaults()).await
    }

    pub async fn patch(&self, ctx: &CallContext, path: &str, body: Value) -> Result<Option<Value>, NetError> {
        let request = HttpRequest::new(HttpMethod::Patch, path).with_body(body);
        self.execute(ctx, request, self.executor.defaults()).await
    }

    pub async fn delete(&self, ctx: &CallContext, path: &str) -> Result<Option<Value>, NetError> {
        let request = HttpRequest::new(HttpMethod::Delete, path);
        self.execute(ctx, request, self.executor.defaults()).await
    }
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient").field("service", &self.service).finish_non_exhaustive()
    }
}
