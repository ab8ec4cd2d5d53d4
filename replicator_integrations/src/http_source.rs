//! Generic cursor-paginated JSON source over HTTP.
//!
//! Concrete replicators compose this for `fetchPage` (backfill), `fetchOne`
//! (enrichment) and `verifyCredentials` (onboarding). Every request carries the
//! client timeout; a timeout, transport failure, non-success status or
//! malformed body surfaces as `Error::UpstreamFetch`.

use async_trait::async_trait;
use replicator_core::models::{Cursor, ServiceIntegration};
use replicator_core::replicator::traits::{BackfillSource, CredentialVerifier, Page, PageRequest};
use replicator_core::{Error, Result};
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use tracing::instrument;

/// How requests authenticate against the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

impl HttpAuth {
    /// Key and secret become basic auth; a key alone is a bearer token.
    pub fn from_integration(integration: &ServiceIntegration) -> Self {
        let key = integration
            .backfill_key
            .as_deref()
            .filter(|s| !s.trim().is_empty());
        let secret = integration
            .backfill_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty());
        match (key, secret) {
            (Some(key), Some(secret)) => HttpAuth::Basic {
                username: key.to_string(),
                password: secret.to_string(),
            },
            (Some(key), None) => HttpAuth::Bearer(key.to_string()),
            (None, Some(secret)) => HttpAuth::Bearer(secret.to_string()),
            (None, None) => HttpAuth::None,
        }
    }

    fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            HttpAuth::None => req,
            HttpAuth::Bearer(token) => req.bearer_auth(token),
            HttpAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
            HttpAuth::Header { name, value } => req.header(name.as_str(), value.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    /// Paginated list endpoint, e.g. `/v1/orders`.
    pub list_path: String,
    /// Single-item endpoint with an `{id}` placeholder, e.g. `/v1/orders/{id}`.
    pub item_path: Option<String>,
    /// Cheap authenticated endpoint used to verify credentials.
    pub verify_path: Option<String>,
    /// JSON pointer to the items array in a list response (`""` = the body itself).
    pub items_pointer: String,
    /// JSON pointer to the next cursor in a list response.
    pub cursor_pointer: String,
    /// Query parameter carrying the cursor.
    pub cursor_param: String,
    /// Query parameter set to `true` on incremental runs.
    pub incremental_param: Option<String>,
    pub page_size: Option<(String, u32)>,
    pub auth: HttpAuth,
    pub timeout: Duration,
}

impl HttpSourceConfig {
    pub fn new(base_url: impl Into<String>, list_path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            list_path: list_path.into(),
            item_path: None,
            verify_path: None,
            items_pointer: "/data".to_string(),
            cursor_pointer: "/next_cursor".to_string(),
            cursor_param: "cursor".to_string(),
            incremental_param: None,
            page_size: None,
            auth: HttpAuth::None,
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_item_path(mut self, path: impl Into<String>) -> Self {
        self.item_path = Some(path.into());
        self
    }

    pub fn with_verify_path(mut self, path: impl Into<String>) -> Self {
        self.verify_path = Some(path.into());
        self
    }

    pub fn with_pointers(mut self, items: impl Into<String>, cursor: impl Into<String>) -> Self {
        self.items_pointer = items.into();
        self.cursor_pointer = cursor.into();
        self
    }

    pub fn with_cursor_param(mut self, param: impl Into<String>) -> Self {
        self.cursor_param = param.into();
        self
    }

    pub fn with_incremental_param(mut self, param: impl Into<String>) -> Self {
        self.incremental_param = Some(param.into());
        self
    }

    pub fn with_page_size(mut self, param: impl Into<String>, size: u32) -> Self {
        self.page_size = Some((param.into(), size));
        self
    }

    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Settings shared by an integration: `api_url` overrides `base_url`, credentials set auth.
    pub fn for_integration(mut self, integration: &ServiceIntegration) -> Self {
        if let Some(url) = integration.api_url.as_deref().filter(|s| !s.trim().is_empty()) {
            self.base_url = url.trim_end_matches('/').to_string();
        }
        self.auth = HttpAuth::from_integration(integration);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(Error::InvalidInput(format!(
                "base_url must be an http(s) url: '{}'",
                self.base_url
            )));
        }
        if !self.list_path.starts_with('/') {
            return Err(Error::InvalidInput("list_path must start with '/'".to_string()));
        }
        if self.cursor_param.trim().is_empty() {
            return Err(Error::InvalidInput("cursor_param is empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidInput("timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct HttpPagedSource {
    client: Client,
    config: HttpSourceConfig,
}

impl HttpPagedSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpSourceConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Fetch one item (enrichment). `id` is substituted into `item_path`.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_one(&self, id: &str) -> Result<serde_json::Value> {
        let Some(template) = self.config.item_path.as_deref() else {
            return Err(Error::InvalidInput("item_path is not configured".to_string()));
        };
        if id.is_empty() || id.contains(['/', '?', '#', ' ']) {
            return Err(Error::InvalidInput(format!("unsafe item id '{id}'")));
        }
        let req = self.client.get(self.url(&template.replace("{id}", id)));
        let resp = send(self.config.auth.apply(req)).await?;
        read_json(resp).await
    }

    #[instrument(level = "debug", skip(self, auth))]
    async fn check_access(&self, auth: &HttpAuth) -> Result<()> {
        let path = self.config.verify_path.as_deref().unwrap_or(&self.config.list_path);
        let mut req = self.client.get(self.url(path));
        if let Some((param, _)) = &self.config.page_size {
            req = req.query(&[(param.as_str(), "1")]);
        }
        send(auth.apply(req)).await?;
        Ok(())
    }
}

#[async_trait]
impl BackfillSource for HttpPagedSource {
    #[instrument(level = "debug", skip(self, request), fields(has_cursor = request.cursor.is_some()))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let mut query: Vec<(String, String)> = Vec::new();
        if let Some(cursor) = &request.cursor {
            query.push((self.config.cursor_param.clone(), cursor_param_value(cursor)));
        }
        if let (true, Some(param)) = (request.incremental, &self.config.incremental_param) {
            query.push((param.clone(), "true".to_string()));
        }
        if let Some((param, size)) = &self.config.page_size {
            query.push((param.clone(), size.to_string()));
        }

        let req = self.client.get(self.url(&self.config.list_path)).query(&query);
        let body = read_json(send(self.config.auth.apply(req)).await?).await?;
        parse_page(&body, &self.config.items_pointer, &self.config.cursor_pointer)
    }
}

#[async_trait]
impl CredentialVerifier for HttpPagedSource {
    async fn verify(&self, integration: &ServiceIntegration) -> Result<()> {
        self.check_access(&HttpAuth::from_integration(integration)).await
    }
}

async fn send(req: RequestBuilder) -> Result<Response> {
    let resp = req
        .send()
        .await
        .map_err(|e| Error::upstream(e.status().map(|s| s.as_u16()), e.to_string()))?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(Error::upstream(
        Some(status.as_u16()),
        format!("{} {}", status, snippet).trim().to_string(),
    ))
}

async fn read_json(resp: Response) -> Result<serde_json::Value> {
    let status = resp.status().as_u16();
    resp.json()
        .await
        .map_err(|e| Error::upstream(Some(status), format!("invalid json body: {e}")))
}

fn cursor_param_value(cursor: &Cursor) -> String {
    match &cursor.value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_page(body: &serde_json::Value, items_pointer: &str, cursor_pointer: &str) -> Result<Page> {
    let items = body
        .pointer(items_pointer)
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| {
            Error::upstream(None, format!("response has no items array at '{items_pointer}'"))
        })?;
    let next_cursor = body
        .pointer(cursor_pointer)
        .filter(|v| !v.is_null())
        .cloned()
        .map(Cursor::new);
    Ok(Page::new(items, next_cursor))
}
