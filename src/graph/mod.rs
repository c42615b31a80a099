//! Authenticated JSON transport for the Microsoft Graph lists API.

pub mod retry;

use std::future::Future;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::auth::{TokenCache, TokenProvider};
use crate::error::StoreError;

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, starting with `/`.
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Sends one request and yields the parsed JSON body, `None` for an empty
/// success (`204 No Content`), or a typed error carrying status and body.
pub trait Transport {
    fn send(
        &self,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;
}

/// Request paths for one list on one site.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ListEndpoints {
    site_id: String,
    list_id: String,
}

impl ListEndpoints {
    pub fn new(site_id: impl Into<String>, list_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            list_id: list_id.into(),
        }
    }

    fn list_root(&self) -> String {
        format!(
            "/sites/{}/lists/{}",
            urlencoding::encode(&self.site_id),
            urlencoding::encode(&self.list_id)
        )
    }

    pub fn columns(&self) -> String {
        format!("{}/columns?$select=name,displayName", self.list_root())
    }

    pub fn items(&self, page_size: u32) -> String {
        format!("{}/items?$top={page_size}&$expand=fields", self.list_root())
    }

    pub fn create_item(&self) -> String {
        format!("{}/items", self.list_root())
    }

    pub fn item(&self, item_id: &str) -> String {
        format!("{}/items/{}", self.list_root(), urlencoding::encode(item_id))
    }

    pub fn item_fields(&self, item_id: &str) -> String {
        format!("{}/fields", self.item(item_id))
    }
}

pub struct GraphClient<P> {
    http: Client,
    base_url: String,
    tokens: TokenCache<P>,
}

impl<P: TokenProvider + Sync> GraphClient<P> {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        provider: P,
    ) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("cockpit-tasks/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| StoreError::Transport(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens: TokenCache::new(provider),
        })
    }
}

impl<P: TokenProvider + Sync> Transport for GraphClient<P> {
    async fn send(&self, request: &ApiRequest) -> Result<Option<Value>, StoreError> {
        let token = self.tokens.bearer().await?;
        let url = format!("{}{}", self.base_url, request.path);
        debug!(method = %request.method, path = %request.path, "graph request");

        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json");
        if let Some(body) = request.body.as_ref() {
            builder = builder.header(CONTENT_TYPE, "application/json").json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| StoreError::Transport(format!("{} {}: {err}", request.method, url)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| StoreError::Transport(format!("failed reading response: {err}")))?;

        // A rejected bearer is not reused; the next request acquires a new one.
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.forget();
        }
        decode_response(status, &text)
    }
}

fn decode_response(status: StatusCode, text: &str) -> Result<Option<Value>, StoreError> {
    if !status.is_success() {
        return Err(StoreError::Http {
            status: status.as_u16(),
            body: text.to_string(),
        });
    }

    if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(text)
        .map(Some)
        .map_err(|err| StoreError::InvalidResponse(format!("HTTP {}: {err}", status.as_u16())))
}
