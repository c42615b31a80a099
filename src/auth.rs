//! Access-token acquisition and in-memory caching.
//!
//! The interactive delegated sign-in happens elsewhere; this module starts
//! from either an issued access token or a refresh token.

use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Tokens are renewed once fewer than this many seconds of validity remain.
pub const EARLY_EXPIRY_MARGIN_SECS: i64 = 30;

/// Lifetime assumed for tokens handed over without an expiry.
const ASSUMED_TOKEN_LIFETIME_MINUTES: i64 = 45;

pub const GRAPH_SCOPES: &str = "User.Read Sites.ReadWrite.All offline_access";

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - TimeDelta::seconds(EARLY_EXPIRY_MARGIN_SECS)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub trait TokenProvider {
    fn acquire(&self) -> impl Future<Output = Result<AccessToken, StoreError>> + Send;
}

/// Caches the provider's token until it is within the early-expiry margin.
pub struct TokenCache<P> {
    provider: P,
    cached: Mutex<Option<AccessToken>>,
}

impl<P: TokenProvider + Sync> TokenCache<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
        }
    }

    pub async fn bearer(&self) -> Result<String, StoreError> {
        self.bearer_at(Utc::now()).await
    }

    pub async fn bearer_at(&self, now: DateTime<Utc>) -> Result<String, StoreError> {
        if let Some(token) = self.current().filter(|token| token.is_fresh_at(now)) {
            return Ok(token.secret);
        }

        debug!("acquiring access token");
        let token = self.provider.acquire().await?;
        let secret = token.secret.clone();
        self.store(Some(token));
        Ok(secret)
    }

    pub fn forget(&self) {
        self.store(None);
    }

    fn current(&self) -> Option<AccessToken> {
        match self.cached.lock() {
            Ok(cached) => cached.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self, token: Option<AccessToken>) {
        match self.cached.lock() {
            Ok(mut cached) => *cached = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

/// A token obtained out of band, e.g. pasted from a browser session.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    secret: String,
}

impl StaticTokenProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    async fn acquire(&self) -> Result<AccessToken, StoreError> {
        if self.secret.trim().is_empty() {
            return Err(StoreError::Auth("access token is empty".to_string()));
        }
        Ok(AccessToken {
            secret: self.secret.clone(),
            expires_at: Utc::now() + TimeDelta::minutes(ASSUMED_TOKEN_LIFETIME_MINUTES),
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Redeems a refresh token against the Microsoft identity platform.
pub struct RefreshTokenProvider {
    http: Client,
    token_url: String,
    client_id: String,
    refresh_token: Mutex<String>,
}

impl RefreshTokenProvider {
    pub fn new(
        http: Client,
        tenant_id: &str,
        client_id: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                urlencoding::encode(tenant_id)
            ),
            client_id: client_id.into(),
            refresh_token: Mutex::new(refresh_token.into()),
        }
    }

    fn current_refresh_token(&self) -> String {
        match self.refresh_token.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn rotate_refresh_token(&self, next: String) {
        match self.refresh_token.lock() {
            Ok(mut token) => *token = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

impl TokenProvider for RefreshTokenProvider {
    async fn acquire(&self) -> Result<AccessToken, StoreError> {
        let refresh_token = self.current_refresh_token();
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("scope", GRAPH_SCOPES),
            ])
            .send()
            .await
            .map_err(|err| StoreError::Auth(format!("token request failed: {err}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| StoreError::Auth(format!("token response unreadable: {err}")))?;

        if !status.is_success() {
            let message = format_oauth_error(status.as_u16(), &text);
            warn!(status = status.as_u16(), "token refresh rejected");
            return Err(StoreError::Auth(message));
        }

        let token: TokenResponse = serde_json::from_str(&text)
            .map_err(|err| StoreError::Auth(format!("token response unreadable: {err}")))?;
        if let Some(next) = token.refresh_token {
            self.rotate_refresh_token(next);
        }

        Ok(AccessToken {
            secret: token.access_token,
            expires_at: Utc::now() + TimeDelta::seconds(token.expires_in.max(0)),
        })
    }
}

/// Credential source chosen from settings.
pub enum Credentials {
    Static(StaticTokenProvider),
    Refresh(RefreshTokenProvider),
}

impl TokenProvider for Credentials {
    async fn acquire(&self) -> Result<AccessToken, StoreError> {
        match self {
            Credentials::Static(provider) => provider.acquire().await,
            Credentials::Refresh(provider) => provider.acquire().await,
        }
    }
}

fn format_oauth_error(status: u16, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {status}");
    }

    let summary = match serde_json::from_str::<TokenErrorResponse>(trimmed) {
        Ok(TokenErrorResponse {
            error,
            error_description: Some(description),
        }) => format!("{description} ({error})"),
        Ok(TokenErrorResponse { error, .. }) => error,
        Err(_) => truncate_error(trimmed),
    };
    format!("HTTP {status}: {summary}")
}

fn truncate_error(message: &str) -> String {
    let mut out = message.replace(['\n', '\r'], " ");
    if out.len() > 240 {
        let mut cut = 240;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        out.push_str("...");
    }
    out
}
