//! Bearer-token authentication.
//!
//! Tokens are never interpreted locally; they are handed to an
//! [`IdentityProvider`] which answers with the user id they belong to.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::api::ApiState;
use crate::config::Config;
use crate::error::ApiError;

/// Upper bound on one token lookup against the identity provider.
const IDENTITY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("identity provider error: {0}")]
    Provider(String),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns the id of the user `token` was issued to.
    async fn verify(&self, token: &str) -> Result<String, AuthError>;
}

pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl IdentityProvider for StaticTokens {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Forwards the token to `GET {base_url}/user` and reads the `id` field of
/// the reply.
pub struct RemoteIdentity {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
}

impl RemoteIdentity {
    pub fn new(base_url: String) -> reqwest::Result<Self> {
        Self::with_timeout(base_url, IDENTITY_TIMEOUT)
    }

    pub fn with_timeout(base_url: String, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl IdentityProvider for RemoteIdentity {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        let resp = self
            .client
            .get(format!("{}/user", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Provider(e.to_string()))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(AuthError::InvalidToken),
            status if !status.is_success() => {
                return Err(AuthError::Provider(format!("unexpected status {status}")))
            }
            _ => {}
        }

        let user: UserResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        Ok(user.id)
    }
}

/// Tries each provider in order. A provider that rejects the token passes it
/// on to the next; a provider that fails outright stops the chain.
pub struct IdentityChain {
    providers: Vec<Box<dyn IdentityProvider>>,
}

impl IdentityChain {
    pub fn new(providers: Vec<Box<dyn IdentityProvider>>) -> Self {
        Self { providers }
    }

    pub fn from_config(config: &Config) -> reqwest::Result<Self> {
        let mut providers: Vec<Box<dyn IdentityProvider>> = Vec::new();
        if !config.static_tokens.is_empty() {
            log::warn!(
                "accepting {} static bearer token(s); do not use in production",
                config.static_tokens.len()
            );
            providers.push(Box::new(StaticTokens::new(config.static_tokens.clone())));
        }
        if let Some(url) = &config.auth_provider_url {
            log::info!("verifying bearer tokens against {url}");
            providers.push(Box::new(RemoteIdentity::new(url.clone())?));
        }
        Ok(Self::new(providers))
    }
}

#[async_trait]
impl IdentityProvider for IdentityChain {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        for provider in &self.providers {
            match provider.verify(token).await {
                Err(AuthError::InvalidToken) => continue,
                other => return other,
            }
        }
        Err(AuthError::InvalidToken)
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
}

#[async_trait]
impl FromRequestParts<ApiState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let id = state.identity.verify(token).await?;
        Ok(AuthUser { id })
    }
}
