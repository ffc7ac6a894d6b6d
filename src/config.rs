use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://flashcards.db?mode=rwc";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub auth_provider_url: Option<String>,
    /// token -> user id, for local development and tests.
    pub static_tokens: HashMap<String, String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let listen_addr = var("LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:3000".to_string())
            .parse::<SocketAddr>()
            .context("LISTEN_ADDR is not a socket address")?;

        let auth_provider_url = var("AUTH_PROVIDER_URL").map(|u| u.trim_end_matches('/').to_string());

        let static_tokens = match var("AUTH_STATIC_TOKENS") {
            Some(raw) => parse_static_tokens(&raw)?,
            None => HashMap::new(),
        };

        if auth_provider_url.is_none() && static_tokens.is_empty() {
            bail!("no identity source configured: set AUTH_PROVIDER_URL or AUTH_STATIC_TOKENS");
        }

        let gemini_api_key = var("GEMINI_API_KEY");
        let gemini_model = var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string());

        Ok(Self {
            database_url,
            listen_addr,
            auth_provider_url,
            static_tokens,
            gemini_api_key,
            gemini_model,
        })
    }
}

fn parse_static_tokens(raw: &str) -> Result<HashMap<String, String>> {
    let mut tokens = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (token, user) = pair
            .split_once(':')
            .with_context(|| format!("AUTH_STATIC_TOKENS entry '{pair}' is not token:user_id"))?;
        let (token, user) = (token.trim(), user.trim());
        if token.is_empty() || user.is_empty() {
            bail!("AUTH_STATIC_TOKENS entry '{pair}' has an empty side");
        }
        tokens.insert(token.to_string(), user.to_string());
    }
    Ok(tokens)
}
