mod api;
mod auth;
mod config;
mod db;
mod error;
mod llm;
mod models;
mod srs;

use std::sync::Arc;

use anyhow::Result;
use api::{app_router, ApiState};
use auth::IdentityChain;
use config::Config;
use db::Db;
use llm::{CompletionProvider, GeminiClient};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; deployments set the environment directly.
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;

    let db = Db::connect(&config.database_url).await?;
    log::info!("database ready at {}", config.database_url);

    let llm = match config.gemini_api_key.clone() {
        Some(key) => {
            log::info!("chat enabled with model {}", config.gemini_model);
            let client = GeminiClient::new(key, config.gemini_model.clone())?;
            Some(Arc::new(client) as Arc<dyn CompletionProvider>)
        }
        None => None,
    };
    if llm.is_none() {
        log::warn!("GEMINI_API_KEY not set; chat endpoints are disabled");
    }

    let state = ApiState {
        db,
        identity: Arc::new(IdentityChain::from_config(&config)?),
        llm,
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    log::info!("listening on {}", config.listen_addr);

    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {e}");
    }
}
