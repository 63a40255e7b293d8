mod bot;
mod config;
mod converter;
mod session;
mod twitter;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::{distr::Alphanumeric, Rng};
use teloxide::prelude::*;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::AppState;
use crate::config::Config;
use crate::twitter::{Publisher, TwitterClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,audiotweet=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Both APIs must accept the credentials before the bot starts.
    let bot = Bot::new(&config.telegram.bot_token);
    let me = bot.get_me().await.context("Invalid Telegram API key")?;
    info!("Connected to Telegram: @{}", me.username());

    let twitter = TwitterClient::new(config.twitter.clone());
    let handle = twitter
        .verify()
        .await
        .context("Invalid Twitter credentials")?;
    info!("Connected to Twitter: @{}", handle);

    let link_code = match config.telegram.linked_user_id {
        Some(user_id) => {
            info!("Bot is linked to Telegram user {}", user_id);
            None
        }
        None => {
            let code: String = rand::rng()
                .sample_iter(Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            info!(
                "Bot is not linked yet. Send this code to the bot on Telegram: {}",
                code
            );
            Some(code)
        }
    };

    let state = Arc::new(AppState::new(
        config,
        config_path,
        Box::new(twitter),
        link_code,
    ));

    info!("Bot is starting...");
    bot::run(bot, state).await?;

    Ok(())
}
