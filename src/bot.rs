use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::net::Download;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::{FileId, LinkPreviewOptions, ParseMode};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::converter;
use crate::session::{Action, Event, PublishMode, Session};
use crate::twitter::Publisher;

const AUDIO_ACK: &str = "We received the voice note. Please wait a few seconds while we \
    send it to Twitter. Please don't send me anything else until you receive a reply from me.";

const DOWNLOAD_FAILED: &str = "The voice note could not be downloaded. Please try again.";

const CONVERT_FAILED: &str =
    "The audio could not be converted to a video. Please try again.";

const PUBLISH_FAILED: &str =
    "Audio could not be sent. Please check that you can send DM to that user.";

/// Shared application state
pub struct AppState {
    config: Mutex<Config>,
    config_path: PathBuf,
    session: Mutex<Session>,
    publisher: Box<dyn Publisher>,
    media_dir: PathBuf,
}

impl AppState {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        publisher: Box<dyn Publisher>,
        link_code: Option<String>,
    ) -> Self {
        let session = Session::new(config.telegram.linked_user_id, link_code);
        let media_dir = config.media.directory.clone();
        Self {
            config: Mutex::new(config),
            config_path,
            session: Mutex::new(session),
            publisher,
            media_dir,
        }
    }
}

/// Start the Telegram side of the bridge
pub async fn run(bot: Bot, state: Arc<AppState>) -> Result<()> {
    info!("Starting Telegram dispatcher...");

    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("bot"))
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let user = match msg.from.as_ref() {
        Some(user) => user,
        None => return Ok(()),
    };
    let sender_id = user.id.0;

    // Voice notes and audio files carry the same payload shape.
    let event = if let Some(voice) = msg.voice() {
        Event::Audio {
            file_id: voice.file.id.0.clone(),
            duration_secs: voice.duration.seconds(),
        }
    } else if let Some(audio) = msg.audio() {
        Event::Audio {
            file_id: audio.file.id.0.clone(),
            duration_secs: audio.duration.seconds(),
        }
    } else if let Some(text) = msg.text() {
        Event::Text(text.to_string())
    } else {
        return Ok(());
    };

    let action = {
        let mut session = state.session.lock().await;
        session.handle_event(sender_id, event)
    };

    match action {
        Action::None => {}
        Action::Reply(text) => {
            bot.send_message(msg.chat.id, text).await?;
        }
        Action::ReplyMarkdown(text) => {
            bot.send_message(msg.chat.id, text)
                .parse_mode(ParseMode::Markdown)
                .link_preview_options(disabled_link_preview())
                .await?;
        }
        Action::Linked { user_id, reply } => {
            info!("Bot linked to user {} ({})", user_id, user.first_name);
            {
                let mut config = state.config.lock().await;
                config.telegram.linked_user_id = Some(user_id);
                if let Err(e) = config.save(&state.config_path) {
                    error!("Failed to persist linked user: {:#}", e);
                }
            }
            bot.send_message(msg.chat.id, reply).await?;
        }
        Action::Resolve { tweet_id } => match state.publisher.resolve(tweet_id).await {
            Ok(Some(tweet)) => {
                {
                    let mut session = state.session.lock().await;
                    session.set_reply_target(tweet_id, &tweet.author);
                }
                bot.send_message(
                    msg.chat.id,
                    format!(
                        "Now replying to: @{}: {}\nTo post the audio as a Tweet instead \
                         of a reply, send \"/cancel\"",
                        tweet.author, tweet.text
                    ),
                )
                .await?;
            }
            Ok(None) => {
                bot.send_message(msg.chat.id, "The Tweet you sent seems to not exist.")
                    .await?;
            }
            Err(e) => {
                error!("Failed to look up tweet {}: {:#}", tweet_id, e);
                bot.send_message(msg.chat.id, "Could not look up that Tweet. Please try again.")
                    .await?;
            }
        },
        Action::PublishAudio {
            file_id,
            duration_secs,
        } => {
            bot.send_message(msg.chat.id, AUDIO_ACK).await?;
            let report = publish_audio(&bot, &state, &file_id, duration_secs).await;
            bot.send_message(msg.chat.id, report).await?;
        }
    }

    Ok(())
}

/// Downloads, converts and publishes one voice note, returning the
/// user-facing report. Each pipeline stage maps its failure to its own
/// message; temp files are removed whether or not the publish succeeded.
async fn publish_audio(bot: &Bot, state: &AppState, file_id: &str, duration_secs: u32) -> String {
    let ogg = state.media_dir.join(format!("{file_id}.ogg"));

    let report = match download_voice(bot, file_id, &ogg).await {
        Ok(()) => convert_and_publish(state, &ogg, duration_secs).await,
        Err(e) => {
            error!("Failed to download voice note {}: {:#}", file_id, e);
            DOWNLOAD_FAILED.to_string()
        }
    };

    let _ = tokio::fs::remove_file(&ogg).await;
    let _ = tokio::fs::remove_file(ogg.with_extension("mp4")).await;

    report
}

async fn download_voice(bot: &Bot, file_id: &str, dest: &Path) -> Result<()> {
    let tg_file = bot
        .get_file(FileId(file_id.to_string()))
        .await
        .context("Failed to query voice file")?;

    let mut out = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create temp file: {}", dest.display()))?;
    bot.download_file(&tg_file.path, &mut out)
        .await
        .context("Failed to download voice file")?;

    Ok(())
}

async fn convert_and_publish(state: &AppState, ogg: &Path, duration_secs: u32) -> String {
    let mp4 = match converter::convert(ogg, duration_secs).await {
        Ok(path) => path,
        Err(e) => {
            error!("Failed to convert {}: {:#}", ogg.display(), e);
            return CONVERT_FAILED.to_string();
        }
    };

    let (mode, caption) = {
        let session = state.session.lock().await;
        (session.publish_mode(), session.caption().to_string())
    };

    let outcome = match &mode {
        PublishMode::Tweet => state.publisher.post(&mp4, &caption).await.map(Some),
        PublishMode::Reply { target_id, .. } => state
            .publisher
            .reply(*target_id, &mp4, &caption)
            .await
            .map(Some),
        PublishMode::Dm(user) => state.publisher.dm(user, &mp4, &caption).await.map(|_| None),
    };

    match outcome {
        Ok(tweet_id) => {
            state.session.lock().await.clear_caption();
            if let Some(id) = tweet_id {
                info!("Posted tweet {}", id);
            }
            match mode {
                PublishMode::Tweet => {
                    "Audio sent as a new Tweet. Tweet text is now empty.".to_string()
                }
                PublishMode::Reply { author, .. } => format!(
                    "Audio sent as a reply to @{author}. Send \"/cancel\" to exit reply \
                     mode. Tweet text is now empty."
                ),
                PublishMode::Dm(user) => format!(
                    "Audio sent as a DM to @{user}. Send /dm with no user to exit DM \
                     mode. Tweet text is now empty."
                ),
            }
        }
        Err(e) => {
            // No retry; the user decides whether to resend.
            error!("Publish failed: {:#}", e);
            PUBLISH_FAILED.to_string()
        }
    }
}

fn disabled_link_preview() -> LinkPreviewOptions {
    LinkPreviewOptions {
        is_disabled: true,
        url: None,
        prefer_small_media: false,
        prefer_large_media: false,
        show_above_text: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaConfig, TelegramConfig, TwitterConfig};
    use crate::twitter::ResolvedTweet;
    use async_trait::async_trait;

    struct RefusingPublisher;

    #[async_trait]
    impl Publisher for RefusingPublisher {
        async fn verify(&self) -> Result<String> {
            anyhow::bail!("not wired up")
        }
        async fn resolve(&self, _tweet_id: u64) -> Result<Option<ResolvedTweet>> {
            anyhow::bail!("not wired up")
        }
        async fn post(&self, _media: &Path, _caption: &str) -> Result<String> {
            anyhow::bail!("refused")
        }
        async fn reply(&self, _target_id: u64, _media: &Path, _caption: &str) -> Result<String> {
            anyhow::bail!("refused")
        }
        async fn dm(&self, _handle: &str, _media: &Path, _caption: &str) -> Result<()> {
            anyhow::bail!("refused")
        }
    }

    fn test_state(dir: &Path) -> AppState {
        let config = Config {
            telegram: TelegramConfig {
                bot_token: "123:token".to_string(),
                linked_user_id: Some(42),
            },
            twitter: TwitterConfig {
                access_token: "tw-token".to_string(),
                api_base: "https://api.invalid".to_string(),
            },
            media: MediaConfig {
                directory: dir.to_path_buf(),
            },
        };
        AppState::new(
            config,
            dir.join("config.toml"),
            Box::new(RefusingPublisher),
            None,
        )
    }

    #[tokio::test]
    async fn test_unconvertible_audio_reports_conversion_failure() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        // No such input file, so ffmpeg (present or not) cannot produce
        // a video; the user must hear about the conversion, not the send.
        let report = convert_and_publish(&state, &dir.path().join("missing.ogg"), 10).await;
        assert_eq!(report, CONVERT_FAILED);
        assert_ne!(report, PUBLISH_FAILED);
    }
}
