use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TwitterConfig;

/// Author and body of a tweet looked up for reply mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTweet {
    pub author: String,
    pub text: String,
}

/// The posting side of the bridge. Split out as a trait so the
/// dispatcher wiring can be exercised without the live API.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Validates the credentials; returns the account handle.
    async fn verify(&self) -> Result<String>;

    /// Looks up a tweet by id. `Ok(None)` means the tweet does not
    /// exist (or is not visible); `Err` is a transport/API failure.
    async fn resolve(&self, tweet_id: u64) -> Result<Option<ResolvedTweet>>;

    /// Posts the video as a new tweet, returning the new tweet id.
    async fn post(&self, media: &Path, caption: &str) -> Result<String>;

    /// Posts the video as a reply to `target_id`.
    async fn reply(&self, target_id: u64, media: &Path, caption: &str) -> Result<String>;

    /// Sends the video as a direct message to `handle`.
    async fn dm(&self, handle: &str, media: &Path, caption: &str) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct TweetRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    media: TweetMedia,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<TweetReply>,
}

#[derive(Debug, Serialize)]
struct TweetMedia {
    media_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TweetReply {
    in_reply_to_tweet_id: String,
}

#[derive(Debug, Serialize)]
struct DmRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    attachments: Vec<DmAttachment>,
}

#[derive(Debug, Serialize)]
struct DmAttachment {
    media_id: String,
}

#[derive(Debug, Deserialize)]
struct TweetResponse {
    data: TweetCreated,
}

#[derive(Debug, Deserialize)]
struct TweetCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    data: Option<UserObject>,
}

#[derive(Debug, Deserialize)]
struct UserObject {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct TweetLookupResponse {
    data: Option<TweetObject>,
    includes: Option<LookupIncludes>,
}

#[derive(Debug, Deserialize)]
struct TweetObject {
    text: String,
}

#[derive(Debug, Deserialize)]
struct LookupIncludes {
    #[serde(default)]
    users: Vec<UserObject>,
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    data: MediaUploadData,
}

#[derive(Debug, Deserialize)]
struct MediaUploadData {
    id: String,
    processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Deserialize)]
struct ProcessingInfo {
    state: String,
    #[serde(default)]
    check_after_secs: Option<u64>,
}

/// Pulls the human-readable part out of an X API error body. The API
/// answers either `{"detail": ...}` or `{"errors": [{"message": ...}]}`
/// depending on the endpoint; anything else is passed through raw.
fn api_error_detail(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|value| {
            value
                .get("detail")
                .and_then(|d| d.as_str())
                .or_else(|| {
                    value
                        .get("errors")
                        .and_then(|errors| errors.get(0))
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                })
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

/// X API v2 client with an OAuth2 user-context bearer token.
pub struct TwitterClient {
    client: reqwest::Client,
    config: TwitterConfig,
}

impl TwitterClient {
    pub fn new(config: TwitterConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "X API error during {} ({}): {}",
                what,
                status,
                api_error_detail(&body)
            );
        }
        Ok(response)
    }

    /// Uploads an MP4 and waits for server-side processing to finish.
    async fn upload_video(&self, media: &Path) -> Result<String> {
        let bytes = tokio::fs::read(media)
            .await
            .with_context(|| format!("Failed to read media file: {}", media.display()))?;

        let file_name = media
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp4".to_string());

        debug!("Uploading {} ({} bytes)", file_name, bytes.len());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("video/mp4")
            .context("Failed to build multipart body")?;
        let form = reqwest::multipart::Form::new()
            .part("media", part)
            .text("media_category", "tweet_video");

        let response = self
            .client
            .post(self.url("/2/media/upload"))
            .bearer_auth(&self.config.access_token)
            .multipart(form)
            .send()
            .await
            .context("Failed to upload media")?;

        let upload: MediaUploadResponse = Self::check(response, "media upload")
            .await?
            .json()
            .await
            .context("Failed to parse media upload response")?;

        let media_id = upload.data.id;
        let mut processing = upload.data.processing_info;

        // Videos are processed asynchronously; poll until done.
        let mut attempts = 0;
        while let Some(info) = processing {
            match info.state.as_str() {
                "succeeded" => break,
                "failed" => anyhow::bail!("X rejected the uploaded video"),
                _ => {}
            }
            attempts += 1;
            if attempts > 15 {
                anyhow::bail!("Timed out waiting for video processing");
            }

            tokio::time::sleep(Duration::from_secs(info.check_after_secs.unwrap_or(1))).await;

            let response = self
                .client
                .get(self.url("/2/media/upload"))
                .bearer_auth(&self.config.access_token)
                .query(&[("command", "STATUS"), ("media_id", media_id.as_str())])
                .send()
                .await
                .context("Failed to poll media processing status")?;

            let status: MediaUploadResponse = Self::check(response, "media status")
                .await?
                .json()
                .await
                .context("Failed to parse media status response")?;
            processing = status.data.processing_info;
        }

        info!("Media {} uploaded", media_id);
        Ok(media_id)
    }

    async fn create_tweet(
        &self,
        media_id: String,
        caption: &str,
        reply_to: Option<u64>,
    ) -> Result<String> {
        let request = TweetRequest {
            text: (!caption.is_empty()).then(|| caption.to_string()),
            media: TweetMedia {
                media_ids: vec![media_id],
            },
            reply: reply_to.map(|id| TweetReply {
                in_reply_to_tweet_id: id.to_string(),
            }),
        };

        let response = self
            .client
            .post(self.url("/2/tweets"))
            .bearer_auth(&self.config.access_token)
            .json(&request)
            .send()
            .await
            .context("Failed to send tweet request")?;

        let created: TweetResponse = Self::check(response, "tweet creation")
            .await?
            .json()
            .await
            .context("Failed to parse tweet response")?;

        Ok(created.data.id)
    }

    async fn user_id_for(&self, handle: &str) -> Result<String> {
        let response = self
            .client
            .get(self.url(&format!("/2/users/by/username/{handle}")))
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .context("Failed to look up DM recipient")?;

        let user: UserResponse = Self::check(response, "user lookup")
            .await?
            .json()
            .await
            .context("Failed to parse user lookup response")?;

        user.data
            .map(|u| u.id)
            .with_context(|| format!("No such user: @{handle}"))
    }
}

#[async_trait]
impl Publisher for TwitterClient {
    async fn verify(&self) -> Result<String> {
        let response = self
            .client
            .get(self.url("/2/users/me"))
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .context("Failed to reach the X API")?;

        let me: UserResponse = Self::check(response, "credential check")
            .await?
            .json()
            .await
            .context("Failed to parse credential check response")?;

        me.data
            .map(|u| u.username)
            .context("Credential check returned no account")
    }

    async fn resolve(&self, tweet_id: u64) -> Result<Option<ResolvedTweet>> {
        let response = self
            .client
            .get(self.url(&format!("/2/tweets/{tweet_id}")))
            .bearer_auth(&self.config.access_token)
            .query(&[("expansions", "author_id"), ("user.fields", "username")])
            .send()
            .await
            .context("Failed to look up tweet")?;

        // A missing tweet comes back as 200 with no `data`, a bad id as 404.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let lookup: TweetLookupResponse = Self::check(response, "tweet lookup")
            .await?
            .json()
            .await
            .context("Failed to parse tweet lookup response")?;

        let Some(tweet) = lookup.data else {
            return Ok(None);
        };
        let author = lookup
            .includes
            .and_then(|i| i.users.into_iter().next())
            .map(|u| u.username)
            .unwrap_or_default();

        Ok(Some(ResolvedTweet {
            author,
            text: tweet.text,
        }))
    }

    async fn post(&self, media: &Path, caption: &str) -> Result<String> {
        let media_id = self.upload_video(media).await?;
        self.create_tweet(media_id, caption, None).await
    }

    async fn reply(&self, target_id: u64, media: &Path, caption: &str) -> Result<String> {
        let media_id = self.upload_video(media).await?;
        self.create_tweet(media_id, caption, Some(target_id)).await
    }

    async fn dm(&self, handle: &str, media: &Path, caption: &str) -> Result<()> {
        let recipient = self.user_id_for(handle).await?;
        let media_id = self.upload_video(media).await?;

        let request = DmRequest {
            text: (!caption.is_empty()).then(|| caption.to_string()),
            attachments: vec![DmAttachment { media_id }],
        };

        let response = self
            .client
            .post(self.url(&format!("/2/dm_conversations/with/{recipient}/messages")))
            .bearer_auth(&self.config.access_token)
            .json(&request)
            .send()
            .await
            .context("Failed to send DM request")?;

        Self::check(response, "direct message").await?;
        Ok(())
    }
}
