//! Backend HTTP client: username list, media uploads, profile/content upserts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status} for {endpoint}")]
    Status {
        status: StatusCode,
        endpoint: String,
    },
    #[error("upload response carried no url field")]
    MissingUploadUrl,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserListResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfilePayload {
    pub instagram_user_id: String,
    pub full_name: String,
    pub is_verified: bool,
    pub biography: String,
    pub profile_pic_url: Option<String>,
    pub follower_count: u64,
    pub following_count: u64,
    pub media_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentPayload {
    pub reels: Vec<ReelPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReelPayload {
    pub instagram_media_id: String,
    pub code: String,
    pub media_type: u8,
    pub like_count: u64,
    pub play_count: u64,
    pub comment_count: u64,
    pub caption_text: String,
    pub video_url: String,
    pub thumbnail_url: String,
    pub audio_url: Option<String>,
    pub video_duration: f64,
    pub has_audio: bool,
    pub repost_count: u64,
    pub reshare_count: u64,
}

/// Capability seam over the backend so stages can run against an
/// in-memory double in tests.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_username_list(&self) -> Result<Vec<String>, ApiError>;
    async fn upload_media(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ApiError>;
    async fn put_profile(&self, username: &str, payload: &ProfilePayload) -> Result<(), ApiError>;
    async fn put_content(&self, username: &str, payload: &ContentPayload) -> Result<(), ApiError>;
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn check(status: StatusCode, endpoint: &str) -> Result<(), ApiError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::Status {
                status,
                endpoint: endpoint.to_string(),
            })
        }
    }
}

#[async_trait]
impl Backend for ApiClient {
    async fn fetch_username_list(&self) -> Result<Vec<String>, ApiError> {
        let endpoint = self.endpoint("getProfileInstaUserList");
        let response = self
            .client
            .get(&endpoint)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response.status(), &endpoint)?;
        let body: UserListResponse = response.json().await?;
        if !body.success {
            tracing::warn!(message = %body.message, "username list marked unsuccessful");
        }
        Ok(body.data)
    }

    async fn upload_media(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ApiError> {
        let endpoint = self.endpoint("upload/media");
        let part = Part::bytes(bytes).file_name(file_name.to_string());
        let form = Form::new().part("file", part);
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        Self::check(response.status(), &endpoint)?;
        let body: serde_json::Value = response.json().await?;
        // Deployments answer either `{url}` or `{data: {url}}`.
        body.get("url")
            .and_then(|v| v.as_str())
            .or_else(|| body.pointer("/data/url").and_then(|v| v.as_str()))
            .map(str::to_string)
            .ok_or(ApiError::MissingUploadUrl)
    }

    async fn put_profile(&self, username: &str, payload: &ProfilePayload) -> Result<(), ApiError> {
        let endpoint = self.endpoint(&format!("updateProfileById/{username}"));
        let response = self
            .client
            .put(&endpoint)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await?;
        Self::check(response.status(), &endpoint)
    }

    async fn put_content(&self, username: &str, payload: &ContentPayload) -> Result<(), ApiError> {
        let endpoint = self.endpoint(&format!("updateContentById/{username}"));
        let response = self
            .client
            .put(&endpoint)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await?;
        Self::check(response.status(), &endpoint)
    }
}
