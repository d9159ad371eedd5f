use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RoomError};
use crate::session::Uid;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl DirectoryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Request body shared by `create_member` and `delete_member`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberIdentity {
    pub name: String,
    pub room_name: String,
    #[serde(rename = "UID")]
    pub uid: Uid,
}

/// Member record as returned by the directory. Only `name` is guaranteed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(default, rename = "UID", skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
}

/// The three membership operations the room depends on
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    /// Announces a join. Called once, before the local tracks are published.
    async fn create_member(&self, member: &MemberIdentity) -> Result<MemberRecord>;

    /// Maps a session uid to a display name.
    async fn get_member(&self, uid: &Uid, room_name: &str) -> Result<MemberRecord>;

    /// Announces a leave.
    async fn delete_member(&self, member: &MemberIdentity) -> Result<serde_json::Value>;
}

/// HTTP client for the membership endpoints
pub struct DirectoryClient {
    config: DirectoryConfig,
    client: reqwest::Client,
}

impl DirectoryClient {
    pub fn new(config: DirectoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RoomError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RoomError::directory(format!(
                "{} failed with status {}: {}",
                operation, status, error_text
            )));
        }

        response.json::<T>().await.map_err(|e| {
            RoomError::directory(format!("{} returned an invalid body: {}", operation, e))
        })
    }
}

#[async_trait]
impl MemberDirectory for DirectoryClient {
    async fn create_member(&self, member: &MemberIdentity) -> Result<MemberRecord> {
        let response = self
            .client
            .post(self.endpoint("create_member/"))
            .json(member)
            .send()
            .await?;

        let record: MemberRecord = Self::decode("create_member", response).await?;
        tracing::info!(
            uid = %member.uid,
            room_name = %member.room_name,
            name = %record.name,
            "Registered member"
        );
        Ok(record)
    }

    async fn get_member(&self, uid: &Uid, room_name: &str) -> Result<MemberRecord> {
        let url = format!(
            "{}?UID={}&room_name={}",
            self.endpoint("get_member/"),
            urlencoding::encode(uid.as_str()),
            urlencoding::encode(room_name),
        );

        let response = self.client.get(&url).send().await?;
        let record: MemberRecord = Self::decode("get_member", response).await?;
        tracing::debug!(uid = %uid, name = %record.name, "Resolved member");
        Ok(record)
    }

    async fn delete_member(&self, member: &MemberIdentity) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(self.endpoint("delete_member/"))
            .json(member)
            .send()
            .await?;

        let ack = Self::decode("delete_member", response).await?;
        tracing::info!(uid = %member.uid, room_name = %member.room_name, "Deleted member");
        Ok(ack)
    }
}
