// Copilot Proxy GUI - GitHub device flow endpoints

use super::flow::{DeviceCodeGrant, PollReply, TokenResponse};
use super::{AuthServer, DeviceAuthError};
use crate::config::github;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// GitHub's `/login/device/code` and `/login/oauth/access_token` endpoints.
pub struct GithubDeviceServer {
    client: reqwest::Client,
    base_url: String,
}

impl GithubDeviceServer {
    pub fn new(base_url: String) -> Result<Self, DeviceAuthError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, base_url })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
    }
}

#[async_trait]
impl AuthServer for GithubDeviceServer {
    async fn request_device_code(&self) -> Result<DeviceCodeGrant, DeviceAuthError> {
        let resp = self
            .post(
                "/login/device/code",
                json!({ "client_id": github::CLIENT_ID, "scope": github::SCOPES }),
            )
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(DeviceAuthError::DeviceCodeRequest {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| DeviceAuthError::InvalidResponse(e.to_string()))
    }

    async fn poll_token(&self, device_code: &str) -> PollReply {
        let resp = match self
            .post(
                "/login/oauth/access_token",
                json!({
                    "client_id": github::CLIENT_ID,
                    "device_code": device_code,
                    "grant_type": github::DEVICE_GRANT_TYPE,
                }),
            )
            .await
        {
            Ok(resp) => resp,
            Err(e) => return PollReply::Failed(e.to_string()),
        };

        if !resp.status().is_success() {
            return PollReply::Failed(format!("HTTP {}", resp.status()));
        }
        match resp.json::<TokenResponse>().await {
            Ok(body) => {
                if let Some(description) = &body.error_description {
                    tracing::debug!("Token endpoint: {}", description);
                }
                PollReply::from(body)
            }
            Err(e) => PollReply::Failed(e.to_string()),
        }
    }
}
