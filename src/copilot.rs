// Copilot Proxy GUI - Copilot API helpers
// Account type detection and model listing for the setup screen

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const EDITOR_VERSION: &str = "vscode/1.97.0";
const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.26.7";
const USER_AGENT: &str = "GitHubCopilotChat/0.26.7";
const INTEGRATION_ID: &str = "vscode-chat";

const PROBE_TIMEOUT: Duration = Duration::from_secs(8);
const MODELS_TIMEOUT: Duration = Duration::from_secs(10);

/// Probed in order; `individual` is the fallback.
pub const ACCOUNT_TYPES: [&str; 3] = ["enterprise", "business", "individual"];

pub fn models_base_url(account_type: &str) -> String {
    match account_type {
        "individual" | "" => "https://api.githubcopilot.com".to_string(),
        other => format!("https://api.{}.githubcopilot.com", other),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetection {
    pub account_type: String,
    pub detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize)]
struct CopilotToken {
    token: String,
}

pub struct CopilotClient {
    client: reqwest::Client,
}

impl CopilotClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn editor_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("content-type", "application/json")
            .header("editor-version", EDITOR_VERSION)
            .header("editor-plugin-version", EDITOR_PLUGIN_VERSION)
    }

    /// Exchanges the GitHub token for a short-lived Copilot token.
    async fn copilot_token(&self, github_token: &str) -> Result<String> {
        let resp = self
            .editor_headers(self.client.get(TOKEN_URL))
            .header("authorization", format!("token {}", github_token))
            .send()
            .await
            .context("Copilot token request failed")?;
        if !resp.status().is_success() {
            return Err(anyhow!("Failed to get Copilot token: HTTP {}", resp.status().as_u16()));
        }
        let body: CopilotToken = resp.json().await.context("Invalid Copilot token response")?;
        Ok(body.token)
    }

    async fn models(
        &self,
        copilot_token: &str,
        account_type: &str,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        self.editor_headers(
            self.client
                .get(format!("{}/models", models_base_url(account_type))),
        )
        .header("authorization", format!("Bearer {}", copilot_token))
        .header("copilot-integration-id", INTEGRATION_ID)
        .timeout(timeout)
        .send()
        .await
        .with_context(|| format!("Model request for {} failed", account_type))
    }

    /// First account type whose models endpoint accepts the token.
    pub async fn detect_account_type(&self, github_token: &str) -> Result<AccountDetection> {
        let copilot_token = self.copilot_token(github_token).await?;
        for account_type in ACCOUNT_TYPES {
            match self.models(&copilot_token, account_type, PROBE_TIMEOUT).await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!("Detected Copilot account type: {}", account_type);
                    return Ok(AccountDetection {
                        account_type: account_type.to_string(),
                        detected: true,
                        message: None,
                    });
                }
                Ok(resp) => tracing::debug!("{} probe: HTTP {}", account_type, resp.status()),
                Err(e) => tracing::warn!("Account type detection endpoint failed: {:#}", e),
            }
        }
        Ok(AccountDetection {
            account_type: "individual".to_string(),
            detected: false,
            message: Some("Could not detect the account type, using individual".to_string()),
        })
    }

    /// Raw model list of the given account type.
    pub async fn fetch_models(
        &self,
        github_token: &str,
        account_type: &str,
    ) -> Result<serde_json::Value> {
        let copilot_token = self.copilot_token(github_token).await?;
        let resp = self.models(&copilot_token, account_type, MODELS_TIMEOUT).await?;
        if !resp.status().is_success() {
            return Err(anyhow!("Failed to fetch models: HTTP {}", resp.status().as_u16()));
        }
        resp.json().await.context("Invalid model list response")
    }
}
