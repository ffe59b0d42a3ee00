//! Pure transition logic of the device authorization poll loop.
//!
//! [`DeviceSession::on_reply`] maps one token-endpoint reply to the next
//! [`Step`]; the imperative shell in the parent module performs the waiting,
//! the network calls and the credential write that the steps ask for.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Interval assumed when the server does not send one
pub const DEFAULT_SERVER_INTERVAL: u64 = 5;
/// Added to the interval on every `slow_down`
pub const SLOW_DOWN_STEP: u64 = 2;
/// Upper bound for the polling interval
pub const MAX_POLL_INTERVAL: u64 = 60;

pub const SUCCESS_CLOSE_DELAY: Duration = Duration::from_millis(1500);
pub const TERMINAL_CLOSE_DELAY: Duration = Duration::from_millis(2000);
pub const WRITE_FAILURE_CLOSE_DELAY: Duration = Duration::from_millis(3000);

/// Device-code issuance response.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DeviceCodeGrant {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Token-endpoint response body; either a token or an error code.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// One poll attempt, as seen by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum PollReply {
    Granted(String),
    Pending,
    SlowDown,
    Expired,
    Denied,
    /// Transport error or non-2xx status; retried at the current interval.
    Failed(String),
}

impl From<TokenResponse> for PollReply {
    fn from(response: TokenResponse) -> Self {
        if let Some(token) = response.access_token.filter(|t| !t.is_empty()) {
            return PollReply::Granted(token);
        }
        match response.error.as_deref() {
            Some("slow_down") => PollReply::SlowDown,
            Some("expired_token") => PollReply::Expired,
            Some("access_denied") => PollReply::Denied,
            _ => PollReply::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Success,
    Expired,
    /// Reported to the UI as `error`.
    #[serde(rename = "error")]
    Denied,
    Canceled,
    Error,
}

/// Terminal result handed back to the UI.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthOutcome {
    pub status: AuthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_path: Option<String>,
}

impl DeviceAuthOutcome {
    fn new(status: AuthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            token_path: None,
        }
    }

    pub fn canceled() -> Self {
        Self::new(AuthStatus::Canceled, "The sign-in window was closed")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Waiting,
    Success,
    Failure,
}

/// Status line shown on the verification surface.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptStatus {
    pub text: String,
    pub tone: Tone,
}

impl PromptStatus {
    fn new(text: impl Into<String>, tone: Tone) -> Self {
        Self {
            text: text.into(),
            tone,
        }
    }

    pub fn waiting() -> Self {
        Self::new("Waiting for authorization...", Tone::Waiting)
    }
}

/// What the shell must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Show `status` and poll again after `delay`.
    Wait { delay: Duration, status: PromptStatus },
    /// Store the token, then report the result through [`DeviceSession::on_persisted`].
    Persist { token: String },
    /// Stop polling; show `status` and close the surface after `close_after`.
    Finish {
        outcome: DeviceAuthOutcome,
        status: PromptStatus,
        close_after: Duration,
    },
}

/// State of one device-flow session.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    interval: u64,
    poll_count: u32,
}

impl DeviceSession {
    pub fn new(grant: DeviceCodeGrant) -> Self {
        let interval = grant.interval.unwrap_or(DEFAULT_SERVER_INTERVAL) + 1;
        Self {
            device_code: grant.device_code,
            user_code: grant.user_code,
            verification_uri: grant.verification_uri,
            interval: interval.min(MAX_POLL_INTERVAL),
            poll_count: 0,
        }
    }

    /// Seconds between polls
    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn poll_count(&self) -> u32 {
        self.poll_count
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn on_reply(&mut self, reply: PollReply) -> Step {
        self.poll_count += 1;
        match reply {
            PollReply::Granted(token) => Step::Persist { token },
            PollReply::Pending => self.wait(PromptStatus::new(
                format!("Waiting for authorization... ({})", self.poll_count),
                Tone::Waiting,
            )),
            PollReply::SlowDown => {
                self.interval = (self.interval + SLOW_DOWN_STEP).min(MAX_POLL_INTERVAL);
                self.wait(PromptStatus::waiting())
            }
            PollReply::Failed(reason) => {
                tracing::warn!("Auth poll failed, retrying: {}", reason);
                self.wait(PromptStatus::new(
                    format!("Waiting for authorization... retrying ({})", self.poll_count),
                    Tone::Waiting,
                ))
            }
            PollReply::Expired => Step::Finish {
                outcome: DeviceAuthOutcome::new(AuthStatus::Expired, "The device code has expired"),
                status: PromptStatus::new(
                    "The code has expired, please try again",
                    Tone::Failure,
                ),
                close_after: TERMINAL_CLOSE_DELAY,
            },
            PollReply::Denied => Step::Finish {
                outcome: DeviceAuthOutcome::new(AuthStatus::Denied, "Authorization was denied"),
                status: PromptStatus::new("Authorization was denied", Tone::Failure),
                close_after: TERMINAL_CLOSE_DELAY,
            },
        }
    }

    /// Result of storing a granted token. A failed write ends the session.
    pub fn on_persisted(&self, result: Result<PathBuf, String>) -> Step {
        match result {
            Ok(path) => Step::Finish {
                outcome: DeviceAuthOutcome {
                    status: AuthStatus::Success,
                    message: "GitHub token saved".to_string(),
                    token_path: Some(path.to_string_lossy().to_string()),
                },
                status: PromptStatus::new("Signed in!", Tone::Success),
                close_after: SUCCESS_CLOSE_DELAY,
            },
            Err(e) => Step::Finish {
                outcome: DeviceAuthOutcome::new(
                    AuthStatus::Error,
                    format!("Failed to save token: {}", e),
                ),
                status: PromptStatus::new(format!("Failed to save token: {}", e), Tone::Failure),
                close_after: WRITE_FAILURE_CLOSE_DELAY,
            },
        }
    }

    fn wait(&self, status: PromptStatus) -> Step {
        Step::Wait {
            delay: self.delay(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(interval: Option<u64>) -> DeviceCodeGrant {
        DeviceCodeGrant {
            device_code: "dc".to_string(),
            user_code: "ABCD-1234".to_string(),
            verification_uri: "https://github.com/login/device".to_string(),
            interval,
            expires_in: Some(900),
        }
    }

    #[test]
    fn first_interval_is_server_interval_plus_one() {
        assert_eq!(DeviceSession::new(grant(Some(5))).interval(), 6);
        assert_eq!(DeviceSession::new(grant(None)).interval(), 6);
        assert_eq!(DeviceSession::new(grant(Some(120))).interval(), MAX_POLL_INTERVAL);
    }

    #[test]
    fn pending_keeps_interval_and_counts_attempts() {
        let mut session = DeviceSession::new(grant(Some(5)));
        let step = session.on_reply(PollReply::Pending);
        assert_eq!(
            step,
            Step::Wait {
                delay: Duration::from_secs(6),
                status: PromptStatus::new("Waiting for authorization... (1)", Tone::Waiting),
            }
        );
        session.on_reply(PollReply::Pending);
        assert_eq!(session.poll_count(), 2);
        assert_eq!(session.interval(), 6);
    }

    #[test]
    fn slow_down_grows_interval_up_to_cap() {
        let mut session = DeviceSession::new(grant(Some(5)));
        assert_eq!(
            session.on_reply(PollReply::SlowDown),
            Step::Wait {
                delay: Duration::from_secs(8),
                status: PromptStatus::waiting(),
            }
        );
        for _ in 0..40 {
            session.on_reply(PollReply::SlowDown);
        }
        assert_eq!(session.interval(), MAX_POLL_INTERVAL);
    }

    #[test]
    fn transport_failure_is_retried_at_current_interval() {
        let mut session = DeviceSession::new(grant(Some(5)));
        match session.on_reply(PollReply::Failed("HTTP 502".to_string())) {
            Step::Wait { delay, status } => {
                assert_eq!(delay, Duration::from_secs(6));
                assert!(status.text.contains("retrying (1)"));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn expired_and_denied_are_terminal() {
        let mut session = DeviceSession::new(grant(Some(5)));
        match session.on_reply(PollReply::Expired) {
            Step::Finish {
                outcome,
                close_after,
                ..
            } => {
                assert_eq!(outcome.status, AuthStatus::Expired);
                assert_eq!(close_after, TERMINAL_CLOSE_DELAY);
            }
            other => panic!("unexpected step {:?}", other),
        }
        match session.on_reply(PollReply::Denied) {
            Step::Finish { outcome, .. } => {
                assert_eq!(outcome.status, AuthStatus::Denied);
                let json = serde_json::to_value(&outcome).unwrap();
                assert_eq!(json["status"], "error");
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn granted_token_must_be_persisted_before_success() {
        let mut session = DeviceSession::new(grant(Some(5)));
        assert_eq!(
            session.on_reply(PollReply::Granted("gho_x".to_string())),
            Step::Persist {
                token: "gho_x".to_string()
            }
        );

        match session.on_persisted(Ok(PathBuf::from("/data/github_token"))) {
            Step::Finish {
                outcome,
                close_after,
                ..
            } => {
                assert_eq!(outcome.status, AuthStatus::Success);
                assert_eq!(outcome.token_path.as_deref(), Some("/data/github_token"));
                assert_eq!(close_after, SUCCESS_CLOSE_DELAY);
            }
            other => panic!("unexpected step {:?}", other),
        }

        match session.on_persisted(Err("disk full".to_string())) {
            Step::Finish { outcome, .. } => {
                assert_eq!(outcome.status, AuthStatus::Error);
                assert!(outcome.message.contains("disk full"));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn token_responses_classify_by_error_code() {
        let parse = |body: &str| PollReply::from(serde_json::from_str::<TokenResponse>(body).unwrap());
        assert_eq!(
            parse(r#"{"access_token":"gho_1","token_type":"bearer"}"#),
            PollReply::Granted("gho_1".to_string())
        );
        assert_eq!(parse(r#"{"error":"authorization_pending"}"#), PollReply::Pending);
        assert_eq!(parse(r#"{"error":"slow_down","interval":10}"#), PollReply::SlowDown);
        assert_eq!(parse(r#"{"error":"expired_token"}"#), PollReply::Expired);
        assert_eq!(parse(r#"{"error":"access_denied"}"#), PollReply::Denied);
        assert_eq!(parse(r#"{"error":"something_new"}"#), PollReply::Pending);
        assert_eq!(parse(r#"{"access_token":""}"#), PollReply::Pending);
    }
}
