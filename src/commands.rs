// Copilot Proxy GUI - Commands invoked by the window

use crate::broadcaster::{ServiceState, StartRequest, StateBroadcaster};
use crate::claude_env::{self, ClearedEnv, EnvCheck, Launched, WrittenEnv};
use crate::config::{settings, AppPaths, ProxySettings, DEFAULT_PORT};
use crate::copilot::{AccountDetection, CopilotClient};
use crate::credential::CredentialStore;
use crate::desktop::{self, AuthWindowPresenter, MAIN_WINDOW};
use crate::device_auth::flow::DeviceAuthOutcome;
use crate::device_auth::DeviceAuthClient;
use crate::supervisor::{StartOutcome, StopOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tauri::{AppHandle, Manager, State};
use tauri_plugin_dialog::DialogExt;
use tauri_plugin_shell::ShellExt;

// ============================================================================
// Service Commands
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub args: Option<Vec<String>>,
    pub model_name: Option<String>,
}

/// Fills a start payload from the saved settings where it is silent.
pub fn start_request(payload: StartPayload, saved: &ProxySettings) -> StartRequest {
    StartRequest {
        args: payload.args.unwrap_or_else(|| saved.to_cli_args()),
        model_name: payload
            .model_name
            .unwrap_or_else(|| saved.default_model.clone()),
    }
}

fn load_settings(paths: &AppPaths) -> ProxySettings {
    settings::load(&paths.data_dir).unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings, using defaults: {}", e);
        ProxySettings::default()
    })
}

#[tauri::command]
pub async fn service_start(
    payload: Option<StartPayload>,
    broadcaster: State<'_, Arc<StateBroadcaster>>,
    paths: State<'_, AppPaths>,
) -> Result<StartOutcome, String> {
    let request = start_request(payload.unwrap_or_default(), &load_settings(&paths));
    broadcaster.start(request).await.map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn service_stop(
    broadcaster: State<'_, Arc<StateBroadcaster>>,
) -> Result<StopOutcome, String> {
    Ok(broadcaster.stop().await)
}

#[tauri::command]
pub async fn service_state(
    broadcaster: State<'_, Arc<StateBroadcaster>>,
) -> Result<ServiceState, String> {
    Ok(broadcaster.snapshot())
}

#[derive(Serialize)]
pub struct ServiceLogs {
    lines: Vec<String>,
}

#[tauri::command]
pub async fn service_logs(
    broadcaster: State<'_, Arc<StateBroadcaster>>,
) -> Result<ServiceLogs, String> {
    Ok(ServiceLogs {
        lines: broadcaster.supervisor().logs(),
    })
}

// ============================================================================
// Auth Commands
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatusReply {
    has_token: bool,
    token_path: String,
    message: String,
}

/// Tauri command to check for a stored GitHub token (doesn't expose the token)
#[tauri::command]
pub async fn auth_status(store: State<'_, Arc<CredentialStore>>) -> Result<AuthStatusReply, String> {
    let has_token = !store
        .read_with_migration()
        .map_err(|e| e.to_string())?
        .is_empty();
    Ok(AuthStatusReply {
        has_token,
        token_path: store.token_path().to_string_lossy().to_string(),
        message: if has_token {
            "GitHub token exists".to_string()
        } else {
            "GitHub token not found".to_string()
        },
    })
}

#[tauri::command]
pub async fn auth_device_code_start(
    client: State<'_, Arc<DeviceAuthClient>>,
    presenter: State<'_, AuthWindowPresenter>,
) -> Result<DeviceAuthOutcome, String> {
    client
        .begin(presenter.inner())
        .await
        .map_err(|e| e.to_string())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedToken {
    ok: bool,
    token_path: String,
}

#[tauri::command]
pub async fn delete_token(store: State<'_, Arc<CredentialStore>>) -> Result<DeletedToken, String> {
    store.delete().map_err(|e| e.to_string())?;
    tracing::info!("GitHub token deleted");
    Ok(DeletedToken {
        ok: true,
        token_path: store.token_path().to_string_lossy().to_string(),
    })
}

fn github_token(store: &CredentialStore) -> Result<String, String> {
    let token = store.read_with_migration().map_err(|e| e.to_string())?;
    if token.is_empty() {
        return Err("Please sign in to GitHub first".to_string());
    }
    Ok(token)
}

#[tauri::command]
pub async fn detect_account_type(
    store: State<'_, Arc<CredentialStore>>,
) -> Result<AccountDetection, String> {
    let token = github_token(&store)?;
    let client = CopilotClient::new().map_err(|e| e.to_string())?;
    client
        .detect_account_type(&token)
        .await
        .map_err(|e| format!("{:#}", e))
}

#[tauri::command]
pub async fn fetch_models(
    account_type: Option<String>,
    store: State<'_, Arc<CredentialStore>>,
) -> Result<serde_json::Value, String> {
    let token = github_token(&store)?;
    let account_type = account_type.unwrap_or_else(|| "individual".to_string());
    let client = CopilotClient::new().map_err(|e| e.to_string())?;
    client
        .fetch_models(&token, &account_type)
        .await
        .map_err(|e| format!("{:#}", e))
}

// ============================================================================
// Window Commands
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CloseAction {
    Minimize,
    Quit,
    Cancel,
}

/// Answer to a `close-requested` event.
#[tauri::command]
pub async fn close_confirm_response(app: AppHandle, action: CloseAction) -> Result<(), String> {
    match action {
        CloseAction::Minimize => {
            if let Some(window) = app.get_webview_window(MAIN_WINDOW) {
                window.hide().map_err(|e| e.to_string())?;
            }
        }
        CloseAction::Quit => desktop::quit(&app),
        CloseAction::Cancel => {}
    }
    Ok(())
}

pub fn is_external_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[tauri::command]
pub async fn open_external(app: AppHandle, url: String) -> Result<(), String> {
    if !is_external_url(&url) {
        return Err(format!("Refusing to open non-web URL: {}", url));
    }
    #[allow(deprecated)]
    let opened = app.shell().open(url, None);
    opened.map_err(|e| e.to_string())
}

// ============================================================================
// Config Commands
// ============================================================================

#[tauri::command]
pub async fn get_settings(paths: State<'_, AppPaths>) -> Result<ProxySettings, String> {
    settings::load(&paths.data_dir).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn save_settings(
    paths: State<'_, AppPaths>,
    new_settings: ProxySettings,
) -> Result<(), String> {
    settings::save(&paths.data_dir, &new_settings).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn write_claude_env(
    paths: State<'_, AppPaths>,
    port: Option<u16>,
    model: Option<String>,
    small_model: Option<String>,
) -> Result<WrittenEnv, String> {
    claude_env::write(
        &paths.home_dir,
        port.unwrap_or(DEFAULT_PORT),
        model.as_deref().unwrap_or_default(),
        small_model.as_deref().unwrap_or_default(),
    )
    .map_err(|e| format!("{:#}", e))
}

#[tauri::command]
pub async fn clear_claude_env(paths: State<'_, AppPaths>) -> Result<ClearedEnv, String> {
    claude_env::clear(&paths.home_dir).map_err(|e| format!("{:#}", e))
}

#[tauri::command]
pub async fn check_claude_env(paths: State<'_, AppPaths>) -> Result<EnvCheck, String> {
    Ok(claude_env::check(&paths.home_dir))
}

/// Asks for a workspace folder, then opens a terminal there running Claude Code.
#[tauri::command]
pub async fn launch_claude_code(
    app: AppHandle,
    port: Option<u16>,
    model: Option<String>,
    small_model: Option<String>,
) -> Result<Launched, String> {
    let mut dialog = app
        .dialog()
        .file()
        .set_title("Choose a Claude Code workspace");
    if let Some(window) = app.get_webview_window(MAIN_WINDOW) {
        dialog = dialog.set_parent(&window);
    }
    let Some(folder) = dialog.blocking_pick_folder() else {
        return Ok(Launched::canceled());
    };
    let cwd = folder.into_path().map_err(|e| e.to_string())?;

    claude_env::launch(
        &cwd,
        port.unwrap_or(DEFAULT_PORT),
        model.as_deref().unwrap_or_default(),
        small_model.as_deref().unwrap_or_default(),
    )
    .map_err(|e| format!("{:#}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_start_payload_uses_saved_settings() {
        let saved = ProxySettings {
            port: 5000,
            default_model: "gpt-4.1".to_string(),
            ..ProxySettings::default()
        };
        let request = start_request(StartPayload::default(), &saved);
        assert_eq!(request.args, vec!["start", "--port", "5000"]);
        assert_eq!(request.model_name, "gpt-4.1");
    }

    #[test]
    fn explicit_start_payload_wins() {
        let payload: StartPayload = serde_json::from_str(
            r#"{"args":["start","--port","4399","--verbose"],"modelName":"claude-sonnet-4"}"#,
        )
        .unwrap();
        let request = start_request(payload, &ProxySettings::default());
        assert_eq!(request.args, vec!["start", "--port", "4399", "--verbose"]);
        assert_eq!(request.model_name, "claude-sonnet-4");
    }

    #[test]
    fn only_web_urls_are_opened() {
        assert!(is_external_url("https://github.com/login/device"));
        assert!(is_external_url("HTTP://localhost:4399"));
        assert!(!is_external_url("file:///etc/passwd"));
        assert!(!is_external_url("javascript:alert(1)"));
        assert!(!is_external_url("mailto:someone@example.com"));
    }

    #[test]
    fn close_actions_parse_from_lowercase() {
        let action: CloseAction = serde_json::from_str(r#""minimize""#).unwrap();
        assert_eq!(action, CloseAction::Minimize);
        assert!(serde_json::from_str::<CloseAction>(r#""explode""#).is_err());
    }
}
