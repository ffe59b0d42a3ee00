// Copilot Proxy GUI - Tauri v2
// Desktop shell that supervises the Copilot proxy worker and signs in to GitHub

pub mod broadcaster;
pub mod cipher;
pub mod claude_env;
pub mod commands;
pub mod config;
pub mod copilot;
pub mod credential;
pub mod desktop;
pub mod device_auth;
pub mod logging;
pub mod supervisor;

use broadcaster::StateBroadcaster;
use commands::StartPayload;
use config::{github, settings, AppPaths};
use credential::CredentialStore;
use desktop::{AuthWindowPresenter, QuitState, TrayObserver, WindowObserver, MAIN_WINDOW};
use device_auth::github::GithubDeviceServer;
use device_auth::DeviceAuthClient;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use supervisor::{platform_terminator, ProxyWorkerResolver, Supervisor};
use tauri::{App, Emitter, Manager, RunEvent, WindowEvent};
use tokio::sync::mpsc;

/// Directory the development source tree is searched upwards from
fn search_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_default()
}

/// Wires the components together and hands them to Tauri's state.
fn setup(app: &mut App) -> Result<(), Box<dyn std::error::Error>> {
    let handle = app.handle().clone();
    let paths = AppPaths::new(app.path().app_data_dir()?, &app.path().home_dir()?);
    tracing::info!("App data dir: {:?}", paths.data_dir);

    let store = Arc::new(CredentialStore::new(paths.clone(), cipher::platform_cipher()));
    let resolver = Arc::new(ProxyWorkerResolver::new(
        app.path().resource_dir()?,
        search_root(),
    ));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let supervisor = Arc::new(Supervisor::new(
        store.clone(),
        resolver,
        platform_terminator(),
        events_tx,
    ));

    let broadcaster = Arc::new(StateBroadcaster::new(supervisor));
    let tray = desktop::create_tray(&handle, &broadcaster.snapshot())?;
    broadcaster.subscribe(Arc::new(TrayObserver::new(handle.clone(), tray)));
    broadcaster.subscribe(Arc::new(WindowObserver::new(handle.clone())));
    tauri::async_runtime::spawn(broadcaster.clone().pump(events_rx));

    let server = Arc::new(GithubDeviceServer::new(github::base_url())?);
    let auth = Arc::new(DeviceAuthClient::new(server, store.clone()));

    let saved = settings::load(&paths.data_dir).unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}", e);
        Default::default()
    });
    if saved.auto_start {
        let has_token = store
            .read_with_migration()
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        if has_token {
            let request = commands::start_request(StartPayload::default(), &saved);
            let starter = broadcaster.clone();
            tauri::async_runtime::spawn(async move {
                if let Err(e) = starter.start(request).await {
                    tracing::error!("Auto-start failed: {}", e);
                }
            });
        } else {
            tracing::info!("Auto-start skipped: no GitHub token");
        }
    }

    app.manage(paths);
    app.manage(store);
    app.manage(broadcaster);
    app.manage(auth);
    app.manage(AuthWindowPresenter::new(handle));
    Ok(())
}

pub fn run() {
    logging::init();

    let app = tauri::Builder::default()
        .plugin(tauri_plugin_shell::init())
        .plugin(tauri_plugin_dialog::init())
        .manage(QuitState::default())
        .setup(setup)
        .on_window_event(|window, event| {
            if let WindowEvent::CloseRequested { api, .. } = event {
                if window.label() == MAIN_WINDOW && !window.state::<QuitState>().is_quitting() {
                    api.prevent_close();
                    window.emit("close-requested", ()).ok();
                }
            }
        })
        .invoke_handler(tauri::generate_handler![
            // Service commands
            commands::service_start,
            commands::service_stop,
            commands::service_state,
            commands::service_logs,
            // Auth commands
            commands::auth_status,
            commands::auth_device_code_start,
            commands::delete_token,
            commands::detect_account_type,
            commands::fetch_models,
            // Window commands
            commands::close_confirm_response,
            commands::open_external,
            // Config commands
            commands::get_settings,
            commands::save_settings,
            commands::write_claude_env,
            commands::clear_claude_env,
            commands::check_claude_env,
            commands::launch_claude_code,
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application");

    app.run(|handle, event| {
        if let RunEvent::Exit = event {
            if let Some(broadcaster) = handle.try_state::<Arc<StateBroadcaster>>() {
                let broadcaster = broadcaster.inner().clone();
                // Stop service synchronously
                tauri::async_runtime::block_on(async move {
                    broadcaster.stop().await;
                });
            }
        }
    });
}
