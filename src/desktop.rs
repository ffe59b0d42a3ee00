// Copilot Proxy GUI - Tray, window and sign-in window glue
// Everything here talks to Tauri; the state it shows comes from the broadcaster

use crate::broadcaster::{Notice, ServiceState, StateBroadcaster, StateObserver, TrayView};
use crate::device_auth::flow::{DeviceSession, PromptStatus, Tone};
use crate::device_auth::{DeviceAuthError, DismissHandle, PromptPresenter, PromptSurface};
use base64::Engine;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tauri::image::Image;
use tauri::menu::{Menu, MenuEvent, MenuItem, PredefinedMenuItem};
use tauri::tray::{MouseButton, MouseButtonState, TrayIcon, TrayIconBuilder, TrayIconEvent};
use tauri::{AppHandle, Emitter, Manager, WebviewUrl, WebviewWindow, WebviewWindowBuilder};
use tauri_plugin_shell::ShellExt;

pub const MAIN_WINDOW: &str = "main";
const TRAY_ID: &str = "main-tray";
const TRAY_ICON_SIZE: u32 = 32;
const AUTH_WINDOW_PREFIX: &str = "github-auth";

/// Set once the app is really exiting, so window closes are no longer intercepted.
#[derive(Default)]
pub struct QuitState(AtomicBool);

impl QuitState {
    pub fn begin(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_quitting(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn show_main_window(app: &AppHandle) {
    if let Some(window) = app.get_webview_window(MAIN_WINDOW) {
        let _ = window.unminimize();
        let _ = window.show();
        let _ = window.set_focus();
    }
}

/// Stops the worker, then exits the app.
pub fn quit(app: &AppHandle) {
    app.state::<QuitState>().begin();
    let broadcaster = app.state::<Arc<StateBroadcaster>>().inner().clone();
    let app = app.clone();
    tauri::async_runtime::spawn(async move {
        let outcome = broadcaster.stop().await;
        tracing::info!("Quitting: {}", outcome.message);
        app.exit(0);
    });
}

// ============================================================================
// Tray
// ============================================================================

/// RGBA pixels of a filled circle in `color` on a transparent square.
pub fn dot_rgba(color: [u8; 3], size: u32) -> Vec<u8> {
    let center = size as f32 / 2.0;
    let radius = center - 1.0;
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let dx = x as f32 + 0.5 - center;
            let dy = y as f32 + 0.5 - center;
            let distance = (dx * dx + dy * dy).sqrt();
            // One pixel of edge falloff
            let coverage = (radius + 0.5 - distance).clamp(0.0, 1.0);
            pixels.extend_from_slice(&color);
            pixels.push((coverage * 255.0).round() as u8);
        }
    }
    pixels
}

fn tray_image(color: [u8; 3]) -> Image<'static> {
    Image::new_owned(dot_rgba(color, TRAY_ICON_SIZE), TRAY_ICON_SIZE, TRAY_ICON_SIZE)
}

fn tray_menu(app: &AppHandle, view: &TrayView) -> tauri::Result<Menu<tauri::Wry>> {
    let status = MenuItem::with_id(app, "status", view.status_label.as_str(), false, None::<&str>)?;
    let toggle = MenuItem::with_id(app, "toggle", view.toggle_label(), true, None::<&str>)?;
    let show = MenuItem::with_id(app, "show", "Show window", true, None::<&str>)?;
    let quit = MenuItem::with_id(app, "quit", "Quit", true, None::<&str>)?;
    let separators = [
        PredefinedMenuItem::separator(app)?,
        PredefinedMenuItem::separator(app)?,
        PredefinedMenuItem::separator(app)?,
    ];
    let menu = Menu::with_items(
        app,
        &[
            &status,
            &separators[0],
            &toggle,
            &separators[1],
            &show,
            &separators[2],
            &quit,
        ],
    )?;
    Ok(menu)
}

fn on_tray_menu(app: &AppHandle, event: MenuEvent) {
    match event.id.as_ref() {
        "toggle" => {
            let broadcaster = app.state::<Arc<StateBroadcaster>>().inner().clone();
            tauri::async_runtime::spawn(async move {
                if TrayView::of(&broadcaster.snapshot()).offers_stop {
                    broadcaster.stop().await;
                } else if let Err(e) = broadcaster.replay_last_start().await {
                    tracing::warn!("Failed to start service from tray: {}", e);
                }
            });
        }
        "show" => show_main_window(app),
        "quit" => quit(app),
        _ => {}
    }
}

/// Creates the tray icon for the initial (stopped) state.
pub fn create_tray(app: &AppHandle, state: &ServiceState) -> tauri::Result<TrayIcon> {
    let view = TrayView::of(state);
    let menu = tray_menu(app, &view)?;
    TrayIconBuilder::with_id(TRAY_ID)
        .icon(tray_image(view.color))
        .tooltip(&view.tooltip)
        .menu(&menu)
        .on_menu_event(on_tray_menu)
        .on_tray_icon_event(|tray, event| match event {
            TrayIconEvent::Click {
                button: MouseButton::Left,
                button_state: MouseButtonState::Up,
                ..
            }
            | TrayIconEvent::DoubleClick {
                button: MouseButton::Left,
                ..
            } => show_main_window(tray.app_handle()),
            _ => {}
        })
        .build(app)
}

/// Keeps the tray icon, tooltip and menu on the latest state.
pub struct TrayObserver {
    app: AppHandle,
    tray: TrayIcon,
}

impl TrayObserver {
    pub fn new(app: AppHandle, tray: TrayIcon) -> Self {
        Self { app, tray }
    }

    fn refresh(&self, state: &ServiceState) -> tauri::Result<()> {
        let view = TrayView::of(state);
        self.tray.set_icon(Some(tray_image(view.color)))?;
        self.tray.set_tooltip(Some(&view.tooltip))?;
        self.tray.set_menu(Some(tray_menu(&self.app, &view)?))
    }
}

impl StateObserver for TrayObserver {
    fn state_changed(&self, state: &ServiceState, _notice: &Notice) {
        if let Err(e) = self.refresh(state) {
            tracing::warn!("Failed to update tray: {}", e);
        }
    }
}

// ============================================================================
// Main window
// ============================================================================

/// Pushes transitions to the main window.
pub struct WindowObserver {
    app: AppHandle,
}

impl WindowObserver {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

impl StateObserver for WindowObserver {
    fn state_changed(&self, state: &ServiceState, notice: &Notice) {
        self.app.emit("service-state", state).ok();
        match notice {
            Notice::Started { pid } => {
                self.app.emit("service-started", json!({ "pid": pid })).ok();
            }
            Notice::Stopped { unexpected } => {
                self.app
                    .emit("service-stopped", json!({ "unexpected": unexpected }))
                    .ok();
            }
            Notice::Failed { error } => {
                self.app.emit("service-error", error).ok();
            }
        }
    }

    fn start_requested(&self) {
        show_main_window(&self.app);
        self.app.emit("trigger-start", ()).ok();
    }
}

// ============================================================================
// GitHub sign-in window
// ============================================================================

/// Opens the device-flow verification window.
pub struct AuthWindowPresenter {
    app: AppHandle,
    next_label: AtomicU64,
}

impl AuthWindowPresenter {
    pub fn new(app: AppHandle) -> Self {
        Self {
            app,
            next_label: AtomicU64::new(1),
        }
    }
}

impl PromptPresenter for AuthWindowPresenter {
    fn open_verification_page(&self, uri: &str) {
        #[allow(deprecated)]
        let opened = self.app.shell().open(uri, None);
        if let Err(e) = opened {
            tracing::warn!("Failed to open browser: {}", e);
        }
    }

    fn present(
        &self,
        session: &DeviceSession,
        dismiss: DismissHandle,
    ) -> Result<Arc<dyn PromptSurface>, DeviceAuthError> {
        let page = verification_page(&session.user_code, &session.verification_uri);
        let url = format!(
            "data:text/html;charset=utf-8;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(page)
        );
        let url = url
            .parse::<tauri::Url>()
            .map_err(|e| DeviceAuthError::Presentation(e.to_string()))?;

        // Labels are unique so a closing window never collides with its successor.
        let label = format!(
            "{}-{}",
            AUTH_WINDOW_PREFIX,
            self.next_label.fetch_add(1, Ordering::SeqCst)
        );
        let mut builder = WebviewWindowBuilder::new(&self.app, &label, WebviewUrl::External(url))
            .title("GitHub Sign-in")
            .inner_size(400.0, 320.0)
            .resizable(false)
            .minimizable(false)
            .maximizable(false)
            .always_on_top(true)
            .center()
            .focused(true);
        if let Some(main) = self.app.get_webview_window(MAIN_WINDOW) {
            builder = builder
                .parent(&main)
                .map_err(|e| DeviceAuthError::Presentation(e.to_string()))?;
        }
        let window = builder
            .build()
            .map_err(|e| DeviceAuthError::Presentation(e.to_string()))?;

        window.on_window_event(move |event| {
            if let tauri::WindowEvent::Destroyed = event {
                dismiss.dismiss();
            }
        });
        Ok(Arc::new(AuthWindow { window }))
    }
}

struct AuthWindow {
    window: WebviewWindow,
}

impl PromptSurface for AuthWindow {
    fn set_status(&self, status: &PromptStatus) {
        let tone = match status.tone {
            Tone::Waiting => "waiting",
            Tone::Success => "success",
            Tone::Failure => "failure",
        };
        let script = format!(
            "window.setStatus && window.setStatus({}, {});",
            json!(status.text),
            json!(tone)
        );
        if let Err(e) = self.window.eval(&script) {
            tracing::debug!("Sign-in window status update skipped: {}", e);
        }
    }

    fn close(&self) {
        if let Err(e) = self.window.close() {
            tracing::debug!("Sign-in window already closed: {}", e);
        }
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// User codes are `XXXX-XXXX`; anything else is dropped before it reaches the page.
fn sanitize_user_code(user_code: &str) -> String {
    user_code
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

/// Self-contained page showing the user code with a copy button and a status line.
pub fn verification_page(user_code: &str, verification_uri: &str) -> String {
    let code = sanitize_user_code(user_code);
    let code_literal = json!(code);
    let uri = escape_html(verification_uri);
    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>GitHub Sign-in</title>
<style>
body {{ font-family: system-ui, sans-serif; text-align: center; padding: 24px; margin: 0; }}
.code {{ font: 600 30px ui-monospace, monospace; letter-spacing: 4px; margin: 16px 0; user-select: all; }}
button {{ padding: 6px 16px; cursor: pointer; }}
#status {{ margin-top: 18px; color: #555; }}
#status.success {{ color: #16a34a; }}
#status.failure {{ color: #dc2626; }}
</style>
</head>
<body>
<p>Enter this code at <a href="{uri}" target="_blank">{uri}</a></p>
<div class="code" id="code">{code}</div>
<button id="copy">Copy code</button>
<div id="status">Waiting for authorization...</div>
<script>
document.getElementById('copy').addEventListener('click', function () {{
  var button = this;
  var done = function () {{ button.textContent = 'Copied'; }};
  if (navigator.clipboard) {{
    navigator.clipboard.writeText({code_literal}).then(done, function () {{}});
  }} else {{
    var range = document.createRange();
    range.selectNodeContents(document.getElementById('code'));
    var selection = window.getSelection();
    selection.removeAllRanges();
    selection.addRange(range);
    if (document.execCommand('copy')) done();
  }}
}});
window.setStatus = function (text, tone) {{
  var el = document.getElementById('status');
  el.textContent = text;
  el.className = tone;
}};
</script>
</body>
</html>
"#
    )
}
