// Copilot Proxy GUI - Tauri v2
// Main entry point

#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

fn main() {
    copilot_proxy_gui_lib::run()
}
