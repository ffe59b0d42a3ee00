// Copilot Proxy GUI - Claude Code settings integration
// Points Claude Code at the local proxy through the env block of ~/.claude/settings.json

use anyhow::Context;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Every key this app may write; clearing removes exactly these.
pub const ENV_KEYS: [&str; 8] = [
    "ANTHROPIC_BASE_URL",
    "ANTHROPIC_AUTH_TOKEN",
    "ANTHROPIC_MODEL",
    "ANTHROPIC_DEFAULT_SONNET_MODEL",
    "ANTHROPIC_SMALL_FAST_MODEL",
    "ANTHROPIC_DEFAULT_HAIKU_MODEL",
    "DISABLE_NON_ESSENTIAL_MODEL_CALLS",
    "CLAUDE_CODE_DISABLE_NONESSENTIAL_TRAFFIC",
];

#[derive(Debug, Serialize)]
pub struct WrittenEnv {
    pub ok: bool,
    pub path: String,
    pub vars: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ClearedEnv {
    pub ok: bool,
    pub path: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvCheck {
    pub written: bool,
    pub base_url: Option<String>,
}

pub fn settings_path(home_dir: &Path) -> PathBuf {
    home_dir.join(".claude").join("settings.json")
}

/// Unreadable or malformed settings count as empty.
fn load(path: &Path) -> Map<String, Value> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => {
            tracing::warn!("Failed to parse Claude settings: {}", e);
            Map::new()
        }
    }
}

fn save(path: &Path, settings: Map<String, Value>) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let content = serde_json::to_string_pretty(&Value::Object(settings))?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Values for every key in `ENV_KEYS`, in the same order.
pub fn proxy_vars(port: u16, model: &str, small_model: &str) -> Vec<(&'static str, String)> {
    let small_model = if small_model.is_empty() { model } else { small_model };
    let values = [
        format!("http://localhost:{}", port),
        "dummy".to_string(),
        model.to_string(),
        model.to_string(),
        small_model.to_string(),
        small_model.to_string(),
        "1".to_string(),
        "1".to_string(),
    ];
    ENV_KEYS.into_iter().zip(values).collect()
}

/// Merges the proxy variables into the env block, keeping unrelated keys.
pub fn write(
    home_dir: &Path,
    port: u16,
    model: &str,
    small_model: &str,
) -> anyhow::Result<WrittenEnv> {
    let vars = proxy_vars(port, model, small_model);
    let path = settings_path(home_dir);
    let mut settings = load(&path);
    let env = settings
        .entry("env")
        .or_insert_with(|| Value::Object(Map::new()));
    if !env.is_object() {
        *env = Value::Object(Map::new());
    }
    if let Value::Object(env) = env {
        for (key, value) in &vars {
            env.insert(key.to_string(), Value::String(value.clone()));
        }
    }
    save(&path, settings)?;
    tracing::info!("Wrote proxy env to {}", path.display());

    Ok(WrittenEnv {
        ok: true,
        path: path.to_string_lossy().to_string(),
        vars: vars.iter().map(|(key, _)| key.to_string()).collect(),
    })
}

/// Removes the proxy variables, dropping the env block once it is empty.
pub fn clear(home_dir: &Path) -> anyhow::Result<ClearedEnv> {
    let path = settings_path(home_dir);
    let mut settings = load(&path);
    let cleared = ClearedEnv {
        ok: true,
        path: path.to_string_lossy().to_string(),
    };

    let Some(Value::Object(env)) = settings.get_mut("env") else {
        return Ok(cleared);
    };
    for key in ENV_KEYS {
        env.remove(key);
    }
    if env.is_empty() {
        settings.remove("env");
    }
    save(&path, settings)?;
    Ok(cleared)
}

pub fn check(home_dir: &Path) -> EnvCheck {
    let settings = load(&settings_path(home_dir));
    let base_url = settings
        .get("env")
        .and_then(|env| env.get("ANTHROPIC_BASE_URL"))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string);
    EnvCheck {
        written: base_url.is_some(),
        base_url,
    }
}

// ============================================================================
// Terminal launch
// ============================================================================

#[derive(Debug, Serialize, PartialEq)]
pub struct Launched {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub canceled: bool,
}

impl Launched {
    pub fn canceled() -> Self {
        Self {
            ok: false,
            cwd: None,
            canceled: true,
        }
    }
}

/// Program and arguments of a terminal launch.
#[derive(Debug, PartialEq)]
pub struct TerminalCommand {
    pub program: String,
    pub args: Vec<String>,
}

fn powershell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn posix_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// PowerShell line that enters `cwd`, exports `vars` and runs `claude`.
pub fn powershell_script(cwd: &Path, vars: &[(&str, String)]) -> String {
    let mut parts = vec![format!(
        "Set-Location {}",
        powershell_quote(&cwd.to_string_lossy())
    )];
    parts.extend(
        vars.iter()
            .map(|(key, value)| format!("$env:{}={}", key, powershell_quote(value))),
    );
    parts.push("claude".to_string());
    parts.join("; ")
}

/// POSIX shell line that enters `cwd`, exports `vars` and runs `claude`.
pub fn posix_script(cwd: &Path, vars: &[(&str, String)]) -> String {
    let mut parts = vec![format!("cd {}", posix_quote(&cwd.to_string_lossy()))];
    parts.extend(
        vars.iter()
            .map(|(key, value)| format!("export {}={}", key, posix_quote(value))),
    );
    parts.push("claude".to_string());
    parts.join("; ")
}

/// A visible PowerShell window through `cmd /c start`.
pub fn windows_terminal(cwd: &Path, vars: &[(&str, String)]) -> TerminalCommand {
    TerminalCommand {
        program: "cmd.exe".to_string(),
        args: vec![
            "/c".to_string(),
            "start".to_string(),
            "powershell.exe".to_string(),
            "-NoExit".to_string(),
            "-Command".to_string(),
            powershell_script(cwd, vars),
        ],
    }
}

/// A Terminal.app window driven by AppleScript.
pub fn macos_terminal(cwd: &Path, vars: &[(&str, String)]) -> TerminalCommand {
    let script = posix_script(cwd, vars)
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    TerminalCommand {
        program: "osascript".to_string(),
        args: vec![
            "-e".to_string(),
            format!("tell application \"Terminal\" to do script \"{}\"", script),
            "-e".to_string(),
            "tell application \"Terminal\" to activate".to_string(),
        ],
    }
}

/// The desktop's default terminal emulator, kept open after `claude` exits.
pub fn linux_terminal(cwd: &Path, vars: &[(&str, String)]) -> TerminalCommand {
    TerminalCommand {
        program: "x-terminal-emulator".to_string(),
        args: vec![
            "-e".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            format!("{}; exec \"${{SHELL:-sh}}\"", posix_script(cwd, vars)),
        ],
    }
}

pub fn terminal_command(cwd: &Path, vars: &[(&str, String)]) -> TerminalCommand {
    if cfg!(windows) {
        windows_terminal(cwd, vars)
    } else if cfg!(target_os = "macos") {
        macos_terminal(cwd, vars)
    } else {
        linux_terminal(cwd, vars)
    }
}

/// Opens a terminal in `cwd` running `claude` against the local proxy.
pub fn launch(cwd: &Path, port: u16, model: &str, small_model: &str) -> anyhow::Result<Launched> {
    let vars = proxy_vars(port, model, small_model);
    let command = terminal_command(cwd, &vars);
    std::process::Command::new(&command.program)
        .args(&command.args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to launch {}", command.program))?;
    tracing::info!("Launched Claude Code in {}", cwd.display());

    Ok(Launched {
        ok: true,
        cwd: Some(cwd.to_string_lossy().to_string()),
        canceled: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read(home: &Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(settings_path(home)).unwrap()).unwrap()
    }

    #[test]
    fn write_merges_into_existing_settings() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".claude")).unwrap();
        std::fs::write(
            settings_path(home.path()),
            r#"{"theme":"dark","env":{"EDITOR":"vim"}}"#,
        )
        .unwrap();

        let written = write(home.path(), 4399, "gpt-4.1", "").unwrap();
        assert_eq!(written.vars.len(), ENV_KEYS.len());

        let settings = read(home.path());
        assert_eq!(settings["theme"], "dark");
        assert_eq!(settings["env"]["EDITOR"], "vim");
        assert_eq!(settings["env"]["ANTHROPIC_BASE_URL"], "http://localhost:4399");
        assert_eq!(settings["env"]["ANTHROPIC_SMALL_FAST_MODEL"], "gpt-4.1");

        assert_eq!(
            check(home.path()),
            EnvCheck {
                written: true,
                base_url: Some("http://localhost:4399".to_string()),
            }
        );
    }

    #[test]
    fn clear_removes_only_proxy_keys() {
        let home = tempfile::tempdir().unwrap();
        write(home.path(), 5000, "claude-sonnet-4", "gpt-4.1-mini").unwrap();
        let mut settings = read(home.path());
        settings["env"]["EDITOR"] = json!("vim");
        std::fs::write(settings_path(home.path()), settings.to_string()).unwrap();

        clear(home.path()).unwrap();
        assert_eq!(read(home.path())["env"], json!({ "EDITOR": "vim" }));

        std::fs::write(settings_path(home.path()), r#"{"env":{"ANTHROPIC_MODEL":"x"}}"#).unwrap();
        clear(home.path()).unwrap();
        assert_eq!(read(home.path()), json!({}));
        assert!(!check(home.path()).written);
    }

    #[test]
    fn missing_or_malformed_settings_are_treated_as_empty() {
        let home = tempfile::tempdir().unwrap();
        assert_eq!(
            check(home.path()),
            EnvCheck {
                written: false,
                base_url: None,
            }
        );
        clear(home.path()).unwrap();
        assert!(!settings_path(home.path()).exists());

        std::fs::create_dir_all(home.path().join(".claude")).unwrap();
        std::fs::write(settings_path(home.path()), "{ not json").unwrap();
        write(home.path(), 4399, "m", "s").unwrap();
        assert_eq!(read(home.path())["env"]["ANTHROPIC_DEFAULT_HAIKU_MODEL"], "s");
    }

    #[test]
    fn powershell_launch_sets_every_proxy_var() {
        let vars = proxy_vars(4399, "gpt-4.1", "");
        let command = windows_terminal(Path::new(r"C:\work\it's"), &vars);
        assert_eq!(command.program, "cmd.exe");
        assert_eq!(
            &command.args[..5],
            &["/c", "start", "powershell.exe", "-NoExit", "-Command"]
        );

        let script = &command.args[5];
        assert!(script.starts_with(r"Set-Location 'C:\work\it''s'; "));
        assert!(script.contains("$env:ANTHROPIC_BASE_URL='http://localhost:4399'"));
        assert!(script.contains("$env:ANTHROPIC_DEFAULT_HAIKU_MODEL='gpt-4.1'"));
        assert_eq!(script.matches("$env:").count(), ENV_KEYS.len());
        assert!(script.ends_with("; claude"));
    }

    #[test]
    fn posix_launch_quotes_values() {
        let vars = proxy_vars(5000, "it's", "small");
        let script = posix_script(Path::new("/home/me/my project"), &vars);
        assert!(script.starts_with("cd '/home/me/my project'; "));
        assert!(script.contains(r"export ANTHROPIC_MODEL='it'\''s'"));
        assert!(script.contains("export ANTHROPIC_SMALL_FAST_MODEL='small'"));
        assert!(script.ends_with("; claude"));

        let command = macos_terminal(Path::new("/tmp"), &vars);
        assert_eq!(command.program, "osascript");
        assert!(command.args[1].starts_with(r#"tell application "Terminal" to do script "cd '/tmp'; "#));
    }

    #[test]
    fn canceled_launch_serialises_without_cwd() {
        assert_eq!(
            serde_json::to_value(Launched::canceled()).unwrap(),
            json!({ "ok": false, "canceled": true })
        );
        let launched = Launched {
            ok: true,
            cwd: Some("/tmp".to_string()),
            canceled: false,
        };
        assert_eq!(
            serde_json::to_value(launched).unwrap(),
            json!({ "ok": true, "cwd": "/tmp" })
        );
    }
}
