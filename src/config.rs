// Copilot Proxy GUI - Configuration
// Fixed authorization server identity, on-disk layout and persisted GUI settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// GitHub OAuth app used for the device flow
pub mod github {
    pub const BASE_URL: &str = "https://github.com";
    pub const CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
    pub const SCOPES: &str = "read:user";
    pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

    /// Authorization server base URL, overridable for staging servers
    pub fn base_url() -> String {
        std::env::var(super::env::GITHUB_URL)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| BASE_URL.to_string())
    }
}

/// Environment overrides
pub mod env {
    pub const GITHUB_URL: &str = "COPILOT_PROXY_GITHUB_URL";
    pub const REPO: &str = "COPILOT_PROXY_REPO";
    pub const WORKER: &str = "COPILOT_PROXY_WORKER";
}

pub const DEFAULT_PORT: u16 = 4399;
pub const TOKEN_FILE: &str = "github_token";
pub const ENCRYPTED_SUFFIX: &str = ".enc";
const SETTINGS_FILE: &str = "settings.json";

/// Where the credential lives now and where older releases left it.
#[derive(Clone, Debug)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub legacy_dir: PathBuf,
    pub home_dir: PathBuf,
}

impl AppPaths {
    pub fn new(data_dir: PathBuf, home_dir: &Path) -> Self {
        Self {
            data_dir,
            legacy_dir: home_dir.join(".local").join("share").join("copilot-proxy"),
            home_dir: home_dir.to_path_buf(),
        }
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE)
    }

    pub fn legacy_token_path(&self) -> PathBuf {
        self.legacy_dir.join(TOKEN_FILE)
    }
}

/// Appends the encrypted-blob suffix to a plaintext token path
pub fn encrypted_variant(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(ENCRYPTED_SUFFIX);
    PathBuf::from(name)
}

/// Proxy options chosen in the GUI (non-sensitive, stored in app data)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    pub port: u16,
    pub account_type: String,
    pub verbose: bool,
    pub manual_approve: bool,
    pub rate_limit_seconds: Option<u32>,
    pub rate_limit_wait: bool,
    pub proxy_env: bool,
    pub show_token: bool,
    pub auto_start: bool,
    pub default_model: String,
    pub default_small_model: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            account_type: "individual".to_string(),
            verbose: false,
            manual_approve: false,
            rate_limit_seconds: None,
            rate_limit_wait: false,
            proxy_env: false,
            show_token: false,
            auto_start: false,
            default_model: String::new(),
            default_small_model: String::new(),
        }
    }
}

impl ProxySettings {
    /// Worker arguments for these settings, in the order the worker documents them
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "start".to_string(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        if !self.account_type.is_empty() && self.account_type != "individual" {
            args.push("--account-type".to_string());
            args.push(self.account_type.clone());
        }
        if self.verbose {
            args.push("--verbose".to_string());
        }
        if self.manual_approve {
            args.push("--manual".to_string());
        }
        if let Some(seconds) = self.rate_limit_seconds {
            args.push("--rate-limit".to_string());
            args.push(seconds.to_string());
        }
        if self.rate_limit_wait {
            args.push("--wait".to_string());
        }
        if self.proxy_env {
            args.push("--proxy-env".to_string());
        }
        if self.show_token {
            args.push("--show-token".to_string());
        }
        args
    }
}

/// Settings file operations
pub mod settings {
    use super::*;

    fn settings_path(data_dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(data_dir)?;
        Ok(data_dir.join(SETTINGS_FILE))
    }

    /// Load settings from file
    pub fn load(data_dir: &Path) -> anyhow::Result<ProxySettings> {
        let path = settings_path(data_dir)?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let settings: ProxySettings = serde_json::from_str(&content)?;
            Ok(settings)
        } else {
            Ok(ProxySettings::default())
        }
    }

    /// Save settings to file
    pub fn save(data_dir: &Path, settings: &ProxySettings) -> anyhow::Result<()> {
        let path = settings_path(data_dir)?;
        let content = serde_json::to_string_pretty(settings)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_produce_default_start_args() {
        assert_eq!(
            ProxySettings::default().to_cli_args(),
            vec!["start", "--port", "4399"]
        );
    }

    #[test]
    fn cli_args_follow_enabled_options() {
        let settings = ProxySettings {
            port: 5000,
            account_type: "business".to_string(),
            verbose: true,
            rate_limit_seconds: Some(30),
            rate_limit_wait: true,
            ..ProxySettings::default()
        };
        assert_eq!(
            settings.to_cli_args(),
            vec![
                "start",
                "--port",
                "5000",
                "--account-type",
                "business",
                "--verbose",
                "--rate-limit",
                "30",
                "--wait"
            ]
        );
    }

    #[test]
    fn settings_survive_save_and_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(settings::load(dir.path()).unwrap(), ProxySettings::default());

        let custom = ProxySettings {
            port: 4400,
            default_model: "gpt-4o".to_string(),
            ..ProxySettings::default()
        };
        settings::save(dir.path(), &custom).unwrap();
        assert_eq!(settings::load(dir.path()).unwrap(), custom);

        std::fs::write(dir.path().join("settings.json"), r#"{"port": 4500}"#).unwrap();
        let loaded = settings::load(dir.path()).unwrap();
        assert_eq!(loaded.port, 4500);
        assert_eq!(loaded.account_type, "individual");
    }

    #[test]
    #[cfg(unix)]
    fn paths_place_encrypted_variant_next_to_plaintext() {
        let paths = AppPaths::new(PathBuf::from("/data/app"), Path::new("/home/u"));
        assert_eq!(paths.token_path(), PathBuf::from("/data/app/github_token"));
        assert_eq!(
            encrypted_variant(&paths.token_path()),
            PathBuf::from("/data/app/github_token.enc")
        );
        assert_eq!(
            paths.legacy_token_path(),
            PathBuf::from("/home/u/.local/share/copilot-proxy/github_token")
        );
    }
}
