use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub account: AccountConfig,
    #[serde(default, rename = "folder")]
    pub folders: Vec<FolderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Custom path for the selective-sync journal database
    pub journal_path: Option<PathBuf>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_listing_retries")]
    pub max_listing_retries: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            request_timeout_secs: default_request_timeout(),
            max_listing_retries: default_max_listing_retries(),
        }
    }
}

fn default_request_timeout() -> u64 {
    120
}
fn default_max_listing_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// WebDAV root of the account, e.g. `https://cloud.example.org/remote.php/webdav`
    pub url: String,
    pub username: Option<String>,
    /// Inline password; prefer `password_env`
    pub password: Option<String>,
    /// Environment variable holding the password
    pub password_env: Option<String>,
}

impl AccountConfig {
    /// Resolve the password from the config or the named environment variable.
    pub fn password(&self) -> Result<Option<String>> {
        if let Some(ref p) = self.password {
            return Ok(Some(p.clone()));
        }
        match self.password_env {
            Some(ref var) => std::env::var(var)
                .map(Some)
                .with_context(|| format!("Environment variable {var} is not set")),
            None => Ok(None),
        }
    }

    /// Remote base URL of a folder configured with `remote_path`.
    pub fn folder_url(&self, remote_path: &str) -> String {
        let base = self.url.trim_end_matches('/');
        let path = remote_path.trim_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{path}")
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderConfig {
    pub alias: String,
    /// Folder path below the account's WebDAV root
    #[serde(default)]
    pub remote_path: String,
    pub local_path: PathBuf,
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("selsync").join("config.toml"))
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let content = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "Failed to read config file: {}\n\
             See config/selsync.example.toml for an example.",
            path.display()
        )
    })?;

    parse_config(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}

fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse TOML")?;

    if config.account.url.is_empty() {
        anyhow::bail!("account.url must not be empty");
    }
    let mut seen = HashSet::new();
    for folder in &config.folders {
        if folder.alias.is_empty() {
            anyhow::bail!("folder alias must not be empty");
        }
        if !seen.insert(folder.alias.as_str()) {
            anyhow::bail!("duplicate folder alias '{}'", folder.alias);
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[account]
url = "https://cloud.example.org/remote.php/webdav/"
username = "alice"
password_env = "SELSYNC_TEST_UNSET_PASSWORD"

[[folder]]
alias = "Documents"
remote_path = "/Documents"
local_path = "/home/alice/Documents"

[[folder]]
alias = "Everything"
local_path = "/home/alice/Cloud"
"#;

    #[test]
    fn test_load_config_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        f.flush().unwrap();

        let cfg = load_config(Some(f.path())).unwrap();
        assert_eq!(cfg.general.request_timeout_secs, 120);
        assert_eq!(cfg.general.max_listing_retries, 5);
        assert!(cfg.general.journal_path.is_none());
        assert_eq!(cfg.folders.len(), 2);
        assert_eq!(cfg.folders[1].remote_path, "");
    }

    #[test]
    fn test_folder_url() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(
            cfg.account.folder_url(&cfg.folders[0].remote_path),
            "https://cloud.example.org/remote.php/webdav/Documents"
        );
        assert_eq!(
            cfg.account.folder_url(&cfg.folders[1].remote_path),
            "https://cloud.example.org/remote.php/webdav"
        );
    }

    #[test]
    fn test_password_sources() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert!(cfg.account.password().is_err());

        let mut account = cfg.account.clone();
        account.password = Some("secret".into());
        assert_eq!(account.password().unwrap().as_deref(), Some("secret"));

        account.password = None;
        account.password_env = None;
        assert_eq!(account.password().unwrap(), None);
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let content = format!(
            "{SAMPLE}\n[[folder]]\nalias = \"Documents\"\nlocal_path = \"/tmp/x\"\n"
        );
        let err = parse_config(&content).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate folder alias"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/selsync.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
    }
}
