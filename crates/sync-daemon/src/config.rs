//! Daemon configuration from CLI flags and environment variables.

use clap::Args;
use std::path::PathBuf;
use thiserror::Error;

use crate::gist::DEFAULT_API_URL;

/// Where the local bookmarks live and how to reach the remote document.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to the JSON bookmarks file (supports ~)
    #[arg(long, env = "BOOKMARK_SYNC_FILE", default_value = "~/.bookmark-sync/bookmarks.json")]
    pub file: String,

    /// Directory for replica state (defaults to the platform data dir)
    #[arg(long, env = "BOOKMARK_SYNC_STATE_DIR")]
    pub state_dir: Option<String>,

    /// GitHub token with gist scope
    #[arg(long, env = "BOOKMARK_SYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Gist holding the shared document
    #[arg(long, env = "BOOKMARK_SYNC_GIST_ID")]
    pub gist_id: Option<String>,

    /// Create a new gist when no gist id is set or the gist is gone
    #[arg(long)]
    pub create_gist: bool,

    /// Gist API base URL; point at the mock server for local testing
    #[arg(long, env = "BOOKMARK_SYNC_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Name recorded for this replica in the shared document
    #[arg(long, env = "BOOKMARK_SYNC_DEVICE_NAME")]
    pub device_name: Option<String>,

    /// Do not sync after local edits
    #[arg(long)]
    pub no_auto_sync: bool,

    /// Do not sync shortly after startup
    #[arg(long)]
    pub no_sync_on_startup: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("API URL must start with http:// or https://: {0}")]
    InvalidApiUrl(String),

    #[error("Bookmarks file path has no file name: {0}")]
    InvalidBookmarksFile(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bookmarks_file: PathBuf,
    pub state_dir: PathBuf,
    pub token: Option<String>,
    pub gist_id: Option<String>,
    pub create_gist: bool,
    pub api_url: String,
    pub device_name: String,
    pub auto_sync: bool,
    pub sync_on_startup: bool,
}

impl ConfigArgs {
    pub fn resolve(self) -> Config {
        let state_dir = match self.state_dir {
            Some(dir) => expand_tilde(&dir),
            None => default_state_dir(),
        };
        Config {
            bookmarks_file: expand_tilde(&self.file),
            state_dir,
            token: self.token.filter(|t| !t.trim().is_empty()),
            gist_id: self.gist_id.filter(|g| !g.trim().is_empty()),
            create_gist: self.create_gist,
            api_url: self.api_url.trim_end_matches('/').to_string(),
            device_name: self.device_name.unwrap_or_else(default_device_name),
            auto_sync: !self.no_auto_sync,
            sync_on_startup: !self.no_sync_on_startup,
        }
    }
}

impl Config {
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ConfigError::InvalidApiUrl(self.api_url.clone()));
        }
        if self.bookmarks_file.file_name().is_none() {
            return Err(ConfigError::InvalidBookmarksFile(
                self.bookmarks_file.display().to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("bookmark-sync"))
        .unwrap_or_else(|| expand_tilde("~/.bookmark-sync"))
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "bookmark-sync".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ConfigArgs,
    }

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["test"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().args.resolve()
    }

    #[test]
    fn test_flags() {
        let config = parse(&[
            "--file",
            "/tmp/b.json",
            "--state-dir",
            "/tmp/state",
            "--token",
            "t0k",
            "--gist-id",
            "abc",
            "--api-url",
            "http://127.0.0.1:3000/",
            "--device-name",
            "laptop",
            "--no-auto-sync",
        ]);

        assert_eq!(config.bookmarks_file, PathBuf::from("/tmp/b.json"));
        assert_eq!(config.state_file(), PathBuf::from("/tmp/state/state.json"));
        assert_eq!(config.token.as_deref(), Some("t0k"));
        assert_eq!(config.gist_id.as_deref(), Some("abc"));
        assert_eq!(config.api_url, "http://127.0.0.1:3000");
        assert_eq!(config.device_name, "laptop");
        assert!(!config.auto_sync);
        assert!(config.sync_on_startup);
        assert!(!config.create_gist);
    }

    #[test]
    fn test_create_gist_flag() {
        let config = parse(&["--file", "/tmp/b.json", "--create-gist"]);
        assert!(config.create_gist);
        assert_eq!(config.gist_id, None);
    }

    #[test]
    fn test_blank_token_is_unset() {
        let config = parse(&["--file", "/tmp/b.json", "--token", "  ", "--gist-id", ""]);
        assert_eq!(config.token, None);
        assert_eq!(config.gist_id, None);
    }

    #[test]
    fn test_validate() {
        let config = parse(&["--file", "/tmp/b.json"]);
        assert_eq!(config.validate(), Ok(()));

        let bad = parse(&["--file", "/tmp/b.json", "--api-url", "ftp://x"]);
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidApiUrl(_))));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~"), home);
            assert_eq!(expand_tilde("~/b.json"), home.join("b.json"));
        }
    }
}
