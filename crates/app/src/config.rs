//! Configuration file loading
//!
//! Settings live in `jetlink.toml` under the platform config directory.
//! Every section is optional; a missing default file means defaults.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use jetlink_net::{HubConfig, LinkConfig};
use rand::Rng;
use serde::Deserialize;

const CONFIG_FILE: &str = "jetlink.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// `[client]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    /// Own identifier; generated when absent
    pub user_id: Option<String>,
    /// Default target for outgoing messages
    pub peer: Option<String>,
    /// Where received images are written
    pub download_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub client: ClientSection,
    pub hub: HubConfig,
    pub link: LinkConfig,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "example", "jetlink")
}

/// Default location of the config file, if the platform has one
pub fn default_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Load from `path`, or from the default location
///
/// An explicit path must exist. The default file may be absent.
pub fn load(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match default_path() {
            Some(p) => (p, false),
            None => return Ok(AppConfig::default()),
        },
    };

    match std::fs::read_to_string(&path) {
        Ok(s) => load_from_str(&s),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(AppConfig::default())
        }
        Err(source) => Err(ConfigError::Read { path, source }),
    }
}

pub fn load_from_str(s: &str) -> Result<AppConfig, ConfigError> {
    Ok(toml::from_str(s)?)
}

/// Configured identifier, or a fresh `user_NNNN`
pub fn resolve_user_id(configured: Option<String>) -> String {
    configured
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("user_{}", rand::thread_rng().gen_range(1000..=9999)))
}

/// Directory for received images
pub fn download_dir(configured: Option<PathBuf>) -> PathBuf {
    configured
        .or_else(|| project_dirs().map(|dirs| dirs.data_dir().join("images")))
        .unwrap_or_else(|| std::env::temp_dir().join("jetlink-images"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_defaults() {
        let cfg = load_from_str("").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.hub.port, 8888);
    }

    #[test]
    fn test_sections_parsed() {
        let cfg = load_from_str(
            r#"
            [client]
            user_id = "user_1097"
            peer = "user_4821"

            [hub]
            port = 9000

            [link]
            host = "10.0.2.2"
            retry_interval_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(cfg.client.user_id.as_deref(), Some("user_1097"));
        assert_eq!(cfg.client.peer.as_deref(), Some("user_4821"));
        assert_eq!(cfg.hub.port, 9000);
        assert_eq!(cfg.link.host, "10.0.2.2");
        assert_eq!(cfg.link.retry_interval_ms, 500);
        assert_eq!(cfg.link.port, 8888);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            load_from_str("[link]\nretry = 1\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[hub]\nport = 7000").unwrap();

        let cfg = load(Some(file.path())).unwrap();
        assert_eq!(cfg.hub.port, 7000);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_generated_user_id() {
        let id = resolve_user_id(None);
        let digits = id.strip_prefix("user_").unwrap();
        assert_eq!(digits.len(), 4);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));

        assert_eq!(resolve_user_id(Some("me".into())), "me");
        assert!(resolve_user_id(Some("  ".into())).starts_with("user_"));
    }

    #[test]
    fn test_download_dir_override() {
        let dir = PathBuf::from("/tmp/jl");
        assert_eq!(download_dir(Some(dir.clone())), dir);
    }
}
