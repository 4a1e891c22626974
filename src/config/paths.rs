//! Daemon directory resolution
//!
//! Everything the daemon persists lives under a single home directory,
//! `$HOME/.agentkube` by default. The `AGENTKUBE_DIR` environment variable
//! overrides it, which tests rely on to stay out of the real home.

use std::path::{Path, PathBuf};

/// Get the daemon home directory
///
/// Checks the AGENTKUBE_DIR environment variable first, then falls back to
/// `~/.agentkube`.
pub fn daemon_home() -> PathBuf {
    std::env::var("AGENTKUBE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            use directories::BaseDirs;
            BaseDirs::new()
                .map(|dirs| dirs.home_dir().join(".agentkube"))
                .unwrap_or_else(|| PathBuf::from(".").join(".agentkube"))
        })
}

/// Get the settings file path (`settings.json`)
pub fn settings_path() -> PathBuf {
    daemon_home().join("settings.json")
}

/// Get the cluster watcher configuration file path
///
/// Checks AGENTKUBE_WATCHER_CONFIG first, then `<home>/watcher.yaml`.
pub fn watcher_config_path() -> PathBuf {
    std::env::var("AGENTKUBE_WATCHER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| daemon_home().join("watcher.yaml"))
}

/// Get the directory where uploaded kubeconfigs are persisted
pub fn uploads_dir() -> PathBuf {
    daemon_home().join("uploads")
}

/// Path for a persisted uploaded kubeconfig
pub fn upload_path(source_name: &str) -> PathBuf {
    uploads_dir().join(format!("{}.yaml", sanitize_source_name(source_name)))
}

/// Strip path separators and dots out of an upload source name so it cannot
/// escape the uploads directory.
pub fn sanitize_source_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_home_suffix() {
        if std::env::var("AGENTKUBE_DIR").is_err() {
            assert!(daemon_home().to_string_lossy().contains(".agentkube"));
        }
    }

    #[test]
    fn test_upload_path_is_sanitized() {
        let path = upload_path("../../etc/passwd");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(!name.contains('/'));
        assert!(!name.contains(".."));
        assert!(name.ends_with(".yaml"));
    }

    #[test]
    fn test_sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_source_name("staging-eu_1"), "staging-eu_1");
        assert_eq!(sanitize_source_name("a b/c"), "a_b_c");
    }
}
