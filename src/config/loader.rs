//! Configuration loading
//!
//! Settings and watcher config are loaded once at startup. A missing file is
//! not an error (defaults apply); a malformed file is, so a typo never
//! silently reverts the daemon to defaults.

use super::{paths, schema::Settings, schema::WatcherConfig};
use anyhow::{Context, Result};
use std::path::Path;

/// Load `settings.json` from the daemon home.
///
/// Returns defaults when the file does not exist.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&paths::settings_path())
}

/// Load settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))
}

/// Load `watcher.yaml` from the daemon home.
///
/// Returns defaults (watcher disabled) when the file does not exist.
pub fn load_watcher_config() -> Result<WatcherConfig> {
    load_watcher_config_from(&paths::watcher_config_path())
}

/// Load watcher config from an explicit path.
pub fn load_watcher_config_from(path: &Path) -> Result<WatcherConfig> {
    if !path.exists() {
        return Ok(WatcherConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read watcher config: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse watcher config: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_settings_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("settings.json")).unwrap();
        assert!(settings.kubeconfig.external_paths.is_empty());
    }

    #[test]
    fn test_malformed_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{{ not json").unwrap();

        assert!(load_settings_from(&path).is_err());
    }

    #[test]
    fn test_watcher_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watcher.yaml");
        std::fs::write(
            &path,
            "enabled: true\nincludeClusters: [ctxA]\nresources: [pods]\n",
        )
        .unwrap();

        let config = load_watcher_config_from(&path).unwrap();
        assert!(config.enabled);
        assert_eq!(config.include_clusters, vec!["ctxA"]);
        assert_eq!(config.resources, vec!["pods"]);
    }
}
