//! Configuration schema definitions
//!
//! Defines the structure of `settings.json` and `watcher.yaml` using serde.
//! Both files are optional; missing fields fall back to defaults so a partial
//! file never fails to parse.

use serde::{Deserialize, Serialize};

/// Root settings structure (`settings.json`)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Kubeconfig source settings
    #[serde(default)]
    pub kubeconfig: KubeconfigSettings,

    /// Image scan integration (parsed but handled outside the control plane)
    #[serde(default)]
    pub image_scans: ImageScanSettings,
}

/// Kubeconfig source settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigSettings {
    /// Additional kubeconfig files or directories to load and watch
    #[serde(default)]
    pub external_paths: Vec<String>,
}

/// Image scan settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageScanSettings {
    /// Enable the optional image scanner integration
    #[serde(default)]
    pub enable: bool,
}

/// Cluster watcher configuration (`watcher.yaml`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatcherConfig {
    /// Master switch; when false no informers are started
    #[serde(default)]
    pub enabled: bool,

    /// Resource kinds to watch (pods, events, deployments, services, nodes)
    #[serde(default = "default_resources")]
    pub resources: Vec<String>,

    /// Allow-list; when non-empty only these clusters are watched
    #[serde(default)]
    pub include_clusters: Vec<String>,

    /// Deny-list; consulted only when includeClusters is empty
    #[serde(default)]
    pub skip_clusters: Vec<String>,

    /// Merge same-object events arriving within a 50ms window
    #[serde(default)]
    pub coalesce: bool,

    /// Dispatcher selection
    #[serde(default)]
    pub handler: HandlerConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            resources: default_resources(),
            include_clusters: Vec::new(),
            skip_clusters: Vec::new(),
            coalesce: false,
            handler: HandlerConfig::default(),
        }
    }
}

impl WatcherConfig {
    /// Apply the include/skip precedence to a cluster name.
    ///
    /// `includeClusters` is an allow-list when non-empty; otherwise
    /// `skipClusters` is a deny-list; otherwise everything is allowed.
    pub fn allows_cluster(&self, name: &str) -> bool {
        if !self.include_clusters.is_empty() {
            return self.include_clusters.iter().any(|c| c == name);
        }
        !self.skip_clusters.iter().any(|c| c == name)
    }
}

/// Dispatcher handler configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandlerConfig {
    /// Webhook sink; absent means the default (drop) dispatcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
}

/// Webhook sink configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Target URL for event POSTs
    pub url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_resources() -> Vec<String> {
    vec!["pods".to_string(), "events".to_string()]
}

fn default_webhook_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_parse_partial_json() {
        let settings: Settings =
            serde_json::from_str(r#"{"kubeconfig":{"externalPaths":["/tmp/a.yaml"]}}"#).unwrap();
        assert_eq!(settings.kubeconfig.external_paths, vec!["/tmp/a.yaml"]);
        assert!(!settings.image_scans.enable);
    }

    #[test]
    fn test_settings_parse_empty_object() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert!(settings.kubeconfig.external_paths.is_empty());
    }

    #[test]
    fn test_watcher_config_defaults() {
        let config: WatcherConfig = serde_yaml::from_str("enabled: true").unwrap();
        assert!(config.enabled);
        assert_eq!(config.resources, vec!["pods", "events"]);
        assert!(!config.coalesce);
        assert!(config.handler.webhook.is_none());
    }

    #[test]
    fn test_watcher_config_webhook() {
        let config: WatcherConfig = serde_yaml::from_str(
            "enabled: true\nhandler:\n  webhook:\n    url: http://localhost:9999/events\n",
        )
        .unwrap();
        let webhook = config.handler.webhook.unwrap();
        assert_eq!(webhook.url, "http://localhost:9999/events");
        assert_eq!(webhook.timeout_secs, 10);
    }

    #[test]
    fn test_include_clusters_takes_precedence() {
        let config = WatcherConfig {
            include_clusters: vec!["ctxA".to_string()],
            skip_clusters: vec!["ctxA".to_string()],
            ..Default::default()
        };
        // An allow-listed cluster wins even when it is also in skipClusters
        assert!(config.allows_cluster("ctxA"));
        assert!(!config.allows_cluster("ctxB"));
    }

    #[test]
    fn test_skip_clusters_deny_list() {
        let config = WatcherConfig {
            skip_clusters: vec!["ctxB".to_string()],
            ..Default::default()
        };
        assert!(config.allows_cluster("ctxA"));
        assert!(!config.allows_cluster("ctxB"));
    }

    #[test]
    fn test_empty_filters_allow_all() {
        let config = WatcherConfig::default();
        assert!(config.allows_cluster("anything"));
    }
}
