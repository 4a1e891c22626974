//! Cluster context records
//!
//! A [`ClusterContext`] is one named entry from a kubeconfig, carrying enough
//! of the original document to rebuild a REST client. Records are immutable:
//! reloading a source replaces them wholesale, it never mutates in place.

use chrono::{DateTime, Utc};
use kube::config::{AuthInfo, Kubeconfig, NamedContext};
use serde::Serialize;

/// Where a context was registered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextSource {
    /// The primary kubeconfig (`--kubeconfig` or `~/.kube/config`)
    Primary,
    /// A path listed in `settings.json` `kubeconfig.externalPaths`
    ExternalPath,
    /// Inline content accepted through the upload API
    Uploaded,
    /// A cluster registered programmatically at runtime
    DynamicCluster,
}

impl ContextSource {
    /// Short tag used to disambiguate colliding context names.
    pub fn tag(&self) -> &'static str {
        match self {
            ContextSource::Primary => "primary",
            ContextSource::ExternalPath => "external",
            ContextSource::Uploaded => "uploaded",
            ContextSource::DynamicCluster => "dynamic",
        }
    }
}

/// How a context authenticates against its API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
    Token,
    TokenFile,
    Basic,
    ClientCertificate,
    ExecPlugin,
    None,
}

impl AuthType {
    fn classify(auth: &AuthInfo) -> Self {
        if auth.token.is_some() {
            AuthType::Token
        } else if auth.token_file.is_some() {
            AuthType::TokenFile
        } else if auth.username.is_some() {
            AuthType::Basic
        } else if auth.exec.is_some() {
            AuthType::ExecPlugin
        } else if auth.client_certificate.is_some() || auth.client_certificate_data.is_some() {
            AuthType::ClientCertificate
        } else {
            AuthType::None
        }
    }
}

/// One registered cluster context.
///
/// `name` is the store-wide unique identifier; it matches the kubeconfig
/// context name unless a collision forced a source-tag prefix. `raw` is a
/// minimized kubeconfig holding exactly the records this context needs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterContext {
    pub name: String,
    pub source: ContextSource,
    pub server: String,
    pub auth_type: AuthType,
    /// Default namespace for requests that do not name one
    pub namespace: Option<String>,
    pub user: String,
    pub cluster: String,
    /// File path or upload path this context came from
    pub origin: String,
    pub created_at: DateTime<Utc>,
    /// Expiry deadline for uploaded contexts with a TTL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Minimized kubeconfig used to build REST clients
    #[serde(skip)]
    pub raw: Kubeconfig,
}

impl ClusterContext {
    /// True once an expiry deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Fingerprint of the underlying kubeconfig records, used to decide
    /// whether a reload actually changed anything (unchanged entries keep
    /// their cached REST client).
    pub fn fingerprint(&self) -> String {
        serde_yaml::to_string(&self.raw).unwrap_or_default()
    }
}

/// Split a parsed kubeconfig into one [`ClusterContext`] per named context.
///
/// Contexts that reference a missing cluster or user are skipped with a
/// warning rather than failing the whole document; a kubeconfig assembled
/// from several tools routinely carries a few dangling references.
pub fn split_contexts(
    kubeconfig: &Kubeconfig,
    source: ContextSource,
    origin: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Vec<ClusterContext> {
    let mut out = Vec::new();

    for named in &kubeconfig.contexts {
        let Some(context) = &named.context else {
            continue;
        };

        let Some(cluster_entry) = kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
        else {
            tracing::warn!(
                "Context '{}' references unknown cluster '{}', skipping",
                named.name,
                context.cluster
            );
            continue;
        };

        let user_name = context.user.clone().unwrap_or_default();
        let auth_entry = kubeconfig.auth_infos.iter().find(|a| a.name == user_name);
        if auth_entry.is_none() && !user_name.is_empty() {
            tracing::warn!(
                "Context '{}' references unknown user '{}', skipping",
                named.name,
                user_name
            );
            continue;
        }

        let server = cluster_entry
            .cluster
            .as_ref()
            .and_then(|c| c.server.clone())
            .unwrap_or_default();

        let auth_type = auth_entry
            .and_then(|a| a.auth_info.as_ref())
            .map(AuthType::classify)
            .unwrap_or(AuthType::None);

        let raw = Kubeconfig {
            clusters: vec![cluster_entry.clone()],
            auth_infos: auth_entry.cloned().into_iter().collect(),
            contexts: vec![NamedContext {
                name: named.name.clone(),
                context: Some(context.clone()),
            }],
            current_context: Some(named.name.clone()),
            ..Default::default()
        };

        out.push(ClusterContext {
            name: named.name.clone(),
            source,
            server,
            auth_type,
            namespace: context.namespace.clone(),
            user: user_name,
            cluster: context.cluster.clone(),
            origin: origin.to_string(),
            created_at: Utc::now(),
            expires_at,
            raw,
        });
    }

    out
}

/// Synthesize a context from the in-cluster service account environment.
///
/// Mirrors what `kubectl` sees inside a pod: API server coordinates from
/// the service env vars, credentials from the mounted service account.
/// Returns None outside a cluster.
pub fn in_cluster_context() -> Option<ClusterContext> {
    const SA_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

    let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").ok()?;
    let server = format!("https://{}:{}", host, port);

    let namespace = std::fs::read_to_string(format!("{}/namespace", SA_DIR))
        .ok()
        .map(|s| s.trim().to_string());

    let raw = Kubeconfig {
        clusters: vec![kube::config::NamedCluster {
            name: "in-cluster".to_string(),
            cluster: Some(kube::config::Cluster {
                server: Some(server.clone()),
                certificate_authority: Some(format!("{}/ca.crt", SA_DIR)),
                ..Default::default()
            }),
        }],
        auth_infos: vec![kube::config::NamedAuthInfo {
            name: "in-cluster".to_string(),
            auth_info: Some(AuthInfo {
                token_file: Some(format!("{}/token", SA_DIR)),
                ..Default::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: "in-cluster".to_string(),
            context: Some(kube::config::Context {
                cluster: "in-cluster".to_string(),
                user: Some("in-cluster".to_string()),
                namespace: namespace.clone(),
                extensions: None,
            }),
        }],
        current_context: Some("in-cluster".to_string()),
        ..Default::default()
    };

    Some(ClusterContext {
        name: "in-cluster".to_string(),
        source: ContextSource::DynamicCluster,
        server,
        auth_type: AuthType::TokenFile,
        namespace,
        user: "in-cluster".to_string(),
        cluster: "in-cluster".to_string(),
        origin: "in-cluster".to_string(),
        created_at: Utc::now(),
        expires_at: None,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const TWO_CONTEXTS: &str = r#"
apiVersion: v1
kind: Config
clusters:
  - name: cluster-a
    cluster:
      server: https://a.example.com:6443
  - name: cluster-b
    cluster:
      server: https://b.example.com:6443
users:
  - name: user-a
    user:
      token: secret-a
  - name: user-b
    user:
      username: admin
      password: hunter2
contexts:
  - name: ctxA
    context:
      cluster: cluster-a
      user: user-a
      namespace: team-a
  - name: ctxB
    context:
      cluster: cluster-b
      user: user-b
current-context: ctxA
"#;

    #[test]
    fn test_split_contexts_basic() {
        let kubeconfig = Kubeconfig::from_yaml(TWO_CONTEXTS).unwrap();
        let contexts = split_contexts(&kubeconfig, ContextSource::Primary, "/tmp/kc.yaml", None);

        assert_eq!(contexts.len(), 2);
        let a = contexts.iter().find(|c| c.name == "ctxA").unwrap();
        assert_eq!(a.server, "https://a.example.com:6443");
        assert_eq!(a.namespace.as_deref(), Some("team-a"));
        assert_eq!(a.auth_type, AuthType::Token);
        assert_eq!(a.origin, "/tmp/kc.yaml");

        let b = contexts.iter().find(|c| c.name == "ctxB").unwrap();
        assert_eq!(b.auth_type, AuthType::Basic);
        assert!(b.namespace.is_none());
    }

    #[test]
    fn test_split_skips_dangling_references() {
        let yaml = r#"
clusters:
  - name: cluster-a
    cluster:
      server: https://a.example.com
contexts:
  - name: good
    context:
      cluster: cluster-a
  - name: dangling
    context:
      cluster: no-such-cluster
"#;
        let kubeconfig = Kubeconfig::from_yaml(yaml).unwrap();
        let contexts = split_contexts(&kubeconfig, ContextSource::Primary, "x", None);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].name, "good");
    }

    #[test]
    fn test_minimized_raw_is_self_contained() {
        let kubeconfig = Kubeconfig::from_yaml(TWO_CONTEXTS).unwrap();
        let contexts = split_contexts(&kubeconfig, ContextSource::Primary, "x", None);
        let a = contexts.iter().find(|c| c.name == "ctxA").unwrap();

        assert_eq!(a.raw.clusters.len(), 1);
        assert_eq!(a.raw.auth_infos.len(), 1);
        assert_eq!(a.raw.contexts.len(), 1);
        assert_eq!(a.raw.current_context.as_deref(), Some("ctxA"));
    }

    #[test]
    fn test_expiry() {
        let kubeconfig = Kubeconfig::from_yaml(TWO_CONTEXTS).unwrap();
        let deadline = Utc::now() - chrono::Duration::seconds(1);
        let contexts = split_contexts(&kubeconfig, ContextSource::Uploaded, "x", Some(deadline));
        assert!(contexts[0].is_expired(Utc::now()));

        let later = Utc::now() + chrono::Duration::seconds(60);
        let contexts = split_contexts(&kubeconfig, ContextSource::Uploaded, "x", Some(later));
        assert!(!contexts[0].is_expired(Utc::now()));
    }

    #[test]
    fn test_fingerprint_stable_across_splits() {
        let kubeconfig = Kubeconfig::from_yaml(TWO_CONTEXTS).unwrap();
        let first = split_contexts(&kubeconfig, ContextSource::Primary, "x", None);
        let second = split_contexts(&kubeconfig, ContextSource::Primary, "x", None);
        assert_eq!(first[0].fingerprint(), second[0].fingerprint());
    }
}
