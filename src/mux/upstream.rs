//! Raw upstream requests
//!
//! The multiplexer proxies arbitrary API paths, so it talks to the cluster
//! through `kube::Client::send` rather than typed APIs: one-shot GETs are
//! collected to text, watch responses are framed line-by-line (the watch
//! protocol emits one JSON event per line).

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http_body_util::{BodyExt, BodyStream};
use thiserror::Error;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

/// Upstream failure kinds, mapped from HTTP status and transport errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("resource version expired")]
    Gone,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("upstream request failed: {0}")]
    Fatal(String),
}

impl UpstreamError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }

    fn from_status(status: http::StatusCode, context: &str) -> Self {
        match status {
            http::StatusCode::UNAUTHORIZED | http::StatusCode::FORBIDDEN => {
                UpstreamError::Unauthorized
            }
            http::StatusCode::GONE => UpstreamError::Gone,
            http::StatusCode::NOT_FOUND => UpstreamError::NotFound(context.to_string()),
            s if s.is_server_error() || s == http::StatusCode::REQUEST_TIMEOUT => {
                UpstreamError::Transient(format!("{} on {}", s, context))
            }
            s => UpstreamError::Fatal(format!("{} on {}", s, context)),
        }
    }
}

fn build_request(
    path: &str,
    query: &str,
    token: Option<&str>,
) -> Result<http::Request<kube::client::Body>, UpstreamError> {
    if !path.starts_with('/') {
        return Err(UpstreamError::Fatal(format!(
            "path must be absolute: {}",
            path
        )));
    }

    let uri = if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query)
    };

    let mut builder = http::Request::builder()
        .method(http::Method::GET)
        .uri(uri.as_str());
    if let Some(token) = token {
        builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {}", token));
    }

    builder
        .body(kube::client::Body::empty())
        .map_err(|e| UpstreamError::Fatal(format!("invalid request for {}: {}", uri, e)))
}

async fn send(
    client: &kube::Client,
    path: &str,
    query: &str,
    token: Option<&str>,
) -> Result<http::Response<kube::client::Body>, UpstreamError> {
    let request = build_request(path, query, token)?;
    let response = client
        .send(request)
        .await
        .map_err(|e| UpstreamError::Transient(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(UpstreamError::from_status(status, path));
    }
    Ok(response)
}

/// One-shot GET, body collected to text.
pub async fn get_text(
    client: &kube::Client,
    path: &str,
    query: &str,
    token: Option<&str>,
) -> Result<String, UpstreamError> {
    let response = send(client, path, query, token).await?;
    let bytes = response
        .into_body()
        .collect()
        .await
        .map_err(|e| UpstreamError::Transient(e.to_string()))?
        .to_bytes();
    String::from_utf8(bytes.to_vec()).map_err(|e| UpstreamError::Fatal(e.to_string()))
}

/// One page of a list response.
#[derive(Debug)]
pub struct ListPage {
    pub items: Vec<serde_json::Value>,
    pub resource_version: Option<String>,
    pub continue_token: Option<String>,
}

/// Fetch one page of a paginated list. `base_query` must not contain
/// watch/limit/continue parameters; they are appended here.
pub async fn list_page(
    client: &kube::Client,
    path: &str,
    base_query: &str,
    limit: u32,
    continue_token: Option<&str>,
    token: Option<&str>,
) -> Result<ListPage, UpstreamError> {
    let query = {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in url::form_urlencoded::parse(base_query.as_bytes()) {
            if k != "watch" && k != "limit" && k != "continue" && k != "resourceVersion" {
                query.append_pair(&k, &v);
            }
        }
        query.append_pair("limit", &limit.to_string());
        if let Some(cont) = continue_token {
            query.append_pair("continue", cont);
        }
        query.finish()
    };

    let text = get_text(client, path, &query, token).await?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| UpstreamError::Fatal(e.to_string()))?;

    let items = value
        .get("items")
        .and_then(|i| i.as_array())
        .cloned()
        .unwrap_or_default();
    let metadata = value.get("metadata");
    let resource_version = metadata
        .and_then(|m| m.get("resourceVersion"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let continue_token = metadata
        .and_then(|m| m.get("continue"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    Ok(ListPage {
        items,
        resource_version,
        continue_token,
    })
}

/// Open a watch starting at `resource_version` and return a line stream:
/// each item is one raw watch event in JSON text.
pub async fn open_watch(
    client: &kube::Client,
    path: &str,
    base_query: &str,
    resource_version: &str,
    token: Option<&str>,
) -> Result<impl Stream<Item = Result<String, UpstreamError>> + use<>, UpstreamError> {
    let query = {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in url::form_urlencoded::parse(base_query.as_bytes()) {
            if k != "watch" && k != "resourceVersion" && k != "allowWatchBookmarks" {
                query.append_pair(&k, &v);
            }
        }
        query.append_pair("watch", "true");
        query.append_pair("resourceVersion", resource_version);
        query.append_pair("allowWatchBookmarks", "true");
        query.finish()
    };
    let response = send(client, path, &query, token).await?;

    let bytes = BodyStream::new(response.into_body()).filter_map(|result| async move {
        match result {
            Ok(frame) => frame.into_data().ok().map(Ok::<Bytes, std::io::Error>),
            Err(e) => Some(Err(std::io::Error::other(e.to_string()))),
        }
    });

    let lines = FramedRead::new(StreamReader::new(bytes), LinesCodec::new());
    Ok(lines.map(|result| result.map_err(|e| UpstreamError::Transient(e.to_string()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_requires_absolute_path() {
        assert!(build_request("api/v1/pods", "", None).is_err());
        let req = build_request("/api/v1/pods", "watch=true", None).unwrap();
        assert_eq!(req.uri().path(), "/api/v1/pods");
        assert_eq!(req.uri().query(), Some("watch=true"));
    }

    #[test]
    fn test_build_request_token_override() {
        let req = build_request("/api/v1/pods", "", Some("abc123")).unwrap();
        let auth = req.headers().get(http::header::AUTHORIZATION).unwrap();
        assert_eq!(auth, "Bearer abc123");

        let bare = build_request("/api/v1/pods", "", None).unwrap();
        assert!(bare.headers().get(http::header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            UpstreamError::from_status(http::StatusCode::UNAUTHORIZED, "p"),
            UpstreamError::Unauthorized
        ));
        assert!(matches!(
            UpstreamError::from_status(http::StatusCode::FORBIDDEN, "p"),
            UpstreamError::Unauthorized
        ));
        assert!(matches!(
            UpstreamError::from_status(http::StatusCode::GONE, "p"),
            UpstreamError::Gone
        ));
        assert!(matches!(
            UpstreamError::from_status(http::StatusCode::BAD_GATEWAY, "p"),
            UpstreamError::Transient(_)
        ));
        assert!(matches!(
            UpstreamError::from_status(http::StatusCode::NOT_FOUND, "p"),
            UpstreamError::NotFound(_)
        ));
        assert!(matches!(
            UpstreamError::from_status(http::StatusCode::UNPROCESSABLE_ENTITY, "p"),
            UpstreamError::Fatal(_)
        ));
    }
}
