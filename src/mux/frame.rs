//! Multiplexer wire frames
//!
//! Every message on the socket, inbound or outbound, is one JSON object of
//! this shape. `data` is opaque text whose meaning depends on `type`:
//! a Kubernetes object for DATA, a `{"state": ...}` payload for STATUS.

use serde::{Deserialize, Serialize};

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    /// Inbound: start (or reset) a stream
    Request,
    /// Outbound: one event or response body
    Data,
    /// Outbound: stream state transition
    Status,
    /// Outbound: terminal boundary for finite requests and relists
    Complete,
    /// Inbound: tear down the stream for this key
    Close,
}

/// One multiplexer message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,

    /// Opaque caller identity, carried through for logging only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,

    #[serde(rename = "type")]
    pub frame_type: FrameType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,

    /// Per-stream bearer token override; never echoed back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Stream states surfaced through STATUS frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Connecting,
    Streaming,
    Reconnecting,
    Draining,
    Closed,
    ClusterUnknown,
    Unauthorized,
    Warning,
    SlowConsumer,
}

/// Payload carried in the `data` field of a STATUS frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: StreamState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Identity of one logical stream within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub cluster_id: String,
    pub path: String,
    pub query: String,
}

impl RequestKey {
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            cluster_id: frame.cluster_id.clone(),
            path: frame.path.clone(),
            query: frame.query.clone(),
        }
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.query.is_empty() {
            write!(f, "{}:{}", self.cluster_id, self.path)
        } else {
            write!(f, "{}:{}?{}", self.cluster_id, self.path, self.query)
        }
    }
}

impl Frame {
    /// Parse an inbound text frame.
    pub fn parse(text: &str) -> Result<Frame, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("frame serializes")
    }

    fn outbound(key: &RequestKey, frame_type: FrameType, data: String) -> Frame {
        Frame {
            cluster_id: key.cluster_id.clone(),
            user_id: String::new(),
            path: key.path.clone(),
            query: key.query.clone(),
            frame_type,
            data,
            token: None,
        }
    }

    pub fn data(key: &RequestKey, body: String) -> Frame {
        Frame::outbound(key, FrameType::Data, body)
    }

    pub fn complete(key: &RequestKey) -> Frame {
        Frame::outbound(key, FrameType::Complete, String::new())
    }

    pub fn status(key: &RequestKey, state: StreamState) -> Frame {
        Frame::status_message(key, state, None)
    }

    pub fn status_message(key: &RequestKey, state: StreamState, message: Option<String>) -> Frame {
        let payload = StatusPayload { state, message };
        Frame::outbound(
            key,
            FrameType::Status,
            serde_json::to_string(&payload).expect("status payload serializes"),
        )
    }
}

/// True when the query string asks for a long-lived watch.
pub fn is_watch_query(query: &str) -> bool {
    url::form_urlencoded::parse(query.as_bytes())
        .any(|(k, v)| k == "watch" && (v == "true" || v == "1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_frame() {
        let frame = Frame::parse(
            r#"{"clusterId":"ctxA","path":"/api/v1/pods","query":"watch=true","type":"REQUEST"}"#,
        )
        .unwrap();
        assert_eq!(frame.frame_type, FrameType::Request);
        assert_eq!(frame.cluster_id, "ctxA");
        assert_eq!(frame.path, "/api/v1/pods");
        assert!(frame.token.is_none());
    }

    #[test]
    fn test_parse_rejects_missing_type() {
        assert!(Frame::parse(r#"{"clusterId":"ctxA"}"#).is_err());
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn test_status_frame_payload() {
        let key = RequestKey {
            cluster_id: "ctxA".into(),
            path: "/api/v1/pods".into(),
            query: "watch=true".into(),
        };
        let frame = Frame::status(&key, StreamState::Streaming);
        assert_eq!(frame.frame_type, FrameType::Status);

        let payload: StatusPayload = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(payload.state, StreamState::Streaming);

        let json = frame.to_json();
        assert!(json.contains(r#""type":"STATUS""#));
        assert!(json.contains("Streaming"));
    }

    #[test]
    fn test_token_never_serialized_outbound() {
        let key = RequestKey {
            cluster_id: "ctxA".into(),
            path: "/p".into(),
            query: String::new(),
        };
        let json = Frame::data(&key, "{}".into()).to_json();
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_request_key_identity() {
        let a = Frame::parse(r#"{"clusterId":"c","path":"/p","query":"q=1","type":"REQUEST"}"#)
            .unwrap();
        let b = Frame::parse(r#"{"clusterId":"c","path":"/p","query":"q=1","type":"CLOSE"}"#)
            .unwrap();
        assert_eq!(RequestKey::from_frame(&a), RequestKey::from_frame(&b));

        let c = Frame::parse(r#"{"clusterId":"c","path":"/p","query":"q=2","type":"CLOSE"}"#)
            .unwrap();
        assert_ne!(RequestKey::from_frame(&a), RequestKey::from_frame(&c));
    }

    #[test]
    fn test_is_watch_query() {
        assert!(is_watch_query("watch=true"));
        assert!(is_watch_query("labelSelector=app%3Dweb&watch=true"));
        assert!(is_watch_query("watch=1"));
        assert!(!is_watch_query("watch=false"));
        assert!(!is_watch_query(""));
        assert!(!is_watch_query("rewatch=true"));
    }
}
