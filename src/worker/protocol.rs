//! Line protocol spoken between a session and its worker: one JSON object per
//! line in each direction.

use serde::{Deserialize, Serialize};

pub const WORKER_MODE_ARG: &str = "worker";

/// Environment variable carrying the JSON-encoded security policy.
pub const POLICY_ENV: &str = "MATHCELL_POLICY";
pub const PRELOAD_ENV: &str = "MATHCELL_PRELOAD";
pub const PURE_FALLBACK_ENV: &str = "MATHCELL_PURE_FALLBACK";
pub const MAX_MEMORY_ENV: &str = "MATHCELL_MAX_MEMORY_MB";

pub const DEFAULT_PRELOAD: &str = "from math import *";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Execute {
        id: String,
        code: String,
        #[serde(default)]
        want_alt_format: bool,
        #[serde(default = "default_true")]
        capture_output: bool,
    },
    Reset {
        id: String,
    },
    Shutdown {
        id: String,
    },
}

impl Request {
    pub fn id(&self) -> &str {
        match self {
            Request::Execute { id, .. } | Request::Reset { id } | Request::Shutdown { id } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// The cell ended in a bare expression whose value was evaluated.
    Expression,
    Statement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Worker replies. Variants are distinguished by shape, so the order matters
/// when decoding: the most specific comes first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Executed {
        id: String,
        ok: bool,
        result_type: ResultKind,
        result: Option<String>,
        alt_format: Option<String>,
        stdout: String,
        elapsed_ms: f64,
    },
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        ok: bool,
        error: WireError,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
    },
    Ack {
        id: String,
        ok: bool,
    },
}

impl Response {
    pub fn ack(id: impl Into<String>) -> Self {
        Response::Ack {
            id: id.into(),
            ok: true,
        }
    }

    pub fn failed(id: Option<String>, kind: &str, message: impl Into<String>) -> Self {
        Response::Failed {
            id,
            ok: false,
            error: WireError {
                kind: kind.to_string(),
                message: message.into(),
                traceback: None,
            },
            stdout: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Response::Executed { id, .. } | Response::Ack { id, .. } => Some(id),
            Response::Failed { id, .. } => id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execute_request_defaults() {
        let request: Request =
            serde_json::from_value(json!({"id": "a", "type": "execute", "code": "1"})).unwrap();
        assert_eq!(
            request,
            Request::Execute {
                id: "a".into(),
                code: "1".into(),
                want_alt_format: false,
                capture_output: true,
            }
        );
    }

    #[test]
    fn requests_are_tagged_by_type() {
        let text = serde_json::to_string(&Request::Reset { id: "r".into() }).unwrap();
        assert_eq!(text, r#"{"type":"reset","id":"r"}"#);
    }

    #[test]
    fn responses_decode_by_shape() {
        let executed: Response = serde_json::from_value(json!({
            "id": "1", "ok": true, "result_type": "expression", "result": "42",
            "alt_format": null, "stdout": "", "elapsed_ms": 0.5
        }))
        .unwrap();
        assert!(matches!(
            executed,
            Response::Executed { result_type: ResultKind::Expression, ref result, .. } if result.as_deref() == Some("42")
        ));

        let failed: Response = serde_json::from_value(json!({
            "ok": false, "error": {"type": "ProtocolError", "message": "bad"}
        }))
        .unwrap();
        assert_eq!(failed.id(), None);
        assert!(matches!(failed, Response::Failed { ref error, .. } if error.kind == "ProtocolError"));

        let ack: Response = serde_json::from_value(json!({"id": "z", "ok": true})).unwrap();
        assert_eq!(ack, Response::ack("z"));
    }

    #[test]
    fn failure_omits_absent_fields() {
        let value = serde_json::to_value(Response::failed(None, "ProtocolError", "bad")).unwrap();
        assert_eq!(
            value,
            json!({"ok": false, "error": {"type": "ProtocolError", "message": "bad"}})
        );
    }
}
