use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidJson,
    UnknownCmd,
    InvalidParams,
}

/// Reply envelope shared by the command endpoint and the publish endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Ok {
        data: Value,
    },
    Error {
        error_code: ErrorCode,
        message: String,
    },
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Reply::Ok { data }
    }

    pub fn error(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Reply::Error {
            error_code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"error","error_code":"INVALID_JSON","message":"serialization failed"}"#
                .to_string()
        })
    }
}

/// A parsed request. `cmd` is the dispatch key, the rest of the object is
/// kept so handlers can read parameters either top-level or under `params`.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub cmd: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Request {
    pub fn bare(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            params: None,
            extra: Map::new(),
        }
    }

    /// Looks up `key` under `params` first, then at the top level.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params
            .as_ref()
            .and_then(|p| p.get(key))
            .or_else(|| self.extra.get(key))
    }
}

/// Parses a payload into a request, or the error reply to send back.
///
/// Anything that does not start with `{` is taken as a bare command name.
pub fn parse_request(payload: &str) -> Result<Request, Reply> {
    let trimmed = payload.trim();
    if !trimmed.starts_with('{') {
        if trimmed.is_empty() {
            return Err(Reply::error(ErrorCode::InvalidJson, "empty request"));
        }
        return Ok(Request::bare(trimmed));
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| Reply::error(ErrorCode::InvalidJson, format!("invalid JSON: {}", e)))?;
    match value.get("cmd").and_then(Value::as_str) {
        Some(cmd) if !cmd.is_empty() => {}
        _ => return Err(Reply::error(ErrorCode::InvalidJson, "cmd is required")),
    }
    serde_json::from_value(value)
        .map_err(|e| Reply::error(ErrorCode::InvalidJson, format!("invalid request: {}", e)))
}
