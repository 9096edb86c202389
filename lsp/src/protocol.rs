//! JSON-RPC envelope serde types and message classification.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Standard JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const REQUEST_CANCELLED: i64 = -32800;
}

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<&'a serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<&'a serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Reply to a server-initiated request. Exactly one of `result` / `error`
/// is serialized.
#[derive(Debug, Serialize)]
pub(crate) struct Response<'a> {
    pub jsonrpc: &'static str,
    pub id: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a ResponseError>,
}

impl<'a> Response<'a> {
    pub fn new(
        id: &'a serde_json::Value,
        outcome: &'a Result<serde_json::Value, ResponseError>,
    ) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            jsonrpc: "2.0",
            id,
            result,
            error,
        }
    }
}

/// JSON-RPC error object, both received and sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn method_not_found() -> Self {
        Self::new(error_codes::METHOD_NOT_FOUND, "method not found")
    }
}

/// An inbound message after classification.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Incoming {
    /// Reply to one of our requests. `id` is `None` when the server's id is
    /// not one we could have issued.
    Response {
        id: Option<u64>,
        outcome: Result<serde_json::Value, ResponseError>,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

/// Classify a decoded frame.
///
/// No `id`: notification. `id` with a `result`, or with neither `params`
/// nor `method`: response. Anything else carrying an `id` is a request from
/// the server.
pub(crate) fn classify(mut frame: serde_json::Value) -> Incoming {
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let params = frame.get_mut("params").map(serde_json::Value::take);

    let Some(id) = frame.get_mut("id").map(serde_json::Value::take) else {
        return Incoming::Notification {
            method: method.unwrap_or_default(),
            params,
        };
    };

    let has_result = frame.get("result").is_some();
    if has_result || (params.is_none() && method.is_none()) {
        return Incoming::Response {
            id: parse_request_id(&id),
            outcome: response_outcome(&mut frame),
        };
    }

    Incoming::ServerRequest {
        id,
        method: method.unwrap_or_default(),
        params,
    }
}

fn parse_request_id(id: &serde_json::Value) -> Option<u64> {
    match id {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn response_outcome(frame: &mut serde_json::Value) -> Result<serde_json::Value, ResponseError> {
    if let Some(error) = frame.get_mut("error").map(serde_json::Value::take) {
        return Err(serde_json::from_value(error.clone()).unwrap_or_else(|_| ResponseError {
            code: error_codes::INTERNAL_ERROR,
            message: "malformed error object".to_string(),
            data: Some(error),
        }));
    }
    Ok(frame
        .get_mut("result")
        .map(serde_json::Value::take)
        .unwrap_or_default())
}

pub(crate) fn initialize_params(
    root_uri: &str,
    workspace_name: &str,
    editor_name: &str,
    editor_version: &str,
) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": editor_name,
            "version": editor_version
        },
        "rootUri": root_uri,
        "workspaceFolders": [{
            "uri": root_uri,
            "name": workspace_name
        }],
        "capabilities": {
            "general": {
                "positionEncodings": ["utf-16"]
            },
            "window": {
                "showDocument": { "support": true },
                "workDoneProgress": false
            },
            "workspace": {
                "workspaceFolders": true,
                "configuration": false
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "completion": {
                    "dynamicRegistration": false,
                    "completionItem": {
                        "snippetSupport": false,
                        "documentationFormat": ["plaintext", "markdown"],
                        "resolveSupport": { "properties": ["documentation", "detail"] }
                    },
                    "contextSupport": true
                },
                "hover": {
                    "dynamicRegistration": false,
                    "contentFormat": ["plaintext", "markdown"]
                },
                "signatureHelp": {
                    "dynamicRegistration": false,
                    "signatureInformation": {
                        "documentationFormat": ["plaintext", "markdown"],
                        "parameterInformation": { "labelOffsetSupport": true }
                    }
                },
                "documentSymbol": {
                    "dynamicRegistration": false,
                    "hierarchicalDocumentSymbolSupport": true
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            }
        }
    })
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
