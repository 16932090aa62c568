use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::ResponseError;

/// JSON-RPC error codes used by MCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
}

impl ErrorCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            _ => None,
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
        }
    }
}

/// A single failed schema check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// JSON pointer into the validated instance.
    pub path: String,
    pub message: String,
}

/// Errors produced by the server runtime, the transports and the client.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Protocol error {code}: {message}")]
    Protocol {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Invalid params: {}", summarize(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Client does not support {0}")]
    Capability(&'static str),

    #[error("No live stream available to deliver {0}")]
    NoStream(String),

    #[error("Request {0} timed out")]
    Timeout(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| {
            if i.path.is_empty() {
                i.message.clone()
            } else {
                format!("{}: {}", i.path, i.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Protocol {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::protocol(ErrorCode::MethodNotFound, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::protocol(ErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::protocol(ErrorCode::InternalError, message)
    }

    /// The JSON-RPC code this error maps to at the dispatch boundary.
    pub fn code(&self) -> i32 {
        match self {
            Error::Protocol { code, .. } => *code,
            Error::Validation(_) => ErrorCode::InvalidParams.into(),
            _ => ErrorCode::InternalError.into(),
        }
    }

    /// Converts the error into a JSON-RPC error object. Internal failures keep their message
    /// but never carry backtraces or source chains.
    pub fn to_response_error(&self) -> ResponseError {
        match self {
            Error::Protocol {
                code,
                message,
                data,
            } => ResponseError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            Error::Validation(issues) => ResponseError {
                code: ErrorCode::InvalidParams.into(),
                message: self.to_string(),
                data: Some(serde_json::json!({ "errors": issues })),
            },
            other => ResponseError {
                code: ErrorCode::InternalError.into(),
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<ResponseError> for Error {
    fn from(err: ResponseError) -> Self {
        Error::Protocol {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}
