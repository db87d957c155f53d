use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// 错误分类，供路由层决定重试、换渠道还是直接返回客户端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Unsupported,
    TransportFailure,
    MalformedResponse,
    UpstreamError,
    Cancelled,
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream stream idle for more than {0:?}")]
    StreamTimeout(Duration),

    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("Upstream error (status {status}, type {error_type}): {message}")]
    Upstream {
        status: u16,
        error_type: String,
        message: String,
    },

    #[error("Client disconnected")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Http(_) | Error::StreamTimeout(_) => ErrorKind::TransportFailure,
            Error::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Error::Upstream { .. } => ErrorKind::UpstreamError,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Config(_) | Error::Serialization(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// 返回给客户端的HTTP状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidInput(_) => 400,
            Error::Unsupported(_) => 501,
            Error::Http(e) if e.is_timeout() => 504,
            Error::StreamTimeout(_) => 504,
            Error::Http(_) | Error::MalformedResponse(_) => 502,
            Error::Upstream { status, .. } => *status,
            // nginx 惯例：客户端主动断开
            Error::Cancelled => 499,
            Error::Config(_) | Error::Serialization(_) | Error::Io(_) => 500,
        }
    }

    /// 传输层失败可以换渠道重试，adaptor 自身从不重试
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransportFailure
    }

    /// OpenAI 风格的错误体
    pub fn to_openai_error(&self) -> serde_json::Value {
        let (error_type, message) = match self {
            Error::Upstream {
                error_type,
                message,
                ..
            } => (error_type.clone(), message.clone()),
            other => (other.type_name().to_string(), other.to_string()),
        };

        json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": self.status_code(),
            }
        })
    }

    fn type_name(&self) -> &'static str {
        match self.kind() {
            ErrorKind::InvalidInput => "invalid_request_error",
            ErrorKind::Unsupported => "unsupported_operation",
            ErrorKind::TransportFailure => "transport_failure",
            ErrorKind::MalformedResponse => "bad_response_body",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::Cancelled => "client_disconnected",
            ErrorKind::Internal => "gateway_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
