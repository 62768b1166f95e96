//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use std::io::ErrorKind;

use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Unauthorized,
    TooFrequent(u64),
    Busy,
    FileTooLarge,
    StorageFull,
    PathIsDirectory,
    AlreadyInProgress(DateTime<Utc>),
    ReadError(String),
    WriteError(String),
}

impl ApiError {
    /// 面向调用方的错误描述。
    pub fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) | ApiError::Internal(msg) => {
                msg.clone()
            }
            ApiError::Unauthorized => "password invalid".into(),
            ApiError::TooFrequent(_) => "request too frequent".into(),
            ApiError::Busy => "service busy".into(),
            ApiError::FileTooLarge => "uploaded file too large".into(),
            ApiError::StorageFull => "no disk space for this file".into(),
            ApiError::PathIsDirectory => "provided path is an existing directory".into(),
            ApiError::AlreadyInProgress(started_at) => format!(
                "provided path is being uploaded now, started at {}",
                started_at.format("%Y-%m-%d %H:%M:%S%.3f UTC")
            ),
            ApiError::ReadError(msg) => format!("read upload body from client failed: {msg}"),
            ApiError::WriteError(msg) => format!("write target file failed: {msg}"),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::PathIsDirectory => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) | ApiError::ReadError(_) | ApiError::WriteError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::TooFrequent(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::AlreadyInProgress(_) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut headers = HeaderMap::new();
        if let ApiError::TooFrequent(retry_after) = &self
            && *retry_after > 0
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert(header::RETRY_AFTER, value);
        }
        (status, headers, format!("{}\n", self.message())).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}
