//! 统一的 HTTP 错误类型；响应体只包含简短固定文案。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use tracing::warn;

use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    Internal(String),
    RangeNotSatisfiable(u64),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Forbidden(msg)
            | ApiError::Internal(msg) => (status, msg).into_response(),
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (status, headers, "range not satisfiable").into_response()
            }
        }
    }
}

/// 浏览场景：越界与缺失都按 404 处理。
impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::PathRejected => ApiError::NotFound("not found".into()),
            StorageError::RootMissing => {
                warn!("files directory is missing");
                ApiError::Internal("files directory is missing".into())
            }
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("not found".into()),
                _ => {
                    warn!(error = %err, "storage io error");
                    ApiError::Internal("internal error".into())
                }
            },
        }
    }
}

impl ApiError {
    /// 上传场景：越界返回 403，其余沿用通用映射。
    pub fn from_upload(error: StorageError) -> Self {
        match error {
            StorageError::PathRejected => ApiError::Forbidden("Invalid file path".into()),
            other => other.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }
}
