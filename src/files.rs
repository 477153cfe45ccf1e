//! 浏览入口：目录重定向、目录页面与文件下载。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{Html, IntoResponse, Response};
use httpdate::{fmt_http_date, parse_http_date};
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified};
use crate::http::collapse_slashes;
use crate::metrics::Metrics;
use crate::storage::{Storage, StorageError};
use crate::view::{ViewModel, render};

enum Outcome {
    Redirect(Response),
    Listed(Response),
    Served(Response),
}

/// 所有未匹配路由的 GET 请求：列目录或下载文件。
pub async fn browse(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(settings): Extension<Arc<Settings>>,
    Extension(metrics): Extension<Arc<Metrics>>,
    uri: Uri,
    request_headers: HeaderMap,
) -> Response {
    let raw_path = uri.path();
    if let Some(collapsed) = collapse_slashes(raw_path) {
        return match location(StatusCode::MOVED_PERMANENTLY, &collapsed, uri.query()) {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };
    }

    metrics.request_started();
    let result = match urlencoding::decode(raw_path) {
        Ok(url_path) => {
            serve_path(
                &storage,
                &settings,
                &url_path,
                &uri,
                &request_headers,
            )
            .await
        }
        Err(_) => Err(ApiError::BadRequest("invalid path encoding".into())),
    };

    match result {
        Ok(Outcome::Redirect(response)) => response,
        Ok(Outcome::Listed(response)) => {
            metrics.directory_listed();
            metrics.request_succeeded();
            response
        }
        Ok(Outcome::Served(response)) => {
            metrics.file_served();
            metrics.request_succeeded();
            response
        }
        Err(err) => {
            metrics.request_failed();
            err.into_response()
        }
    }
}

async fn serve_path(
    storage: &Storage,
    settings: &Settings,
    url_path: &str,
    uri: &Uri,
    request_headers: &HeaderMap,
) -> Result<Outcome, ApiError> {
    // 编码后的 `%2F%2F` 解码后才会出现空段，无法再用重定向折叠。
    if url_path.contains("//") {
        debug!(path = url_path, "empty path segment after decoding");
        return Err(ApiError::NotFound("not found".into()));
    }
    let target = storage.resolve(url_path).inspect_err(|_| {
        debug!(path = url_path, "request path rejected");
    })?;
    storage.check_root().await?;

    let metadata = match fs::metadata(&target).await {
        Ok(metadata) => metadata,
        Err(err) if url_path == "/" => {
            warn!(error = %err, "files directory is inaccessible");
            return Err(ApiError::Internal("files directory is inaccessible".into()));
        }
        Err(err) => return Err(StorageError::Io(err).into()),
    };

    if metadata.is_dir() {
        if !url_path.ends_with('/') {
            let with_slash = format!("{}/", uri.path());
            return location(StatusCode::FOUND, &with_slash, uri.query()).map(Outcome::Redirect);
        }
        let entries = storage.list_dir(&target).await.map_err(|err| {
            warn!(path = url_path, error = ?err, "error reading directory");
            ApiError::Internal("error reading directory".into())
        })?;
        info!(path = url_path, count = entries.len(), "list directory");
        let model = ViewModel::new(url_path, entries, settings);
        return Ok(Outcome::Listed(Html(render(&model).into_string()).into_response()));
    }

    if url_path.ends_with('/') {
        return Err(ApiError::NotFound("not found".into()));
    }
    serve_file(&target, &metadata, request_headers)
        .await
        .map(Outcome::Served)
}

fn location(status: StatusCode, path: &str, query: Option<&str>) -> Result<Response, ApiError> {
    let target = match query {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let value = HeaderValue::from_str(&target)
        .map_err(|_| ApiError::BadRequest("invalid path".into()))?;
    Ok((status, [(header::LOCATION, value)]).into_response())
}

/// 下载文件，支持 Range、条件请求与缓存相关头。
async fn serve_file(
    target: &Path,
    metadata: &Metadata,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(metadata);
    let mime = mime_guess::from_path(target).first_or_octet_stream();
    let content_type = if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ETAG, header_value(&etag)?);
    if let Some(modified) = modified {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }

    if is_not_modified(request_headers, &etag, modified) {
        debug!(etag, "not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    response_headers.insert(header::CONTENT_TYPE, header_value(&content_type)?);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) if value.starts_with('"') || value.starts_with("W/") => value == etag,
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };

    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let file = File::open(target).await.map_err(|err| {
        warn!(error = %err, "open file failed");
        ApiError::Internal("unable to read file".into())
    })?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(start, end, length, "range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start)).await.map_err(|err| {
            warn!(error = %err, "seek failed");
            ApiError::Internal("unable to read file".into())
        })?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {start}-{end}/{file_size}"))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(
        header::CONTENT_LENGTH,
        header_value(&file_size.to_string())?,
    );
    info!(size = file_size, "serve file");
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("failed to build headers".into()))
}

/// 解析单段 Range 头，返回闭区间。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let (start_part, end_part) = range.split_once('-').unwrap_or((range, ""));

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?
        };
        (start, end.min(file_size - 1))
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    Ok(Some((start, end)))
}
