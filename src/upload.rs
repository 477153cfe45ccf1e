//! 表单上传：目标目录约束、文件名扁平化与流式写入。

use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::{Extension, Multipart};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::ApiError;
use crate::http::encode_path;
use crate::metrics::Metrics;
use crate::storage::Storage;

const DIR_FIELD: &str = "dir";
const FILE_FIELD: &str = "file";
const STAGING_PREFIX: &str = ".filebrowser-upload-";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// 已确认位于根目录下的上传目标。
#[derive(Debug, PartialEq, Eq)]
pub struct UploadTarget {
    pub dir: PathBuf,
    pub file: PathBuf,
}

/// 将文件名中的 `/` 全部替换为 `_`，避免借文件名创建子目录。
pub fn flatten_file_name(name: &str) -> String {
    name.replace('/', "_")
}

fn validated_name(declared_name: &str) -> Result<String, ApiError> {
    let file_name = flatten_file_name(declared_name);
    if file_name.is_empty() || file_name == "." || file_name == ".." {
        return Err(ApiError::BadRequest("Invalid upload".into()));
    }
    Ok(file_name)
}

/// 计算上传目标，目录与最终文件都必须通过根目录约束。
pub fn resolve_target(
    storage: &Storage,
    dir_param: &str,
    declared_name: &str,
) -> Result<UploadTarget, ApiError> {
    let file_name = validated_name(declared_name)?;
    let dir = storage.resolve(dir_param).map_err(ApiError::from_upload)?;
    let file = storage
        .confine(&dir.join(&file_name))
        .map_err(ApiError::from_upload)?;
    Ok(UploadTarget { dir, file })
}

/// 根目录下的临时文件路径，用于 `file` 字段先于 `dir` 到达的情况。
fn staging_path(storage: &Storage) -> PathBuf {
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    storage
        .root_path()
        .join(format!("{STAGING_PREFIX}{}-{seq}", std::process::id()))
}

async fn create_target_dir(dir: &Path) -> Result<(), ApiError> {
    fs::create_dir_all(dir).await.map_err(|err| {
        warn!(error = %err, "create upload directory failed");
        ApiError::Internal("Unable to save file".into())
    })
}

/// 把字段内容逐块写入文件；已存在的同名文件会被覆盖。
async fn write_field(path: &Path, mut field: Field<'_>) -> Result<u64, ApiError> {
    let mut file = File::create(path).await.map_err(|err| {
        warn!(error = %err, "create upload file failed");
        ApiError::Internal("Unable to save file".into())
    })?;

    let mut written: u64 = 0;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, written, "upload stream interrupted");
                return Err(ApiError::Internal("Error saving file".into()));
            }
        };
        file.write_all(&chunk).await.map_err(|err| {
            warn!(error = %err, written, "upload write failed");
            ApiError::Internal("Error saving file".into())
        })?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|err| {
        warn!(error = %err, "upload flush failed");
        ApiError::Internal("Error saving file".into())
    })?;
    Ok(written)
}

async fn discard_staged(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(error = %err, "remove staged upload failed");
    }
}

/// 先于 `dir` 到达的文件：暂存在根目录下，表单读完后再移动到目标位置。
struct Staged {
    path: PathBuf,
    declared: String,
    written: u64,
}

fn dir_or_root(dir_param: Option<&str>) -> &str {
    match dir_param {
        Some(dir) if !dir.is_empty() => dir,
        _ => "/",
    }
}

/// 按到达顺序读取字段；文件已直接写入目标时返回 `true`。
async fn read_fields(
    storage: &Storage,
    multipart: &mut Multipart,
    dir_param: &mut Option<String>,
    staged: &mut Option<Staged>,
) -> Result<bool, ApiError> {
    loop {
        let field = multipart.next_field().await.map_err(|err| {
            debug!(error = %err, "malformed multipart body");
            ApiError::BadRequest("Invalid upload".into())
        })?;
        let Some(field) = field else {
            return Ok(false);
        };

        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(DIR_FIELD) => {
                let value = field
                    .text()
                    .await
                    .map_err(|_| ApiError::BadRequest("Invalid upload".into()))?;
                *dir_param = Some(value);
            }
            Some(FILE_FIELD) if staged.is_some() => continue,
            Some(FILE_FIELD) => {
                let declared = field.file_name().unwrap_or_default().to_string();
                if dir_param.is_some() {
                    let dir = dir_or_root(dir_param.as_deref());
                    let target = resolve_target(storage, dir, &declared)?;
                    create_target_dir(&target.dir).await?;
                    let written = write_field(&target.file, field).await?;
                    info!(dir, name = declared, bytes = written, "upload stored");
                    return Ok(true);
                }
                validated_name(&declared)?;
                let staged = staged.insert(Staged {
                    path: staging_path(storage),
                    declared,
                    written: 0,
                });
                staged.written = write_field(&staged.path, field).await?;
            }
            _ => continue,
        }
    }
}

/// 将暂存文件移动到最终目标；目标约束在建目录之前检查。
async fn commit_staged(storage: &Storage, dir: &str, staged: &Staged) -> Result<(), ApiError> {
    let target = resolve_target(storage, dir, &staged.declared)?;
    create_target_dir(&target.dir).await?;
    fs::rename(&staged.path, &target.file).await.map_err(|err| {
        warn!(error = %err, "move staged upload failed");
        ApiError::Internal("Error saving file".into())
    })
}

/// 处理 multipart 表单，返回写入后的目标目录参数。
///
/// 字段顺序不影响结果：`dir` 先到时直接写入目标，`file` 先到时暂存，
/// 读完整个表单后再落位。
async fn receive(storage: &Storage, mut multipart: Multipart) -> Result<String, ApiError> {
    let mut dir_param: Option<String> = None;
    let mut staged: Option<Staged> = None;
    let result = read_fields(storage, &mut multipart, &mut dir_param, &mut staged).await;
    let dir = dir_or_root(dir_param.as_deref()).to_string();

    match (result, staged) {
        (Ok(true), _) => Ok(dir),
        (Ok(false), Some(staged)) => match commit_staged(storage, &dir, &staged).await {
            Ok(()) => {
                info!(dir, name = staged.declared, bytes = staged.written, "staged upload stored");
                Ok(dir)
            }
            Err(err) => {
                discard_staged(&staged.path).await;
                Err(err)
            }
        },
        (Ok(false), None) => Err(ApiError::BadRequest("Invalid upload".into())),
        (Err(err), staged) => {
            if let Some(staged) = staged {
                discard_staged(&staged.path).await;
            }
            Err(err)
        }
    }
}

/// 上传接口：成功后 303 跳回来源目录。
pub async fn upload_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(settings): Extension<Arc<Settings>>,
    Extension(metrics): Extension<Arc<Metrics>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    metrics.upload_started();
    if !settings.upload_enabled {
        metrics.upload_failed();
        return Err(ApiError::Forbidden("File uploads are disabled".into()));
    }

    let result = match multipart {
        Ok(multipart) => receive(&storage, multipart).await,
        Err(rejection) => {
            debug!(error = %rejection, "upload without multipart body");
            Err(ApiError::BadRequest("Invalid upload".into()))
        }
    };

    match result {
        Ok(dir_param) => {
            metrics.upload_succeeded();
            let location = HeaderValue::from_str(&encode_path(&dir_param))
                .map_err(|_| ApiError::Internal("failed to build headers".into()))?;
            Ok((StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response())
        }
        Err(err) => {
            metrics.upload_failed();
            Err(err)
        }
    }
}

/// 非 POST 请求：上传关闭时 403，否则跳回根目录。
pub async fn upload_other_method(
    Extension(settings): Extension<Arc<Settings>>,
    Extension(metrics): Extension<Arc<Metrics>>,
) -> Result<Response, ApiError> {
    metrics.upload_started();
    if !settings.upload_enabled {
        metrics.upload_failed();
        return Err(ApiError::Forbidden("File uploads are disabled".into()));
    }
    Ok((
        StatusCode::SEE_OTHER,
        [(header::LOCATION, HeaderValue::from_static("/"))],
    )
        .into_response())
}
