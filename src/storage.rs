//! 存储根目录的路径约束与目录列举。

use chrono::{DateTime, Local};
use std::cmp::Ordering;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::debug;

const SIZE_UNITS: &[u8] = b"KMGTPE";

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// 以给定目录作为约束根；相对路径基于当前工作目录。
    pub fn new(root: PathBuf) -> io::Result<Self> {
        let absolute = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()?.join(root)
        };
        Ok(Self {
            root: normalize_lexically(&absolute),
        })
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 将请求路径映射到根目录下；越界则返回 `PathRejected`。
    ///
    /// 只做词法规范化，不解析符号链接：根目录内指向外部的链接不会被拦截。
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, StorageError> {
        let joined = self.root.join(requested.trim_start_matches('/'));
        self.confine(&joined)
    }

    /// 校验一个已拼接的路径仍位于根目录下。
    pub fn confine(&self, candidate: &Path) -> Result<PathBuf, StorageError> {
        let normalized = normalize_lexically(candidate);
        if normalized.starts_with(&self.root) {
            Ok(normalized)
        } else {
            Err(StorageError::PathRejected)
        }
    }

    /// 根目录在请求时不存在视为配置错误，而不是普通的 404。
    pub async fn check_root(&self) -> Result<(), StorageError> {
        match fs::metadata(&self.root).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::RootMissing),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 列出目录的直接子项：目录在前，同类按名称字节序升序。
    pub async fn list_dir(&self, dir: &Path) -> Result<Vec<DirectoryEntry>, StorageError> {
        let mut reader = fs::read_dir(dir).await?;
        let mut entries = Vec::new();

        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(name, error = %err, "skip entry without metadata");
                    continue;
                }
            };

            let (kind, display_size, relative_url) = if metadata.is_dir() {
                let size = match count_items(&entry.path()).await {
                    Ok(1) => "1 item".to_string(),
                    Ok(count) => format!("{count} items"),
                    Err(_) => "-".to_string(),
                };
                let url = format!("{}/", urlencoding::encode(&name));
                (EntryKind::Directory, size, url)
            } else {
                let url = urlencoding::encode(&name).into_owned();
                (EntryKind::File, format_size(metadata.len()), url)
            };

            let modified_at = metadata
                .modified()
                .map(format_modified)
                .unwrap_or_else(|_| "-".to_string());

            entries.push(DirectoryEntry {
                name,
                kind,
                display_size,
                modified_at,
                relative_url,
            });
        }

        sort_entries(&mut entries);
        Ok(entries)
    }
}

async fn count_items(dir: &Path) -> io::Result<usize> {
    let mut reader = fs::read_dir(dir).await?;
    let mut count = 0;
    while reader.next_entry().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

fn sort_entries(entries: &mut [DirectoryEntry]) {
    entries.sort_by(|a, b| match (a.kind, b.kind) {
        (EntryKind::Directory, EntryKind::File) => Ordering::Less,
        (EntryKind::File, EntryKind::Directory) => Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
}

/// 纯词法地消解 `.` 与 `..`；`..` 不会越过文件系统根。
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(segment) => normalized.push(segment),
        }
    }
    normalized
}

/// 按 1024 进制格式化字节数，1 KB 以上保留一位小数。
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!(
        "{:.1} {}B",
        bytes as f64 / div as f64,
        SIZE_UNITS[exp] as char
    )
}

/// 本地时区、精确到分钟，例如 `2024-05-01 13:45+02:00`。
pub fn format_modified(time: SystemTime) -> String {
    let datetime: DateTime<Local> = time.into();
    datetime.format("%Y-%m-%d %H:%M%:z").to_string()
}

#[derive(Debug)]
pub enum StorageError {
    PathRejected,
    RootMissing,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
    pub display_size: String,
    pub modified_at: String,
    pub relative_url: String,
}

impl DirectoryEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}
