//! 上传目录：文件名清洗与安全的目标路径解析。

use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::{info, warn};

use crate::atomic::is_temp_file_name;

const MAX_FILENAME_BYTES: usize = 255;

#[derive(Clone, Debug)]
pub struct UploadDir {
    root: PathBuf,
    reserved: Vec<String>,
}

impl UploadDir {
    /// `reserved` 中的名称（状态目录、封禁列表文件）不允许被上传覆盖。
    pub fn new(root: PathBuf, reserved: impl IntoIterator<Item = String>) -> Self {
        Self {
            root,
            reserved: reserved.into_iter().collect(),
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 把客户端声明的文件名转换为只含单一路径分量的安全名称。
    ///
    /// Directory components are stripped; absolute paths, `..` segments,
    /// control characters and reserved names are rejected.
    pub fn sanitize_filename(&self, declared: &str) -> Result<String, UnsafeFilename> {
        let trimmed = declared.trim();
        if trimmed.is_empty() {
            return Err(UnsafeFilename::Empty);
        }
        if trimmed.chars().any(char::is_control) {
            return Err(UnsafeFilename::ControlCharacter);
        }
        if trimmed.starts_with(['/', '\\']) || has_drive_prefix(trimmed) {
            return Err(UnsafeFilename::Absolute);
        }

        let segments: Vec<&str> = trimmed.split(['/', '\\']).map(str::trim).collect();
        if segments.iter().any(|segment| *segment == "..") {
            return Err(UnsafeFilename::Traversal);
        }

        let base = segments.last().copied().unwrap_or_default();
        if base.is_empty() {
            return Err(UnsafeFilename::Empty);
        }
        if base.len() > MAX_FILENAME_BYTES {
            return Err(UnsafeFilename::TooLong);
        }
        if base == "."
            || is_temp_file_name(base)
            || self
                .reserved
                .iter()
                .any(|name| name.eq_ignore_ascii_case(base))
        {
            return Err(UnsafeFilename::Reserved);
        }

        let mut components = Path::new(base).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(base.to_string()),
            _ => Err(UnsafeFilename::Traversal),
        }
    }

    /// 解析已清洗名称对应的写入路径，拒绝符号链接与目录。
    pub async fn resolve_target(&self, safe_name: &str) -> Result<PathBuf, StorageError> {
        let target = self.root.join(safe_name);
        if target.parent() != Some(self.root.as_path()) {
            return Err(StorageError::InvalidPath);
        }
        match fs::symlink_metadata(&target).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() || metadata.is_dir() {
                    return Err(StorageError::InvalidPath);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }
        Ok(target)
    }

    /// 清理中断写入遗留的临时文件，返回删除数量。
    pub async fn sweep_temp_files(&self) -> io::Result<usize> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_temp_file_name(name) || !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    info!(path = ?path, "removed stale temp file");
                }
                Err(err) => warn!(path = ?path, error = %err, "failed to remove stale temp file"),
            }
        }
        Ok(removed)
    }
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsafeFilename {
    Empty,
    Absolute,
    Traversal,
    ControlCharacter,
    TooLong,
    Reserved,
}

impl fmt::Display for UnsafeFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            UnsafeFilename::Empty => "empty filename",
            UnsafeFilename::Absolute => "absolute path",
            UnsafeFilename::Traversal => "path traversal",
            UnsafeFilename::ControlCharacter => "control character in filename",
            UnsafeFilename::TooLong => "filename too long",
            UnsafeFilename::Reserved => "reserved filename",
        };
        f.write_str(reason)
    }
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::InvalidPath => f.write_str("target is not a regular file in the upload directory"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}
