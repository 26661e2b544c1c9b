//! 上传落盘：逐个文件清洗名称、原子写入并汇总结果。

use axum::extract::multipart::Field;
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use std::fmt;
use std::net::IpAddr;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::atomic::AtomicFile;
use crate::error::DropError;
use crate::form::{PartKind, UploadForm};
use crate::frontend::format_file_size;
use crate::storage::{UnsafeFilename, UploadDir};

/// One stored file, produced for logging and the result page.
#[derive(Debug, Clone)]
pub struct UploadedFileRecord {
    pub filename: String,
    pub size_bytes: u64,
    pub source_address: IpAddr,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub enum SkipReason {
    FilenameUnsafe(UnsafeFilename),
    StorageWriteFailure,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::FilenameUnsafe(reason) => write!(f, "unsafe filename ({reason})"),
            SkipReason::StorageWriteFailure => f.write_str("could not be saved"),
        }
    }
}

#[derive(Debug)]
pub struct SkippedFile {
    pub declared_name: String,
    pub reason: SkipReason,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub stored: Vec<UploadedFileRecord>,
    pub skipped: Vec<SkippedFile>,
}

enum StoreFailure {
    Write(String),
    Stream(DropError),
}

/// 处理表单中剩余的全部文件分段。
///
/// A file that fails to sanitize or to write is skipped and reported; the
/// rest of the batch is still processed. A broken multipart stream aborts
/// the remaining batch, leaving already stored files in place.
pub async fn ingest(
    form: &mut UploadForm,
    upload_dir: &UploadDir,
    source_address: IpAddr,
) -> Result<IngestReport, DropError> {
    upload_dir
        .ensure_root()
        .await
        .map_err(|err| DropError::Internal(format!("upload dir unavailable: {err}")))?;

    let mut report = IngestReport::default();
    let mut saw_file = false;

    while let Some((kind, mut field)) = form.next_part().await? {
        let PartKind::File { declared_name } = kind else {
            debug!(field = field.name().unwrap_or_default(), "skipping non-file part");
            continue;
        };
        saw_file = true;

        let safe_name = match upload_dir.sanitize_filename(&declared_name) {
            Ok(name) => name,
            Err(reason) => {
                warn!(
                    client_ip = %source_address,
                    declared_name,
                    %reason,
                    "skipping unsafe filename"
                );
                report.skipped.push(SkippedFile {
                    declared_name,
                    reason: SkipReason::FilenameUnsafe(reason),
                });
                continue;
            }
        };

        match store_field(&mut field, upload_dir, &safe_name).await {
            Ok(size_bytes) => {
                let record = UploadedFileRecord {
                    filename: safe_name,
                    size_bytes,
                    source_address,
                    timestamp: Utc::now(),
                };
                log_record(&record);
                report.stored.push(record);
            }
            Err(StoreFailure::Write(error)) => {
                warn!(
                    file = safe_name,
                    client_ip = %source_address,
                    error,
                    "failed to store file"
                );
                report.skipped.push(SkippedFile {
                    declared_name,
                    reason: SkipReason::StorageWriteFailure,
                });
            }
            Err(StoreFailure::Stream(err)) => return Err(err),
        }
    }

    if !saw_file {
        return Err(DropError::NoFileProvided);
    }
    Ok(report)
}

fn log_record(record: &UploadedFileRecord) {
    info!(
        file = record.filename,
        size = record.size_bytes,
        size_human = format_file_size(record.size_bytes),
        client_ip = %record.source_address,
        received_at = %record.timestamp.to_rfc3339(),
        "file received"
    );
}

async fn store_field(
    field: &mut Field<'_>,
    upload_dir: &UploadDir,
    safe_name: &str,
) -> Result<u64, StoreFailure> {
    let target = upload_dir
        .resolve_target(safe_name)
        .await
        .map_err(|err| StoreFailure::Write(err.to_string()))?;
    let mut atomic = AtomicFile::new(&target)
        .await
        .map_err(|err| StoreFailure::Write(err.to_string()))?;

    let write_result: Result<u64, StoreFailure> = async {
        let mut total_written: u64 = 0;
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|err| StoreFailure::Stream(err.into()))?;
            atomic
                .file_mut()
                .write_all(&chunk)
                .await
                .map_err(|err| StoreFailure::Write(err.to_string()))?;
            total_written += chunk.len() as u64;
        }
        Ok(total_written)
    }
    .await;

    let total_written = match write_result {
        Ok(value) => value,
        Err(err) => {
            atomic.cleanup().await;
            return Err(err);
        }
    };
    atomic
        .finalize()
        .await
        .map_err(|err| StoreFailure::Write(err.to_string()))?;
    Ok(total_written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::test_support::{TestPart, upload_form};
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

    fn make_upload_dir() -> (TempDir, PathBuf, UploadDir) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("drop");
        let dir = UploadDir::new(root.clone(), [".filedrop".to_string()]);
        (temp, root, dir)
    }

    #[tokio::test]
    async fn stores_single_file_with_size() {
        let (_temp, root, dir) = make_upload_dir();
        let data = vec![7u8; 1_234];
        let mut form = upload_form(&[TestPart::File("file", "report.pdf", &data)]).await;

        let report = ingest(&mut form, &dir, CLIENT).await.expect("ingest");
        assert_eq!(report.stored.len(), 1);
        assert!(report.skipped.is_empty());
        let record = &report.stored[0];
        assert_eq!(record.filename, "report.pdf");
        assert_eq!(record.size_bytes, 1_234);
        assert_eq!(record.source_address, CLIENT);
        assert_eq!(std::fs::read(root.join("report.pdf")).expect("read"), data);
    }

    #[tokio::test]
    async fn long_filename_is_stored() {
        let (_temp, root, dir) = make_upload_dir();
        let name = format!("{}.txt", "a".repeat(236));
        assert_eq!(name.len(), 240);
        let mut form = upload_form(&[TestPart::File("file", &name, b"long")]).await;

        let report = ingest(&mut form, &dir, CLIENT).await.expect("ingest");
        assert!(report.skipped.is_empty(), "{:?}", report.skipped);
        assert_eq!(report.stored.len(), 1);
        assert_eq!(std::fs::read(root.join(&name)).expect("read"), b"long");
    }

    #[tokio::test]
    async fn unsafe_file_is_skipped_rest_of_batch_stored() {
        let (temp, root, dir) = make_upload_dir();
        let mut form = upload_form(&[
            TestPart::File("file", "one.txt", b"1"),
            TestPart::File("file", "../../escape.txt", b"evil"),
            TestPart::File("file", "three.txt", b"333"),
        ])
        .await;

        let report = ingest(&mut form, &dir, CLIENT).await.expect("ingest");
        let stored: Vec<&str> = report.stored.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(stored, vec!["one.txt", "three.txt"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].declared_name, "../../escape.txt");
        assert!(matches!(
            report.skipped[0].reason,
            SkipReason::FilenameUnsafe(UnsafeFilename::Traversal)
        ));
        assert!(!temp.path().join("escape.txt").exists());
        assert!(!root.join("escape.txt").exists());
        assert_eq!(std::fs::read(root.join("three.txt")).expect("read"), b"333");
    }

    #[tokio::test]
    async fn directory_collision_is_a_write_failure() {
        let (_temp, root, dir) = make_upload_dir();
        std::fs::create_dir_all(root.join("taken")).expect("create dir");
        let mut form = upload_form(&[
            TestPart::File("file", "taken", b"x"),
            TestPart::File("file", "free.txt", b"y"),
        ])
        .await;

        let report = ingest(&mut form, &dir, CLIENT).await.expect("ingest");
        assert_eq!(report.stored.len(), 1);
        assert_eq!(report.stored[0].filename, "free.txt");
        assert!(matches!(
            report.skipped[0].reason,
            SkipReason::StorageWriteFailure
        ));
    }

    #[tokio::test]
    async fn same_name_overwrites() {
        let (_temp, root, dir) = make_upload_dir();
        let mut form = upload_form(&[
            TestPart::File("file", "dup.txt", b"first"),
            TestPart::File("file", "dup.txt", b"second"),
        ])
        .await;

        let report = ingest(&mut form, &dir, CLIENT).await.expect("ingest");
        assert_eq!(report.stored.len(), 2);
        assert_eq!(std::fs::read(root.join("dup.txt")).expect("read"), b"second");
    }

    #[tokio::test]
    async fn form_without_files_is_rejected() {
        let (_temp, _root, dir) = make_upload_dir();
        let mut form = upload_form(&[
            TestPart::Text("note", "hello"),
            TestPart::File("file", "", b""),
        ])
        .await;

        let result = ingest(&mut form, &dir, CLIENT).await;
        assert!(matches!(result, Err(DropError::NoFileProvided)));
    }
}
