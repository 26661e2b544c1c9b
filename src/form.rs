//! 类型化的 multipart 表单解析：口令字段与有序的文件分段。

use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::StatusCode;
use futures_util::stream::StreamExt;

use crate::config::{FILE_FIELD, SECRET_CODE_FIELD};
use crate::error::DropError;

const MAX_SECRET_CODE_BYTES: usize = 64;

/// Classification of one multipart part, independent of how many files
/// the client submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartKind {
    SecretCode,
    File { declared_name: String },
    /// A file input submitted with nothing selected.
    EmptyFile,
    Other,
}

impl PartKind {
    fn classify(field: &Field<'_>) -> Self {
        match (field.name(), field.file_name()) {
            (Some(FILE_FIELD), Some("")) => PartKind::EmptyFile,
            (Some(FILE_FIELD), Some(name)) => PartKind::File {
                declared_name: name.to_string(),
            },
            (Some(SECRET_CODE_FIELD), None) => PartKind::SecretCode,
            _ => PartKind::Other,
        }
    }
}

/// 上传表单提取器，包装 [`Multipart`] 并统一错误映射。
#[derive(Debug)]
pub struct UploadForm(Multipart);

impl UploadForm {
    /// 读取下一个分段及其分类，流结束时返回 `None`。
    pub async fn next_part(&mut self) -> Result<Option<(PartKind, Field<'_>)>, DropError> {
        let Some(field) = self.0.next_field().await? else {
            return Ok(None);
        };
        Ok(Some((PartKind::classify(&field), field)))
    }

    /// 读取位于文件分段之前的口令字段。
    ///
    /// Reaching a file part first means no code was supplied.
    pub async fn read_secret_code(&mut self) -> Result<Option<String>, DropError> {
        while let Some((kind, mut field)) = self.next_part().await? {
            match kind {
                PartKind::SecretCode => {
                    let mut value = Vec::new();
                    while let Some(chunk) = field.next().await {
                        let chunk = chunk?;
                        if value.len() + chunk.len() > MAX_SECRET_CODE_BYTES {
                            return Err(DropError::BadRequest("secret code too long".into()));
                        }
                        value.extend_from_slice(&chunk);
                    }
                    return Ok(Some(String::from_utf8_lossy(&value).into_owned()));
                }
                PartKind::File { .. } | PartKind::EmptyFile => return Ok(None),
                PartKind::Other => continue,
            }
        }
        Ok(None)
    }
}

impl<S> FromRequest<S> for UploadForm
where
    S: Send + Sync,
{
    type Rejection = DropError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Multipart::from_request(req, state)
            .await
            .map(UploadForm)
            .map_err(Into::into)
    }
}

impl From<MultipartRejection> for DropError {
    fn from(rejection: MultipartRejection) -> Self {
        match rejection {
            MultipartRejection::InvalidBoundary(_) => {
                DropError::BadRequest("invalid multipart boundary".into())
            }
            _ => DropError::BadRequest(format!("invalid multipart request: {rejection}")),
        }
    }
}

impl From<MultipartError> for DropError {
    fn from(error: MultipartError) -> Self {
        if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return DropError::PayloadTooLarge;
        }
        DropError::BadRequest(format!("malformed multipart body: {}", error.body_text()))
    }
}
