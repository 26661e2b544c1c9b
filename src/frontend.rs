//! 嵌入式上传表单页面与结果页渲染。

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::Html;
use rust_embed::RustEmbed;
use std::sync::Arc;

use crate::error::DropError;
use crate::ingest::IngestReport;

#[derive(RustEmbed)]
#[folder = "assets"]
/// 嵌入式页面模板。
pub struct PageAssets;

const FORM_TEMPLATE: &str = "index.html";
const SIZE_UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

/// 页面渲染所需的只读配置。
#[derive(Debug, Clone)]
pub struct PageContext {
    pub username: String,
}

/// GET `/`：返回上传表单，无需口令。
pub async fn serve_form(
    Extension(page): Extension<Arc<PageContext>>,
) -> Result<Html<String>, DropError> {
    render_form(&page.username).map(Html)
}

/// 其他路径统一返回 404。
pub async fn not_found() -> (StatusCode, Html<String>) {
    (StatusCode::NOT_FOUND, Html(render_message("not found")))
}

pub fn render_form(username: &str) -> Result<String, DropError> {
    let asset = PageAssets::get(FORM_TEMPLATE)
        .ok_or_else(|| DropError::Internal("upload form template missing".into()))?;
    let template = String::from_utf8_lossy(&asset.data);
    Ok(template.replace("{username}", &escape_html(username)))
}

pub fn render_message(message: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head><body><h1>{}</h1></body></html>",
        escape_html(message)
    )
}

/// 上传结果页：列出保存成功与被跳过的文件。
pub fn render_report(report: &IngestReport) -> String {
    let mut body = String::from(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head><body><h1>files uploaded!</h1>",
    );
    if !report.stored.is_empty() {
        body.push_str("<ul>");
        for record in &report.stored {
            body.push_str(&format!(
                "<li>{} ({})</li>",
                escape_html(&record.filename),
                format_file_size(record.size_bytes)
            ));
        }
        body.push_str("</ul>");
    }
    if !report.skipped.is_empty() {
        body.push_str("<p>skipped:</p><ul>");
        for skipped in &report.skipped {
            body.push_str(&format!(
                "<li>{}: {}</li>",
                escape_html(&skipped.declared_name),
                escape_html(&skipped.reason.to_string())
            ));
        }
        body.push_str("</ul>");
    }
    body.push_str("</body></html>");
    body
}

pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// 以 1024 为进制、保留一位小数格式化字节数。
pub fn format_file_size(size_bytes: u64) -> String {
    if size_bytes == 0 {
        return "0B".to_string();
    }
    let mut size = size_bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1}{}", SIZE_UNITS[unit])
}
