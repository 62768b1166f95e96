//! 文件列表、删除与说明文档处理器。

use axum::extract::{Extension, Path};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

use crate::error::ApiError;
use crate::registry::UploadRegistry;
use crate::storage::{FileEntry, Storage, normalize_logical_path};
use crate::upload::logical_path;

/// Location of the markdown document served at `/`, if any.
#[derive(Debug, Clone)]
pub struct DocFile(pub Option<PathBuf>);

/// 列出存储根目录。
pub async fn list_root(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    list_files(Path(String::new()), Extension(storage)).await
}

/// 列出目录内容；路径指向文件时只返回该文件。
pub async fn list_files(
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    let entries = storage.list(&path).await?;
    info!(path, count = entries.len(), "list files");
    Ok(JsonResponse(entries))
}

/// 删除文件或目录；该路径正在上传时拒绝。
pub async fn delete_entry(
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<UploadRegistry>>,
) -> Result<String, ApiError> {
    if logical_path(&path).ends_with('/') {
        return Err(ApiError::BadRequest(
            "must provide a complete file path, not only a directory".into(),
        ));
    }
    let logical = normalize_logical_path(&path)?;
    if let Some(active) = registry.query_progress(&logical) {
        return Err(ApiError::AlreadyInProgress(active.started_at));
    }
    storage.delete_path(&logical).await?;
    info!(path = logical, "delete entry");
    Ok(format!("{logical} delete finish\n"))
}

/// 返回配置的说明文档（原样 Markdown）。
pub async fn serve_doc(Extension(doc): Extension<DocFile>) -> Result<Response, ApiError> {
    let Some(path) = doc.0 else {
        return Err(ApiError::NotFound("no document configured".into()));
    };
    let content = fs::read(&path)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok((
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/markdown; charset=utf-8"),
        )],
        content,
    )
        .into_response())
}
