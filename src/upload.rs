//! 流式上传处理：登记传输、逐块落盘并提供进度查询。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::HeaderMap;
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use std::io;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::config::UPLOAD_CHUNK_SIZE;
use crate::error::ApiError;
use crate::http::declared_content_length;
use crate::registry::{TransferGuard, UploadRegistry};
use crate::storage::{Storage, is_existing_dir, normalize_logical_path};

/// Result of a finalized transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub logical_path: String,
    pub bytes_written: u64,
}

/// 将路由捕获的路径规范为以 `/` 开头的逻辑路径。
pub fn logical_path(captured: &str) -> String {
    format!("/{}", captured.trim_start_matches('/'))
}

/// Streams `body` into the file named by `logical_path`.
///
/// The path is normalized first, so every spelling of one file maps to a
/// single registry entry.
///
/// The registry entry is held for the whole write and released on every exit,
/// including when this future is dropped because the client went away. A
/// transfer that aborts mid-stream leaves the partial file on disk.
pub async fn ingest<R>(
    storage: &Storage,
    registry: &Arc<UploadRegistry>,
    logical_path: &str,
    declared_size: Option<u64>,
    mut body: R,
) -> Result<IngestOutcome, ApiError>
where
    R: AsyncRead + Unpin,
{
    let not_a_file =
        || ApiError::BadRequest("must provide a complete file path, not only a directory".into());
    if logical_path.ends_with('/') {
        return Err(not_a_file());
    }
    let key = normalize_logical_path(logical_path)?;
    if key == "/" {
        return Err(not_a_file());
    }
    let logical_path = key.as_str();
    let destination = storage.resolve_path_checked(logical_path, true).await?;
    if is_existing_dir(&destination).await {
        return Err(ApiError::PathIsDirectory);
    }

    let transfer = registry.begin_transfer(logical_path, destination, declared_size)?;
    info!(
        path = logical_path,
        declared_size,
        started_at = %transfer.started_at(),
        active = registry.active_count(),
        "upload started"
    );

    match write_destination(&transfer, &mut body).await {
        Ok(bytes_written) => {
            info!(path = logical_path, bytes = bytes_written, "upload finished");
            Ok(IngestOutcome {
                logical_path: logical_path.to_string(),
                bytes_written,
            })
        }
        Err(err) => {
            warn!(
                path = logical_path,
                bytes = transfer.written_bytes(),
                error = %err.message(),
                "upload aborted, partial file kept"
            );
            Err(err)
        }
    }
}

async fn write_destination<R>(transfer: &TransferGuard, body: &mut R) -> Result<u64, ApiError>
where
    R: AsyncRead + Unpin,
{
    let destination = transfer.destination();
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::WriteError(err.to_string()))?;
    }
    let mut file = File::create(destination)
        .await
        .map_err(|err| ApiError::WriteError(err.to_string()))?;
    copy_chunks(transfer, body, &mut file).await
}

/// 逐块复制，每写完一块推进登记表计数。
async fn copy_chunks<R, W>(
    transfer: &TransferGuard,
    body: &mut R,
    sink: &mut W,
) -> Result<u64, ApiError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
    loop {
        let read = body
            .read(&mut buf)
            .await
            .map_err(|err| ApiError::ReadError(err.to_string()))?;
        if read == 0 {
            break;
        }
        sink.write_all(&buf[..read])
            .await
            .map_err(|err| ApiError::WriteError(err.to_string()))?;
        let total = transfer.advance(read as u64);
        debug!(chunk = read, total, "upload chunk written");
    }
    sink.flush()
        .await
        .map_err(|err| ApiError::WriteError(err.to_string()))?;
    Ok(transfer.written_bytes())
}

/// 上传文件：请求体流式写入目标路径。
pub async fn upload_file(
    Path(path): Path<String>,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<UploadRegistry>>,
    body: AxumBody,
) -> Result<String, ApiError> {
    let logical = logical_path(&path);
    let declared_size = declared_content_length(&headers);
    let stream = BodyExt::into_data_stream(body).map_err(io::Error::other);
    let outcome = ingest(
        &storage,
        &registry,
        &logical,
        declared_size,
        StreamReader::new(stream),
    )
    .await?;
    Ok(format!(
        "{} upload finish, {} bytes\n",
        outcome.logical_path, outcome.bytes_written
    ))
}

/// 查询上传进度。
pub async fn upload_progress(
    Path(path): Path<String>,
    Extension(registry): Extension<Arc<UploadRegistry>>,
) -> Result<String, ApiError> {
    let logical = normalize_logical_path(&path)?;
    let snapshot = registry
        .query_progress(&logical)
        .ok_or_else(|| ApiError::NotFound("no upload in progress for this path".into()))?;
    let report = snapshot.progress();
    debug!(path = snapshot.logical_path, written = report.written_bytes, "progress queried");
    Ok(format!("{report}\n"))
}
