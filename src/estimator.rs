//! 存储用量估算：周期性遍历存储根目录并发布总字节数。

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use walkdir::WalkDir;

/// Source of the current storage usage figure consulted by admission.
pub trait UsageEstimate: Send + Sync {
    fn current_estimate(&self) -> u64;
}

/// Eventually consistent total of regular-file bytes under the storage root.
///
/// Single writer (the refresh task), any number of readers. Readers always see
/// the result of the last walk that finished without error.
#[derive(Debug)]
pub struct StorageEstimator {
    root: PathBuf,
    estimate: AtomicU64,
}

impl StorageEstimator {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            estimate: AtomicU64::new(0),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 重新遍历存储目录；遍历失败时保留旧值并返回错误。
    pub async fn refresh(&self) -> io::Result<u64> {
        let root = self.root.clone();
        let total = tokio::task::spawn_blocking(move || walk_total_size(&root))
            .await
            .map_err(|err| io::Error::other(err.to_string()))??;
        self.estimate.store(total, Ordering::Release);
        debug!(root = ?self.root, bytes = total, "storage estimate refreshed");
        Ok(total)
    }
}

impl UsageEstimate for StorageEstimator {
    fn current_estimate(&self) -> u64 {
        self.estimate.load(Ordering::Acquire)
    }
}

/// Fixed usage figure for tests that must not walk a filesystem.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct FixedUsage(pub AtomicU64);

#[cfg(test)]
impl FixedUsage {
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::Release);
    }
}

#[cfg(test)]
impl UsageEstimate for FixedUsage {
    fn current_estimate(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

fn walk_total_size(root: &Path) -> io::Result<u64> {
    let mut total: u64 = 0;
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total = total.saturating_add(entry.metadata().map_err(io::Error::from)?.len());
        }
    }
    Ok(total)
}
