//! 上传登记表：按逻辑路径互斥的进行中传输记录与进度查询。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uuid::Uuid;

use crate::config::MIB;
use crate::error::ApiError;

#[derive(Debug)]
struct TransferRecord {
    id: Uuid,
    logical_path: String,
    destination: PathBuf,
    total_size: Option<u64>,
    written: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl TransferRecord {
    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            logical_path: self.logical_path.clone(),
            total_size: self.total_size,
            written_bytes: self.written.load(Ordering::Acquire),
            started_at: self.started_at,
            started: self.started,
        }
    }
}

/// Returned when another transfer already owns the logical path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyInProgress {
    pub started_at: DateTime<Utc>,
}

impl From<AlreadyInProgress> for ApiError {
    fn from(conflict: AlreadyInProgress) -> Self {
        ApiError::AlreadyInProgress(conflict.started_at)
    }
}

/// In-progress transfers keyed by logical path.
///
/// Registration is a single compare-and-insert on the key's shard; transfers on
/// different paths never contend on a shared lock.
#[derive(Debug, Default)]
pub struct UploadRegistry {
    transfers: DashMap<String, Arc<TransferRecord>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 原子登记一个传输；路径已被占用时返回既有传输的开始时间。
    pub fn begin_transfer(
        self: &Arc<Self>,
        logical_path: &str,
        destination: PathBuf,
        total_size: Option<u64>,
    ) -> Result<TransferGuard, AlreadyInProgress> {
        let record = match self.transfers.entry(logical_path.to_string()) {
            Entry::Occupied(existing) => {
                return Err(AlreadyInProgress {
                    started_at: existing.get().started_at,
                });
            }
            Entry::Vacant(slot) => {
                let record = Arc::new(TransferRecord {
                    id: Uuid::new_v4(),
                    logical_path: logical_path.to_string(),
                    destination,
                    total_size,
                    written: AtomicU64::new(0),
                    started_at: Utc::now(),
                    started: Instant::now(),
                });
                slot.insert(record.clone());
                record
            }
        };
        Ok(TransferGuard {
            registry: self.clone(),
            record,
        })
    }

    /// 返回进行中传输的计数快照；无此传输时返回 `None`。
    pub fn query_progress(&self, logical_path: &str) -> Option<TransferSnapshot> {
        self.transfers
            .get(logical_path)
            .map(|record| record.snapshot())
    }

    pub fn active_count(&self) -> usize {
        self.transfers.len()
    }

    fn end_transfer(&self, logical_path: &str, id: Uuid) {
        self.transfers
            .remove_if(logical_path, |_, record| record.id == id);
    }
}

/// Ownership of one registry entry.
///
/// The entry is removed when the guard drops, whichever way the transfer ends.
#[derive(Debug)]
pub struct TransferGuard {
    registry: Arc<UploadRegistry>,
    record: Arc<TransferRecord>,
}

impl TransferGuard {
    /// 累加已写入字节数，返回新的总数。
    pub fn advance(&self, bytes: u64) -> u64 {
        self.record.written.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    pub fn written_bytes(&self) -> u64 {
        self.record.written.load(Ordering::Acquire)
    }

    pub fn destination(&self) -> &Path {
        &self.record.destination
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.record.started_at
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.registry
            .end_transfer(&self.record.logical_path, self.record.id);
    }
}

/// Point-in-time copy of a transfer's counters.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub logical_path: String,
    pub total_size: Option<u64>,
    pub written_bytes: u64,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl TransferSnapshot {
    pub fn progress(&self) -> ProgressReport {
        self.progress_at(Instant::now())
    }

    /// Derives rates and estimates; anything that would need a division by
    /// zero is reported as unknown.
    pub fn progress_at(&self, now: Instant) -> ProgressReport {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let written = self.written_bytes as f64;
        let throughput = if elapsed > 0.0 {
            written / MIB as f64 / elapsed
        } else {
            0.0
        };
        let percent = match self.total_size {
            Some(total) if total > 0 => Some(written * 100.0 / total as f64),
            _ => None,
        };
        let estimated_total_secs = match self.total_size {
            Some(total) if self.written_bytes > 0 => {
                Some(elapsed * (total as f64 / written)).filter(|secs| secs.is_finite())
            }
            _ => None,
        };

        ProgressReport {
            percent,
            elapsed_secs: elapsed,
            estimated_total_secs,
            written_bytes: self.written_bytes,
            total_bytes: self.total_size,
            throughput_mib_per_sec: throughput,
        }
    }
}

/// Human-facing progress figures for one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub percent: Option<f64>,
    pub elapsed_secs: f64,
    pub estimated_total_secs: Option<f64>,
    pub written_bytes: u64,
    pub total_bytes: Option<u64>,
    pub throughput_mib_per_sec: f64,
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.percent {
            Some(percent) => write!(f, "{percent:.2}%")?,
            None => write!(f, "unknown%")?,
        }
        write!(f, " [{:.1} s / ", self.elapsed_secs)?;
        match self.estimated_total_secs {
            Some(secs) => write!(f, "{secs:.1} s]")?,
            None => write!(f, "unknown s]")?,
        }
        write!(f, " [{} B / ", self.written_bytes)?;
        match self.total_bytes {
            Some(total) => write!(f, "{total} B]")?,
            None => write!(f, "unknown B]")?,
        }
        write!(f, " {:.2} MB/s", self.throughput_mib_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    fn registry() -> Arc<UploadRegistry> {
        Arc::new(UploadRegistry::new())
    }

    #[test]
    fn second_registration_reports_first_start_time() {
        let registry = registry();
        let first = registry
            .begin_transfer("/a/b/file.txt", PathBuf::from("/tmp/x"), Some(10))
            .expect("first registration");
        let conflict = registry
            .begin_transfer("/a/b/file.txt", PathBuf::from("/tmp/x"), Some(10))
            .expect_err("second registration must conflict");
        assert_eq!(conflict.started_at, first.started_at());

        let other = registry.begin_transfer("/a/b/other.txt", PathBuf::from("/tmp/y"), None);
        assert!(other.is_ok(), "distinct paths do not conflict");
    }

    #[test]
    fn dropping_guard_removes_entry() {
        let registry = registry();
        let guard = registry
            .begin_transfer("/f", PathBuf::from("/tmp/f"), None)
            .expect("register");
        assert!(registry.query_progress("/f").is_some());
        drop(guard);
        assert!(registry.query_progress("/f").is_none());
        assert_eq!(registry.active_count(), 0);
        assert!(
            registry
                .begin_transfer("/f", PathBuf::from("/tmp/f"), None)
                .is_ok()
        );
    }

    #[test]
    fn panic_during_transfer_still_removes_entry() {
        let registry = registry();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let guard = registry
                .begin_transfer("/boom", PathBuf::from("/tmp/boom"), Some(5))
                .expect("register");
            guard.advance(3);
            panic!("writer failed mid-stream");
        }));
        assert!(result.is_err());
        assert!(registry.query_progress("/boom").is_none());
    }

    #[test]
    fn concurrent_registration_admits_exactly_one() {
        const THREADS: usize = 16;
        let registry = registry();
        let barrier = Barrier::new(THREADS);
        let winners = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        registry
                            .begin_transfer("/same", PathBuf::from("/tmp/same"), None)
                            .ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .collect::<Vec<_>>()
        });
        assert_eq!(winners.iter().filter(|guard| guard.is_some()).count(), 1);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let registry = registry();
        let guard = registry
            .begin_transfer("/c", PathBuf::from("/tmp/c"), Some(100))
            .expect("register");
        guard.advance(10);
        let snapshot = registry.query_progress("/c").expect("active");
        guard.advance(20);
        assert_eq!(snapshot.written_bytes, 10);
        assert_eq!(guard.written_bytes(), 30);
        assert_eq!(registry.query_progress("/c").expect("active").written_bytes, 30);
    }

    #[test]
    fn progress_with_nothing_written_is_unknown() {
        let registry = registry();
        let _guard = registry
            .begin_transfer("/z", PathBuf::from("/tmp/z"), Some(1000))
            .expect("register");
        let snapshot = registry.query_progress("/z").expect("active");
        let report = snapshot.progress_at(snapshot.started);
        assert_eq!(report.percent, Some(0.0));
        assert_eq!(report.estimated_total_secs, None);
        assert_eq!(report.throughput_mib_per_sec, 0.0);
        assert!(report.to_string().contains("unknown s"));
    }

    #[test]
    fn progress_extrapolates_total_time() {
        let registry = registry();
        let guard = registry
            .begin_transfer("/a/b/file.txt", PathBuf::from("/tmp/file"), Some(1000))
            .expect("register");
        guard.advance(400);
        let snapshot = registry.query_progress("/a/b/file.txt").expect("active");
        let report = snapshot.progress_at(snapshot.started + Duration::from_secs(2));
        assert_eq!(report.percent, Some(40.0));
        assert_eq!(report.estimated_total_secs, Some(5.0));
        assert_eq!(
            report.to_string(),
            "40.00% [2.0 s / 5.0 s] [400 B / 1000 B] 0.00 MB/s"
        );
    }

    #[test]
    fn progress_without_declared_size_reports_unknown_total() {
        let registry = registry();
        let guard = registry
            .begin_transfer("/u", PathBuf::from("/tmp/u"), None)
            .expect("register");
        guard.advance(MIB);
        let snapshot = registry.query_progress("/u").expect("active");
        let report = snapshot.progress_at(snapshot.started + Duration::from_secs(1));
        assert_eq!(report.percent, None);
        assert_eq!(report.estimated_total_secs, None);
        assert_eq!(report.throughput_mib_per_sec, 1.0);
        assert_eq!(
            report.to_string(),
            "unknown% [1.0 s / unknown s] [1048576 B / unknown B] 1.00 MB/s"
        );
    }
}
