//! 存储用量刷新的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::estimator::StorageEstimator;

/// 启动存储用量估算任务，直到 `cancel` 被触发。
pub fn spawn_background_tasks(
    estimator: Arc<StorageEstimator>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(err) = estimator.refresh().await {
                warn!(
                    root = ?estimator.root_path(),
                    error = %err,
                    "storage estimate refresh failed, keeping previous value"
                );
            }
        }
        info!("storage estimator stopped");
    })
}

/// 等待后台任务结束；任务 panic 或被取消时记录日志并返回 `false`。
pub async fn join_background_task(task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, panicked = err.is_panic(), "background task failed");
            false
        }
    }
}
