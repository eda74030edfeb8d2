//! 过期未完成上传的后台清理任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::UPLOAD_EXPIRE_INTERVAL_SECS;
use crate::store::UploadStore;

/// 启动后台任务；`ttl` 为零时不清理。
pub fn spawn_background_tasks(store: Arc<UploadStore>, ttl: Duration) {
    if ttl.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(UPLOAD_EXPIRE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match store.expire(ttl).await {
                Ok(report) => debug!(
                    resumable = report.resumable,
                    removed = report.removed,
                    "upload expiry sweep"
                ),
                Err(err) => warn!(error = %err, "upload expiry sweep failed"),
            }
        }
    });
}
