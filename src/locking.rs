//! 内存上传锁：按 upload id 串行化同一上传的读写。
//!
//! 锁条目随持有者与等待者的 drop 自动回收，请求被取消时也不会残留。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

type Registry = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Manages asynchronous mutexes keyed by upload id.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Registry,
}

/// 获取锁超时。
#[derive(Debug)]
pub struct LockTimeout;

/// 持有中的上传锁；drop 时释放互斥锁并回收空闲条目。
#[derive(Debug)]
pub struct UploadLock {
    // 字段按声明顺序 drop：先放开互斥锁，再注销。
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}

/// 对某个 id 条目的引用；drop 时若已无他人引用则移除条目。
#[derive(Debug)]
struct Registration {
    registry: Registry,
    upload_id: String,
    entry: Option<Arc<Mutex<()>>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.entry.take();
        let mut locks = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.upload_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.upload_id);
        }
    }
}

impl LockManager {
    /// 创建新的锁管理器实例。
    pub fn new() -> Self {
        Self::default()
    }

    /// 在给定超时时间内获取上传锁，超时返回 Err。
    pub async fn lock_with_timeout(
        &self,
        upload_id: &str,
        timeout: Duration,
    ) -> Result<UploadLock, LockTimeout> {
        let registration = self.register(upload_id);
        let lock = registration
            .entry
            .clone()
            .unwrap_or_else(|| Arc::new(Mutex::new(())));
        let guard = time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout)?;
        Ok(UploadLock {
            _guard: guard,
            _registration: registration,
        })
    }

    fn register(&self, upload_id: &str) -> Registration {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = locks
            .entry(upload_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Registration {
            registry: self.locks.clone(),
            upload_id: upload_id.to_string(),
            entry: Some(entry),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let manager = LockManager::new();
        let guard = manager
            .lock_with_timeout("a", Duration::from_secs(1))
            .await
            .expect("first lock");
        let second = manager
            .lock_with_timeout("a", Duration::from_millis(50))
            .await;
        assert!(second.is_err());
        drop(guard);
        assert!(
            manager
                .lock_with_timeout("a", Duration::from_millis(50))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn different_ids_do_not_block() {
        let manager = LockManager::new();
        let _a = manager
            .lock_with_timeout("a", Duration::from_secs(1))
            .await
            .expect("lock a");
        let b = manager
            .lock_with_timeout("b", Duration::from_millis(50))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn entries_are_dropped_with_the_last_reference() {
        let manager = LockManager::new();
        let guard = manager
            .lock_with_timeout("a", Duration::from_secs(1))
            .await
            .expect("lock a");
        assert_eq!(manager.len(), 1);

        let timed_out = manager
            .lock_with_timeout("a", Duration::from_millis(20))
            .await;
        assert!(timed_out.is_err());
        assert_eq!(manager.len(), 1, "held lock must survive a timed out waiter");

        drop(guard);
        assert_eq!(manager.len(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_entry() {
        let manager = Arc::new(LockManager::new());
        let guard = manager
            .lock_with_timeout("a", Duration::from_secs(1))
            .await
            .expect("lock a");

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _ = manager.lock_with_timeout("a", Duration::from_secs(30)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(guard);
        assert_eq!(manager.len(), 0);
    }
}
