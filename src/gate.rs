//! 並發閘門
//!
//! 限制同時執行的重量級任務（瀏覽器頁面）數量。超出的任務依 FIFO 排隊，
//! 排隊中的任務可以透過 `CancellationToken` 取消；已經開始執行的任務不會被中斷。

use crate::error::SearchError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    running: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

/// 計數器 guard，離開作用域時自動減一
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGate {
    /// 建立閘門，`capacity` 必須 >= 1
    pub fn new(capacity: usize) -> Result<Self, SearchError> {
        if capacity == 0 {
            return Err(SearchError::Config("閘門容量必須 >= 1".to_string()));
        }

        Ok(Self {
            // tokio 的 Semaphore 是公平的，等待者依 FIFO 取得許可
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            running: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// 排隊等待執行權後執行 `task`
    ///
    /// - 取消訊號已觸發：立即回傳 `Cancelled`，`task` 不會被呼叫
    /// - 排隊中觸發取消：移出佇列並回傳 `Cancelled`
    /// - 取得執行權後觸發取消：無效，任務照常執行到結束
    pub async fn run<F, Fut, T>(
        &self,
        task: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, SearchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(SearchError::Cancelled);
        }

        let permit = {
            let _queued = CountGuard::enter(&self.queued);
            match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            debug!("排隊中的任務被取消");
                            return Err(SearchError::Cancelled);
                        }
                        permit = self.semaphore.acquire() => permit,
                    }
                }
                None => self.semaphore.acquire().await,
            }
        }
        .map_err(|_| SearchError::Config("閘門已關閉".to_string()))?;

        let _running = CountGuard::enter(&self.running);
        let output = task().await;
        drop(permit);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            ConcurrencyGate::new(0),
            Err(SearchError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_running_never_exceeds_capacity() {
        for capacity in 1..=3 {
            let gate = ConcurrencyGate::new(capacity).unwrap();
            let current = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let mut tasks = vec![];
            for i in 0..10u64 {
                let gate = gate.clone();
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                tasks.push(tokio::spawn(async move {
                    gate.run(
                        || async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5 + i % 3)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            i
                        },
                        None,
                    )
                    .await
                }));
            }

            for task in tasks {
                assert!(task.await.unwrap().is_ok());
            }
            assert!(peak.load(Ordering::SeqCst) <= capacity);
            assert_eq!(gate.running(), 0);
            assert_eq!(gate.queued(), 0);
        }
    }

    #[tokio::test]
    async fn test_failed_task_releases_capacity() {
        let gate = ConcurrencyGate::new(1).unwrap();
        let first: Result<Result<(), &str>, _> = gate.run(|| async { Err("boom") }, None).await;
        assert_eq!(first.unwrap(), Err("boom"));

        let second = tokio::time::timeout(
            Duration::from_millis(100),
            gate.run(|| async { 7 }, None),
        )
        .await
        .unwrap();
        assert_eq!(second.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_already_cancelled_fails_immediately() {
        let gate = ConcurrencyGate::new(1).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let executed = AtomicBool::new(false);
        let result = gate
            .run(
                || async {
                    executed.store(true, Ordering::SeqCst);
                },
                Some(&token),
            )
            .await;

        assert_eq!(result, Err(SearchError::Cancelled));
        assert!(!executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let gate = ConcurrencyGate::new(1).unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // 佔住唯一的執行權
        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.run(
                    || async move {
                        let _ = release_rx.await;
                    },
                    None,
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gate.running(), 1);

        let token = CancellationToken::new();
        let executed = Arc::new(AtomicBool::new(false));
        let queued = {
            let gate = gate.clone();
            let token = token.clone();
            let executed = Arc::clone(&executed);
            tokio::spawn(async move {
                gate.run(
                    || async move {
                        executed.store(true, Ordering::SeqCst);
                    },
                    Some(&token),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gate.queued(), 1);

        token.cancel();
        assert_eq!(queued.await.unwrap(), Err(SearchError::Cancelled));
        assert_eq!(gate.queued(), 0);

        release_tx.send(()).unwrap();
        assert!(holder.await.unwrap().is_ok());
        assert!(!executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_after_admission_has_no_effect() {
        let gate = ConcurrencyGate::new(1).unwrap();
        let token = CancellationToken::new();

        let inner_token = token.clone();
        let result = gate
            .run(
                || async move {
                    inner_token.cancel();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    "done"
                },
                Some(&token),
            )
            .await;

        assert_eq!(result, Ok("done"));
    }

    #[tokio::test]
    async fn test_fifo_admission() {
        let gate = ConcurrencyGate::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.run(
                    || async move {
                        let _ = release_rx.await;
                    },
                    None,
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut waiters = vec![];
        for i in 0..4 {
            let gate = gate.clone();
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                gate.run(
                    || async move {
                        order.lock().unwrap().push(i);
                    },
                    None,
                )
                .await
            }));
            // 確保依序進入佇列
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
