//! 共享瀏覽器實例的生命週期管理
//!
//! 狀態：`Absent → Launching → Ready → Absent`
//!
//! - 第一次要頁面（或常駐模式初始化）時啟動
//! - 啟動中的其他請求共用同一個 in-flight 啟動 future
//! - 非常駐模式下，最後一個頁面關閉後開始閒置計時，逾時就關閉瀏覽器
//! - 常駐模式可定期重啟；有頁面在用時延後，不中斷進行中的工作
//! - 連線中斷（崩潰）時，下一次要頁面會重新啟動

use super::{BrowserBackend, PageSetup};
use crate::config::BrowserSettings;
use crate::error::SearchError;
use crate::file_manager::{FileManager, SnapshotFiles};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 反機器人驗證頁的標題特徵（小寫比對）
const CHALLENGE_TITLES: &[&str] = &[
    "just a moment",
    "attention required",
    "checking your browser",
    "ddos-guard",
    "請稍候",
    "请稍候",
];

/// 反機器人驗證頁的文字特徵
const CHALLENGE_TEXTS: &[&str] = &[
    "Verify you are human",
    "Checking if the site connection is secure",
    "Enable JavaScript and cookies to continue",
    "needs to review the security of your connection",
];

const CHALLENGE_TEXT_WAIT: Duration = Duration::from_secs(1);

fn disposed_error() -> SearchError {
    SearchError::ResourceLaunchFailure("瀏覽器已釋放".to_string())
}

/// 對外可觀察的狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserState {
    Absent,
    Launching,
    Ready,
}

type LaunchFuture<I> = Shared<BoxFuture<'static, Result<Arc<I>, SearchError>>>;

enum Slot<I> {
    Absent,
    Launching { generation: u64, launch: LaunchFuture<I> },
    Ready(Arc<I>),
}

enum CloseOutcome {
    Closed,
    Busy,
    NotRunning,
}

struct Inner<B: BrowserBackend> {
    backend: B,
    settings: BrowserSettings,
    files: FileManager,
    slot: Mutex<Slot<B::Instance>>,
    active_pages: AtomicUsize,
    launch_count: AtomicUsize,
    generation: AtomicU64,
    disposed: AtomicBool,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    restart_task: Mutex<Option<JoinHandle<()>>>,
}

/// 共享瀏覽器管理器（可 clone，內部共用同一份狀態）
pub struct BrowserResourceManager<B: BrowserBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: BrowserBackend> Clone for BrowserResourceManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: BrowserBackend> BrowserResourceManager<B> {
    pub fn new(backend: B, settings: BrowserSettings, files: FileManager) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                settings,
                files,
                slot: Mutex::new(Slot::Absent),
                active_pages: AtomicUsize::new(0),
                launch_count: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                idle_timer: Mutex::new(None),
                restart_task: Mutex::new(None),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> BrowserState {
        match &*self.inner.slot.lock() {
            Slot::Absent => BrowserState::Absent,
            Slot::Launching { .. } => BrowserState::Launching,
            Slot::Ready(_) => BrowserState::Ready,
        }
    }

    pub fn active_pages(&self) -> usize {
        self.inner.active_pages.load(Ordering::SeqCst)
    }

    /// 啟動次數（含失敗）
    pub fn launch_count(&self) -> usize {
        self.inner.launch_count.load(Ordering::SeqCst)
    }

    /// 常駐模式：立即啟動並排程定期重啟
    ///
    /// 啟動失敗只記錄，不回傳錯誤；下一次要頁面時會再試。
    pub async fn initialize(&self) {
        if !self.inner.settings.persistent {
            return;
        }

        match self.inner.ensure_ready().await {
            Ok(_) => info!("🚀 常駐瀏覽器已就緒"),
            Err(e) => error!("常駐瀏覽器啟動失敗: {}", e),
        }
        self.inner.arm_restart();
    }

    /// 取得一個新頁面，呼叫者獨佔直到 `PageLease` 被關閉或 drop
    ///
    /// `dispose()` 之後一律回傳 `ResourceLaunchFailure`。
    pub async fn get_page(&self) -> Result<PageLease<B>, SearchError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(disposed_error());
        }
        let reservation = Reservation::acquire(&self.inner);
        self.inner.cancel_idle_timer();

        let instance = self.inner.ensure_ready().await?;
        let setup = PageSetup::from_settings(&self.inner.settings);
        let page = self
            .inner
            .backend
            .open_page(&instance, &setup)
            .await
            .map_err(|e| SearchError::Page(format!("{:#}", e)))?;

        debug!("已建立頁面 (使用中: {})", self.active_pages());
        Ok(reservation.into_lease(page))
    }

    /// 儲存截圖與 HTML 供除錯，不會回傳錯誤
    pub async fn save_error_snapshot(&self, page: &B::Page, label: &str) -> Option<SnapshotFiles> {
        let capture = self.inner.backend.capture(page).await;
        if capture.is_empty() {
            warn!("無法取得頁面快照 ({})", label);
            return None;
        }

        match self
            .inner
            .files
            .save_snapshot(label, capture.screenshot.as_deref(), capture.html.as_deref())
            .await
        {
            Ok(files) => {
                info!("📸 已儲存錯誤快照: {} ({})", label, self.inner.files.log_dir().display());
                Some(files)
            }
            Err(e) => {
                warn!("儲存錯誤快照失敗 ({}): {:#}", label, e);
                None
            }
        }
    }

    /// 檢查頁面是否為反機器人驗證頁
    ///
    /// 讓呼叫者能立即回報可處理的錯誤，而不是等到選擇器逾時。
    pub async fn check_for_challenge(&self, page: &B::Page) -> Result<(), SearchError> {
        let backend = &self.inner.backend;

        if let Ok(Some(title)) = backend.title(page).await {
            let lower = title.to_lowercase();
            if CHALLENGE_TITLES.iter().any(|pattern| lower.contains(pattern)) {
                let url = backend.current_url(page).await.unwrap_or_default();
                return Err(SearchError::ChallengeDetected {
                    url,
                    hint: format!("頁面標題為「{}」，請稍後再試或更換網路環境", title),
                });
            }
        }

        if let Some(text) = backend
            .find_text(page, CHALLENGE_TEXTS, CHALLENGE_TEXT_WAIT)
            .await
        {
            let url = backend.current_url(page).await.unwrap_or_default();
            return Err(SearchError::ChallengeDetected {
                url,
                hint: format!("頁面出現「{}」，請稍後再試或更換網路環境", text),
            });
        }

        Ok(())
    }

    /// 釋放所有資源（可重複呼叫）
    ///
    /// 進行中的啟動完成後會直接關閉，之後不會再啟動瀏覽器。
    pub async fn dispose(&self) {
        let inner = &self.inner;
        inner.disposed.store(true, Ordering::SeqCst);
        inner.cancel_idle_timer();
        if let Some(handle) = inner.restart_task.lock().take() {
            handle.abort();
        }

        let instance = {
            let mut slot = inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Absent) {
                Slot::Ready(instance) => Some(instance),
                _ => None,
            }
        };

        if let Some(instance) = instance {
            inner.shutdown_instance(instance).await;
            info!("瀏覽器已釋放");
        }
    }

    /// `initialize()` → `work` → `dispose()`，`work` 失敗時也會釋放
    pub async fn run_session<F: Future>(&self, work: F) -> F::Output {
        self.initialize().await;
        let output = work.await;
        self.dispose().await;
        output
    }
}

impl<B: BrowserBackend> Inner<B> {
    /// 確保瀏覽器就緒，必要時啟動（同時間只會有一個啟動流程）
    async fn ensure_ready(self: &Arc<Self>) -> Result<Arc<B::Instance>, SearchError> {
        let launch = {
            let mut slot = self.slot.lock();
            if self.disposed.load(Ordering::SeqCst) {
                return Err(disposed_error());
            }

            if let Slot::Ready(instance) = &*slot {
                if self.backend.is_connected(instance) {
                    return Ok(Arc::clone(instance));
                }
                warn!("⚠️ 瀏覽器連線已中斷，重新啟動");
                *slot = Slot::Absent;
            }

            match &*slot {
                Slot::Launching { launch, .. } => launch.clone(),
                _ => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let launch = self.launch_future(generation).shared();
                    *slot = Slot::Launching {
                        generation,
                        launch: launch.clone(),
                    };
                    launch
                }
            }
        };

        launch.await
    }

    /// 單次啟動：與逾時競速，沒有額外重試
    fn launch_future(
        self: &Arc<Self>,
        generation: u64,
    ) -> BoxFuture<'static, Result<Arc<B::Instance>, SearchError>> {
        let inner = Arc::clone(self);
        async move {
            inner.launch_count.fetch_add(1, Ordering::SeqCst);
            let launch_timeout = inner.settings.launch_timeout();
            info!("🚀 啟動瀏覽器...");

            let result = match tokio::time::timeout(launch_timeout, inner.backend.launch()).await {
                Ok(Ok(instance)) => Ok(Arc::new(instance)),
                Ok(Err(e)) => {
                    error!("瀏覽器啟動失敗: {:#}", e);
                    Err(SearchError::ResourceLaunchFailure(format!("{:#}", e)))
                }
                Err(_) => {
                    error!("瀏覽器啟動逾時 ({:?})", launch_timeout);
                    Err(SearchError::ResourceLaunchFailure(
                        SearchError::timeout("啟動瀏覽器", launch_timeout).to_string(),
                    ))
                }
            };

            inner.settle_launch(generation, result).await
        }
        .boxed()
    }

    /// 啟動結束後更新狀態；啟動期間已被釋放的話，關掉剛啟動的實例
    async fn settle_launch(
        &self,
        generation: u64,
        result: Result<Arc<B::Instance>, SearchError>,
    ) -> Result<Arc<B::Instance>, SearchError> {
        let current = {
            let mut slot = self.slot.lock();
            let current =
                matches!(&*slot, Slot::Launching { generation: g, .. } if *g == generation);
            if current {
                *slot = match &result {
                    Ok(instance) => Slot::Ready(Arc::clone(instance)),
                    Err(_) => Slot::Absent,
                };
            }
            current
        };

        if current {
            if result.is_ok() {
                info!("✅ 瀏覽器已就緒");
            }
            return result;
        }

        if let Ok(instance) = result {
            warn!("啟動期間瀏覽器已被釋放，關閉剛啟動的實例");
            self.shutdown_instance(instance).await;
        }
        Err(disposed_error())
    }

    /// 頁面釋放後呼叫
    fn release_slot(self: &Arc<Self>) {
        let previous = self.active_pages.fetch_sub(1, Ordering::SeqCst);
        let remaining = previous.saturating_sub(1);
        debug!("頁面已釋放 (使用中: {})", remaining);

        if remaining == 0 && !self.settings.persistent && !self.disposed.load(Ordering::SeqCst) {
            self.arm_idle_timer();
        }
    }

    fn arm_idle_timer(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let weak = Arc::downgrade(self);
        let delay = self.settings.idle_close();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                if let CloseOutcome::Closed = inner.close_if_idle("閒置逾時").await {
                    info!("💤 瀏覽器閒置 {:?}，已關閉", delay);
                }
            }
        });

        if let Some(previous) = self.idle_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_idle_timer(&self) {
        if let Some(handle) = self.idle_timer.lock().take() {
            handle.abort();
        }
    }

    /// 沒有頁面在用時關閉實例
    async fn close_if_idle(&self, reason: &str) -> CloseOutcome {
        let instance = {
            let mut slot = self.slot.lock();
            if self.active_pages.load(Ordering::SeqCst) > 0 {
                return CloseOutcome::Busy;
            }
            let instance = match &*slot {
                Slot::Ready(instance) => Arc::clone(instance),
                _ => return CloseOutcome::NotRunning,
            };
            *slot = Slot::Absent;
            instance
        };

        debug!("關閉瀏覽器 ({})", reason);
        self.shutdown_instance(instance).await;
        CloseOutcome::Closed
    }

    async fn shutdown_instance(&self, instance: Arc<B::Instance>) {
        if !self.backend.is_connected(&instance) {
            return;
        }
        if let Err(e) = self.backend.shutdown(&instance).await {
            warn!("關閉瀏覽器失敗: {:#}", e);
        }
    }

    fn arm_restart(self: &Arc<Self>) {
        let interval = self.settings.restart_interval();
        if !self.settings.persistent || interval.is_zero() {
            return;
        }

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.restart_when_idle().await;
            }
        });

        if let Some(previous) = self.restart_task.lock().replace(handle) {
            previous.abort();
        }
        info!("🔄 已排程每 {:?} 重啟瀏覽器", interval);
    }

    /// 定期重啟：有頁面在用就延後重試，失敗留到下一次排程
    async fn restart_when_idle(self: &Arc<Self>) {
        loop {
            if self.disposed.load(Ordering::SeqCst) {
                return;
            }
            match self.close_if_idle("定期重啟").await {
                CloseOutcome::Busy => {
                    debug!("仍有頁面使用中，延後重啟");
                    tokio::time::sleep(self.settings.restart_defer()).await;
                }
                CloseOutcome::Closed | CloseOutcome::NotRunning => break,
            }
        }

        match self.ensure_ready().await {
            Ok(_) => info!("🔄 瀏覽器定期重啟完成"),
            Err(e) => error!("瀏覽器定期重啟失敗，下次排程再試: {}", e),
        }
    }
}

/// 已計入使用中頁面、但還沒拿到頁面的保留位
///
/// 在取得頁面前被 drop（失敗或呼叫端取消）會自動歸還。
struct Reservation<B: BrowserBackend> {
    inner: Arc<Inner<B>>,
    armed: bool,
}

impl<B: BrowserBackend> Reservation<B> {
    fn acquire(inner: &Arc<Inner<B>>) -> Self {
        // 與 close_if_idle 共用同一把鎖，避免剛檢查完就被關閉
        {
            let _slot = inner.slot.lock();
            inner.active_pages.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            inner: Arc::clone(inner),
            armed: true,
        }
    }

    fn into_lease(mut self, page: B::Page) -> PageLease<B> {
        self.armed = false;
        PageLease {
            page,
            inner: Arc::clone(&self.inner),
            released: false,
        }
    }
}

impl<B: BrowserBackend> Drop for Reservation<B> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release_slot();
        }
    }
}

/// 獨佔頁面；`close()` 或 drop 時一定會關閉並歸還
pub struct PageLease<B: BrowserBackend> {
    page: B::Page,
    inner: Arc<Inner<B>>,
    released: bool,
}

impl<B: BrowserBackend> PageLease<B> {
    pub fn page(&self) -> &B::Page {
        &self.page
    }

    /// 關閉頁面並歸還使用權
    pub async fn close(mut self) {
        self.released = true;
        if let Err(e) = self.inner.backend.close_page(self.page.clone()).await {
            debug!("關閉頁面失敗: {:#}", e);
        }
        self.inner.release_slot();
    }
}

impl<B: BrowserBackend> Drop for PageLease<B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let inner = Arc::clone(&self.inner);
        let page = self.page.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = inner.backend.close_page(page).await {
                        debug!("關閉頁面失敗: {:#}", e);
                    }
                    inner.release_slot();
                });
            }
            Err(_) => inner.release_slot(),
        }
    }
}
