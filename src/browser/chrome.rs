//! chromiumoxide 後端

use super::{BrowserBackend, PageCapture, PageSetup};
use crate::config::{BrowserSettings, ResourceClass};
use crate::fetcher::USER_AGENT;
use anyhow::{Context, Result, anyhow};
use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::SetBypassCspParams;
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

const TEXT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// 以本機 Chrome/Chromium 實作的後端
pub struct ChromeBackend {
    settings: BrowserSettings,
}

impl ChromeBackend {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

/// 一個 Chrome 行程
pub struct ChromeInstance {
    browser: tokio::sync::Mutex<Browser>,
    handler: JoinHandle<()>,
    connected: Arc<AtomicBool>,
    user_data_dir: parking_lot::Mutex<Option<PathBuf>>,
}

impl ChromeInstance {
    fn remove_user_data_dir(&self) {
        if let Some(dir) = self.user_data_dir.lock().take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                debug!("刪除瀏覽器資料目錄失敗 ({}): {}", dir.display(), e);
            }
        }
    }
}

impl Drop for ChromeInstance {
    fn drop(&mut self) {
        self.handler.abort();
        self.remove_user_data_dir();
    }
}

/// 一個分頁（clone 共用同一個 CDP target）
#[derive(Clone)]
pub struct ChromePage {
    page: Page,
    timeout: Duration,
    interceptor: Option<AbortHandle>,
}

impl ChromePage {
    pub fn inner(&self) -> &Page {
        &self.page
    }

    /// 開啟網址並等待載入完成
    pub async fn goto(&self, url: &str) -> Result<()> {
        tokio::time::timeout(self.timeout, async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await
        .map_err(|_| anyhow!("開啟頁面逾時 ({:?}): {}", self.timeout, url))?
        .with_context(|| format!("開啟頁面失敗: {}", url))
    }

    /// 輪詢等待元素出現（100ms 起跳，每次加倍，上限 1 秒）
    pub async fn wait_for_element(&self, selector: &str) -> Result<Element> {
        let start = Instant::now();
        let mut poll_interval = Duration::from_millis(100);
        let max_interval = Duration::from_secs(1);

        loop {
            if let Ok(element) = self.page.find_element(selector).await {
                return Ok(element);
            }

            if start.elapsed() >= self.timeout {
                return Err(anyhow!(
                    "找不到元素 ({}ms): {}",
                    self.timeout.as_millis(),
                    selector
                ));
            }

            tokio::time::sleep(poll_interval).await;
            poll_interval = (poll_interval * 2).min(max_interval);
        }
    }

    /// 把本機檔案設定到 `<input type="file">`
    pub async fn set_input_files(&self, selector: &str, files: &[&Path]) -> Result<()> {
        let element = self.wait_for_element(selector).await?;
        let files = files
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect::<Vec<_>>();

        let params = SetFileInputFilesParams::builder()
            .files(files)
            .backend_node_id(element.backend_node_id)
            .build()
            .map_err(|e| anyhow!("上傳參數錯誤: {}", e))?;
        self.page.execute(params).await.context("設定上傳檔案失敗")?;
        Ok(())
    }

    /// 點擊元素並等待導覽完成
    pub async fn click_and_wait(&self, selector: &str) -> Result<()> {
        let element = self.wait_for_element(selector).await?;
        tokio::time::timeout(self.timeout, async {
            element.click().await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await
        .map_err(|_| anyhow!("等待頁面跳轉逾時 ({:?})", self.timeout))?
        .with_context(|| format!("點擊失敗: {}", selector))
    }

    pub async fn content(&self) -> Result<String> {
        self.page.content().await.context("讀取頁面 HTML 失敗")
    }
}

#[async_trait::async_trait]
impl BrowserBackend for ChromeBackend {
    type Instance = ChromeInstance;
    type Page = ChromePage;

    async fn launch(&self) -> Result<ChromeInstance> {
        let executable = find_browser_executable(self.settings.executable.as_deref())?;

        let guard = TempDirGuard::new(std::env::temp_dir().join(format!(
            "image_search_chrome_{}_{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        )))?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(executable)
            .user_data_dir(&guard.path)
            .request_timeout(self.settings.page_timeout())
            .window_size(1366, 900)
            .arg(format!("--user-agent={}", USER_AGENT))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--mute-audio");

        builder = if self.settings.headless {
            builder.headless_mode(HeadlessMode::default())
        } else {
            builder.with_head()
        };

        if should_disable_sandbox() {
            info!("偵測到容器環境，停用 sandbox");
            builder = builder.arg("--no-sandbox").arg("--disable-setuid-sandbox");
        }

        let config = builder
            .build()
            .map_err(|e| anyhow!("瀏覽器設定錯誤: {}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("無法啟動瀏覽器")?;

        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    // 無法辨識的 CDP 事件不影響運作
                    trace!("CDP 事件處理錯誤: {}", e);
                }
            }
            flag.store(false, Ordering::SeqCst);
            debug!("瀏覽器連線已結束");
        });

        Ok(ChromeInstance {
            browser: tokio::sync::Mutex::new(browser),
            handler,
            connected,
            user_data_dir: parking_lot::Mutex::new(Some(guard.into_path())),
        })
    }

    fn is_connected(&self, instance: &ChromeInstance) -> bool {
        instance.connected.load(Ordering::SeqCst) && !instance.handler.is_finished()
    }

    async fn open_page(&self, instance: &ChromeInstance, setup: &PageSetup) -> Result<ChromePage> {
        let page = {
            let browser = instance.browser.lock().await;
            browser.new_page("about:blank").await.context("無法建立分頁")?
        };

        if setup.bypass_csp {
            page.execute(SetBypassCspParams::new(true))
                .await
                .context("無法停用 CSP")?;
        }

        let interceptor = if setup.blocked_resources.is_empty() {
            None
        } else {
            Some(block_resources(&page, &setup.blocked_resources).await?)
        };

        Ok(ChromePage {
            page,
            timeout: setup.default_timeout,
            interceptor,
        })
    }

    async fn close_page(&self, page: ChromePage) -> Result<()> {
        if let Some(interceptor) = &page.interceptor {
            interceptor.abort();
        }
        page.page.close().await.context("關閉分頁失敗")?;
        Ok(())
    }

    async fn shutdown(&self, instance: &ChromeInstance) -> Result<()> {
        {
            let mut browser = instance.browser.lock().await;
            browser.close().await.context("關閉瀏覽器失敗")?;
            if let Err(e) = browser.wait().await {
                warn!("等待瀏覽器行程結束失敗: {}", e);
            }
        }
        instance.connected.store(false, Ordering::SeqCst);
        instance.remove_user_data_dir();
        Ok(())
    }

    async fn capture(&self, page: &ChromePage) -> PageCapture {
        let screenshot = page
            .page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(|e| debug!("截圖失敗: {}", e))
            .ok();
        let html = page
            .page
            .content()
            .await
            .map_err(|e| debug!("讀取 HTML 失敗: {}", e))
            .ok();

        PageCapture { screenshot, html }
    }

    async fn title(&self, page: &ChromePage) -> Result<Option<String>> {
        page.page.get_title().await.context("讀取標題失敗")
    }

    async fn current_url(&self, page: &ChromePage) -> Option<String> {
        page.page.url().await.ok().flatten()
    }

    async fn find_text(&self, page: &ChromePage, needles: &[&str], wait: Duration) -> Option<String> {
        let needles = serde_json::to_string(needles).ok()?;
        let script = format!(
            "(() => {{ const text = document.body ? document.body.innerText : ''; \
             return {}.find(n => text.includes(n)) || null; }})()",
            needles
        );

        let deadline = Instant::now() + wait;
        loop {
            let found = match page.page.evaluate(script.as_str()).await {
                Ok(result) => result.into_value::<Option<String>>().ok().flatten(),
                Err(_) => None,
            };
            if found.is_some() || Instant::now() >= deadline {
                return found;
            }
            tokio::time::sleep(TEXT_POLL_INTERVAL).await;
        }
    }
}

/// 用 Fetch domain 攔截請求，指定類型直接中止
async fn block_resources(page: &Page, classes: &[ResourceClass]) -> Result<AbortHandle> {
    let blocked = classes.iter().map(resource_type).collect::<Vec<_>>();

    let mut events = page
        .event_listener::<EventRequestPaused>()
        .await
        .context("無法監聽請求")?;
    page.execute(
        EnableParams::builder()
            .patterns(vec![RequestPattern::builder().url_pattern("*").build()])
            .build(),
    )
    .await
    .context("無法啟用請求攔截")?;

    let page = page.clone();
    let task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let result = if blocked.contains(&event.resource_type) {
                page.execute(FailRequestParams::new(
                    event.request_id.clone(),
                    ErrorReason::BlockedByClient,
                ))
                .await
                .map(|_| ())
            } else {
                page.execute(ContinueRequestParams::new(event.request_id.clone()))
                    .await
                    .map(|_| ())
            };

            if let Err(e) = result {
                trace!("處理攔截請求失敗: {}", e);
            }
        }
    });

    Ok(task.abort_handle())
}

fn resource_type(class: &ResourceClass) -> ResourceType {
    match class {
        ResourceClass::Image => ResourceType::Image,
        ResourceClass::Stylesheet => ResourceType::Stylesheet,
        ResourceClass::Font => ResourceType::Font,
        ResourceClass::Media => ResourceType::Media,
    }
}

/// 啟動失敗時自動刪除的暫存目錄
struct TempDirGuard {
    path: PathBuf,
    keep: bool,
}

impl TempDirGuard {
    fn new(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path).context("無法建立瀏覽器資料目錄")?;
        Ok(Self { path, keep: false })
    }

    fn into_path(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!("刪除暫存目錄失敗 ({}): {}", self.path.display(), e);
            }
        }
    }
}

/// 尋找 Chrome/Chromium 執行檔
///
/// 順序：設定檔 → `CHROMIUM_PATH` → 各平台常見路徑 → `which`
pub fn find_browser_executable(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        warn!("browser.executable 指向不存在的檔案: {}", path.display());
    }

    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        warn!("CHROMIUM_PATH 指向不存在的檔案: {}", path.display());
    }

    let candidates: &[&str] = if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "~/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
        ]
    };

    for candidate in candidates {
        let path = match candidate.strip_prefix("~/") {
            Some(rest) => match dirs::home_dir() {
                Some(home) => home.join(rest),
                None => continue,
            },
            None => PathBuf::from(candidate),
        };
        if path.exists() {
            debug!("找到瀏覽器: {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in ["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output()
                && output.status.success()
            {
                let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !found.is_empty() {
                    return Ok(PathBuf::from(found));
                }
            }
        }
    }

    Err(anyhow!(
        "找不到 Chrome/Chromium 執行檔，請安裝或設定 CHROMIUM_PATH / browser.executable"
    ))
}

/// 容器內 setuid sandbox 無法運作
fn should_disable_sandbox() -> bool {
    Path::new("/.dockerenv").exists()
        || std::env::var("container").is_ok()
        || std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_executable_wins() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(find_browser_executable(Some(&exe)).unwrap(), exe);
    }

    #[test]
    fn test_resource_type_mapping() {
        assert_eq!(resource_type(&ResourceClass::Image), ResourceType::Image);
        assert_eq!(resource_type(&ResourceClass::Font), ResourceType::Font);
    }

    #[test]
    fn test_temp_dir_guard_cleans_up() {
        let path = std::env::temp_dir().join(format!("image_search_guard_{}", std::process::id()));
        let guard = TempDirGuard::new(path.clone()).unwrap();
        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());
    }
}
