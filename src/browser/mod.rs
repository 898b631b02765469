//! 瀏覽器資源管理
//!
//! - `BrowserBackend`：瀏覽器自動化後端的抽象（正式環境用 `chrome::ChromeBackend`）
//! - `BrowserResourceManager`：唯一的共享瀏覽器實例，負責延遲啟動、閒置關閉、
//!   定期重啟、崩潰復原與頁面配發
//! - `PageLease`：單一任務獨佔的頁面，結束時一定會被釋放

pub mod chrome;
pub mod manager;

pub use chrome::{ChromeBackend, ChromePage};
pub use manager::{BrowserResourceManager, BrowserState, PageLease};

use crate::config::{BrowserSettings, ResourceClass};
use anyhow::Result;
use std::time::Duration;

/// 建立新頁面時套用的設定
#[derive(Debug, Clone)]
pub struct PageSetup {
    /// 頁面操作的預設逾時
    pub default_timeout: Duration,
    /// 忽略網站的 Content-Security-Policy
    pub bypass_csp: bool,
    /// 直接中止的資源類型（文件、XHR、導覽一律放行）
    pub blocked_resources: Vec<ResourceClass>,
}

impl PageSetup {
    pub fn from_settings(settings: &BrowserSettings) -> Self {
        Self {
            default_timeout: settings.page_timeout(),
            bypass_csp: true,
            blocked_resources: settings.blocked_resources.clone(),
        }
    }
}

/// 錯誤快照的內容（盡力取得，任一項可能缺少）
#[derive(Debug, Clone, Default)]
pub struct PageCapture {
    pub screenshot: Option<Vec<u8>>,
    pub html: Option<String>,
}

impl PageCapture {
    pub fn is_empty(&self) -> bool {
        self.screenshot.is_none() && self.html.is_none()
    }
}

/// 瀏覽器自動化後端
#[async_trait::async_trait]
pub trait BrowserBackend: Send + Sync + 'static {
    type Instance: Send + Sync + 'static;
    type Page: Clone + Send + Sync + 'static;

    /// 啟動新的瀏覽器實例
    async fn launch(&self) -> Result<Self::Instance>;

    /// 實例是否仍然連線（崩潰或被外部關閉時回傳 false）
    fn is_connected(&self, instance: &Self::Instance) -> bool;

    async fn open_page(&self, instance: &Self::Instance, setup: &PageSetup) -> Result<Self::Page>;

    async fn close_page(&self, page: Self::Page) -> Result<()>;

    /// 關閉實例並等待行程結束
    async fn shutdown(&self, instance: &Self::Instance) -> Result<()>;

    /// 截圖 + HTML，失敗的部分留空
    async fn capture(&self, page: &Self::Page) -> PageCapture;

    async fn title(&self, page: &Self::Page) -> Result<Option<String>>;

    async fn current_url(&self, page: &Self::Page) -> Option<String>;

    /// 在 `wait` 內輪詢頁面文字，回傳第一個出現的字串
    async fn find_text(&self, page: &Self::Page, needles: &[&str], wait: Duration) -> Option<String>;
}
