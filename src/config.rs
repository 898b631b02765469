use crate::error::SearchError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 設定檔路徑的環境變數
pub const CONFIG_ENV: &str = "IMAGE_SEARCH_CONFIG";

/// 全域設定（建構後不可變）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchSettings,
    pub providers: BTreeMap<String, ProviderSettings>,
    pub enhancers: Vec<EnhancerSettings>,
    pub browser: BrowserSettings,
    pub http: HttpSettings,
    pub diagnostics: DiagnosticsSettings,
}

/// 執行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// 依序嘗試，第一個達到門檻的就停止
    #[default]
    Sequential,
    /// 全部並行，依完成順序輸出
    Parallel,
}

/// 並行模式下的輸出策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelPolicy {
    /// 第一個高信心結果勝出
    #[default]
    First,
    /// 每個服務的第一個高信心結果都輸出
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub mode: SearchMode,
    pub parallel_policy: ParallelPolicy,
    /// 全域相似度門檻
    pub default_threshold: f32,
    /// 每個服務的低信心結果上限
    pub max_results: usize,
    pub provider_timeout_ms: u64,
    /// 依序模式的嘗試順序（空 = 宣告順序）
    pub sequential_order: Vec<String>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            mode: SearchMode::Sequential,
            parallel_policy: ParallelPolicy::First,
            default_threshold: 85.0,
            max_results: 3,
            provider_timeout_ms: 60_000,
            sequential_order: Vec::new(),
        }
    }
}

impl SearchSettings {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

/// 單一搜尋服務的設定
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    /// 0 表示沿用全域門檻
    pub threshold: f32,
    pub max_results: Option<usize>,
    /// 高信心時最多輸出幾筆（會回傳多個排名結果的服務才需要 > 1）
    pub max_high_results: usize,
    pub always_attach: bool,
    pub api_key: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.0,
            max_results: None,
            max_high_results: 1,
            always_attach: false,
            api_key: None,
        }
    }
}

/// 補充資訊服務的設定，清單順序即嘗試順序
#[derive(Debug, Clone, Deserialize)]
pub struct EnhancerSettings {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 從結果擷取貼文 id 的正規表示式（第一個 capture group）
    #[serde(default)]
    pub id_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub fetch_media: bool,
}

fn default_true() -> bool {
    true
}

impl EnhancerSettings {
    pub fn danbooru() -> Self {
        Self {
            name: "danbooru".to_string(),
            enabled: true,
            id_patterns: vec![
                r"danbooru\.donmai\.us/(?:posts|post/show)/(\d+)".to_string(),
                r"danbooru\.donmai\.us/.*[?&]id=(\d+)".to_string(),
            ],
            fetch_media: true,
        }
    }

    pub fn yandere() -> Self {
        Self {
            name: "yandere".to_string(),
            enabled: true,
            id_patterns: vec![r"yande\.re/post/show/(\d+)".to_string()],
            fetch_media: true,
        }
    }
}

/// 會被攔截的資源類型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Image,
    Stylesheet,
    Font,
    Media,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// 同時使用瀏覽器的任務上限
    pub concurrency: usize,
    /// 常駐模式：啟動即開瀏覽器，不做閒置關閉
    pub persistent: bool,
    pub idle_close_ms: u64,
    pub launch_timeout_ms: u64,
    /// 0 表示不定期重啟
    pub restart_interval_ms: u64,
    /// 有頁面在用時延後重啟的間隔
    pub restart_defer_ms: u64,
    pub page_timeout_ms: u64,
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub blocked_resources: Vec<ResourceClass>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            persistent: false,
            idle_close_ms: 60_000,
            launch_timeout_ms: 30_000,
            restart_interval_ms: 0,
            restart_defer_ms: 5_000,
            page_timeout_ms: 30_000,
            headless: true,
            executable: None,
            blocked_resources: vec![
                ResourceClass::Image,
                ResourceClass::Stylesheet,
                ResourceClass::Font,
                ResourceClass::Media,
            ],
        }
    }
}

impl BrowserSettings {
    pub fn idle_close(&self) -> Duration {
        Duration::from_millis(self.idle_close_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_millis(self.restart_interval_ms)
    }

    pub fn restart_defer(&self) -> Duration {
        Duration::from_millis(self.restart_defer_ms)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub requests_per_minute: Option<u32>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 2,
            requests_per_minute: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSettings {
    /// 錯誤快照（截圖 + HTML）的存放目錄
    pub log_dir: PathBuf,
    /// 上傳用暫存檔目錄
    pub temp_dir: PathBuf,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            temp_dir: std::env::temp_dir(),
        }
    }
}

impl Config {
    /// 從 TOML 檔讀取設定
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SearchError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SearchError::Config(format!("無法讀取 {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SearchError> {
        let mut config: Config = toml::from_str(content)
            .map_err(|e| SearchError::Config(format!("TOML 解析失敗: {}", e)))?;
        if config.enhancers.is_empty() {
            config.enhancers = default_enhancers();
        }
        config.validate()?;
        Ok(config)
    }

    /// 依環境變數或 ./config.toml 載入，檔案不存在時使用預設值
    pub fn load() -> Result<Self, SearchError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "./config.toml".to_string());
        if Path::new(&path).exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default().with_default_enhancers())
        }
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        if self.browser.concurrency == 0 {
            return Err(SearchError::Config("browser.concurrency 必須 >= 1".to_string()));
        }
        if self.search.default_threshold <= 0.0 || self.search.default_threshold > 100.0 {
            return Err(SearchError::Config(format!(
                "search.default_threshold 必須介於 (0, 100]: {}",
                self.search.default_threshold
            )));
        }
        Ok(())
    }

    /// 取得服務設定，未設定時回傳預設值
    pub fn provider(&self, name: &str) -> ProviderSettings {
        self.providers.get(name).cloned().unwrap_or_default()
    }

    /// 服務的有效門檻：自訂值 > 0 時使用自訂值，否則用全域門檻
    pub fn effective_threshold(&self, name: &str) -> f32 {
        match self.providers.get(name) {
            Some(p) if p.threshold > 0.0 => p.threshold,
            _ => self.search.default_threshold,
        }
    }

    pub fn with_default_enhancers(mut self) -> Self {
        self.enhancers = default_enhancers();
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.search.mode = mode;
        self
    }

    pub fn with_parallel_policy(mut self, policy: ParallelPolicy) -> Self {
        self.search.parallel_policy = policy;
        self
    }

    pub fn with_default_threshold(mut self, threshold: f32) -> Self {
        self.search.default_threshold = threshold;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.search.max_results = max_results;
        self
    }

    pub fn with_provider(mut self, name: &str, settings: ProviderSettings) -> Self {
        self.providers.insert(name.to_string(), settings);
        self
    }

    pub fn with_enhancer(mut self, settings: EnhancerSettings) -> Self {
        self.enhancers.push(settings);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.browser.concurrency = concurrency;
        self
    }
}

fn default_enhancers() -> Vec<EnhancerSettings> {
    vec![EnhancerSettings::danbooru(), EnhancerSettings::yandere()]
}
