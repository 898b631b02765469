//! 反向圖片搜尋聚合器
//!
//! 一次請求同時查詢多個反向搜尋服務，依相似度門檻挑出代表結果，
//! 需要瀏覽器的服務共用同一個受控的瀏覽器實例。

pub mod browser;
pub mod config;
pub mod enhance;
pub mod error;
pub mod fetcher;
pub mod file_manager;
pub mod gate;
pub mod logging;
pub mod reverse_search;

pub use config::Config;
pub use error::{SearchError, SearchResult};
pub use gate::ConcurrencyGate;
pub use reverse_search::{ExecutionMode, SearchOrchestrator, SearchReport, SearchTask};
