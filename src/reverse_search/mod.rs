// 宣告子模組
pub mod types;
pub mod trait_def;
pub mod confidence;
pub mod engine;
pub mod utils;
pub mod services;

// 重新導出常用項目（讓外部可以用 reverse_search::XXX 直接存取）
pub use types::{
    EnhancedDetail, ProviderSelection, ReportSection, SearchHit, SearchOptions, SearchOutput,
    SearchReport, SearchTask,
};
pub use trait_def::SearchProvider;
pub use engine::{ExecutionMode, SearchOrchestrator};
