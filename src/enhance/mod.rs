//! 補充資訊
//!
//! 高信心結果可以再向圖站查詢標籤與原圖。同一次請求裡，
//! 同一個服務的同一篇貼文（服務名稱 + 貼文 id）只會查詢一次。

pub mod danbooru;
pub mod yandere;

pub use danbooru::DanbooruEnhancer;
pub use yandere::YandereEnhancer;

use crate::config::EnhancerSettings;
use crate::error::SearchError;
use crate::logging;
use crate::reverse_search::{EnhancedDetail, SearchHit};
use anyhow::Result;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// 補充資訊服務 Trait
#[async_trait::async_trait]
pub trait Enhancer: Send + Sync {
    fn name(&self) -> &str;

    /// `post_id` 由設定檔的 id_patterns 從結果中擷取
    ///
    /// 找不到貼文時回傳 `Ok(None)`，交給下一個服務。
    async fn enhance(&self, hit: &SearchHit, post_id: &str) -> Result<Option<EnhancedDetail>>;
}

/// 從結果的文字欄位擷取貼文 id
#[derive(Debug, Clone)]
pub struct IdExtractor {
    patterns: Vec<Regex>,
}

impl IdExtractor {
    pub fn new(patterns: &[String]) -> Result<Self, SearchError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| SearchError::Config(format!("id_patterns 無效 ({}): {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// 第一個符合的 capture group
    pub fn extract(&self, hit: &SearchHit) -> Option<String> {
        hit.text_fields().find_map(|text| {
            self.patterns.iter().find_map(|pattern| {
                pattern
                    .captures(text)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
            })
        })
    }
}

/// 單次請求內已處理過的 (服務, 貼文 id)
#[derive(Debug, Default)]
pub struct EnhancementLedger {
    seen: HashSet<(String, String)>,
}

impl EnhancementLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 標記為已處理；已經標記過時回傳 false
    pub fn mark(&mut self, enhancer: &str, post_id: &str) -> bool {
        self.seen.insert((enhancer.to_string(), post_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

struct ChainEntry {
    enhancer: Arc<dyn Enhancer>,
    extractor: IdExtractor,
}

/// 依設定順序排列的補充資訊服務
#[derive(Default)]
pub struct EnhancerChain {
    entries: Vec<ChainEntry>,
}

impl EnhancerChain {
    /// 設定檔決定順序與是否啟用；設定中有但沒有實作的名稱會被略過
    pub fn from_settings(
        settings: &[EnhancerSettings],
        available: Vec<Arc<dyn Enhancer>>,
    ) -> Result<Self, SearchError> {
        let mut entries = Vec::new();

        for setting in settings.iter().filter(|s| s.enabled) {
            let Some(enhancer) = available.iter().find(|e| e.name() == setting.name) else {
                warn!("找不到補充資訊服務: {}", setting.name);
                continue;
            };
            entries.push(ChainEntry {
                enhancer: Arc::clone(enhancer),
                extractor: IdExtractor::new(&setting.id_patterns)?,
            });
        }

        Ok(Self { entries })
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.enhancer.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 依序嘗試，第一個有結果的就停止
    ///
    /// 失敗只記錄成診斷字串，接著嘗試下一個服務。
    pub async fn enhance(
        &self,
        hit: &SearchHit,
        ledger: &mut EnhancementLedger,
        errors: &mut Vec<String>,
    ) -> Option<EnhancedDetail> {
        for entry in &self.entries {
            let name = entry.enhancer.name();
            let Some(post_id) = entry.extractor.extract(hit) else {
                continue;
            };

            // 先標記再呼叫，失敗也不會在同一次請求重試
            if !ledger.mark(name, &post_id) {
                debug!("{} #{} 已處理過，略過", name, post_id);
                continue;
            }

            match entry.enhancer.enhance(hit, &post_id).await {
                Ok(Some(detail)) => {
                    debug!("✨ {} #{} 取得補充資訊", name, post_id);
                    return Some(detail);
                }
                Ok(None) => debug!("{} #{} 沒有補充資訊", name, post_id),
                Err(e) => {
                    warn!("{} #{} 查詢失敗: {:#}", name, post_id, e);
                    errors.push(logging::diagnostic(name, &format!("{:#}", e)));
                }
            }
        }

        None
    }
}
