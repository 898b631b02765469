use super::types::{SearchHit, SearchOptions};
use anyhow::Result;

/// 反向搜尋服務 Trait
#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    /// 服務名稱（對應設定檔的 `providers.<name>`）
    fn name(&self) -> &str;

    /// 是否需要瀏覽器（會經過並發閘門）
    fn requires_gated_resource(&self) -> bool {
        false
    }

    /// 搜尋單張圖片，結果不需要依相似度排序
    async fn search(&self, options: &SearchOptions) -> Result<Vec<SearchHit>>;
}
