use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 一次搜尋請求
#[derive(Debug, Clone)]
pub struct SearchTask {
    pub image: Arc<[u8]>,
    pub file_name: String,
    /// 每個服務的低信心結果上限（服務沒有自訂上限時使用）
    pub max_results: usize,
    pub correlation_id: Uuid,
    /// 取消訊號：只影響還在閘門排隊的瀏覽器任務
    pub cancel: Option<CancellationToken>,
}

impl SearchTask {
    pub fn new(image: impl Into<Arc<[u8]>>, file_name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            file_name: file_name.into(),
            max_results: 3,
            correlation_id: Uuid::new_v4(),
            cancel: None,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// 傳給搜尋服務的參數
    pub fn options(&self) -> SearchOptions {
        SearchOptions {
            image: Arc::clone(&self.image),
            file_name: self.file_name.clone(),
            max_results: self.max_results,
        }
    }
}

/// 搜尋服務收到的參數
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub image: Arc<[u8]>,
    pub file_name: String,
    pub max_results: usize,
}

/// 單筆搜尋結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// 相似度 0-100
    pub similarity: f32,
    pub url: String,
    pub thumbnail: Option<String>,
    pub source: Option<String>,
    pub author: Option<String>,
    pub time: Option<String>,
    #[serde(default)]
    pub details: Vec<String>,
}

impl SearchHit {
    pub fn new(similarity: f32, url: impl Into<String>) -> Self {
        Self {
            similarity,
            url: url.into(),
            thumbnail: None,
            source: None,
            author: None,
            time: None,
            details: Vec::new(),
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_detail(mut self, line: impl Into<String>) -> Self {
        self.details.push(line.into());
        self
    }

    /// 用來擷取貼文 id 的文字欄位
    pub fn text_fields(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str())
            .chain(self.source.as_deref())
            .chain(self.details.iter().map(String::as_str))
    }
}

/// 補充資訊（標籤、原圖等）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnhancedDetail {
    pub details: Vec<String>,
    pub media: Option<Vec<u8>>,
    pub media_type: Option<String>,
}

/// 單一服務的輸出
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutput {
    pub provider: String,
    pub hits: Vec<SearchHit>,
    pub error: Option<String>,
}

impl SearchOutput {
    pub fn hits(provider: impl Into<String>, hits: Vec<SearchHit>) -> Self {
        Self {
            provider: provider.into(),
            hits,
            error: None,
        }
    }

    pub fn failed(provider: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            hits: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// 要搜尋的服務（直接模式）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSelection {
    All,
    Only(Vec<String>),
}

impl ProviderSelection {
    /// `all` 或以逗號分隔的服務名稱
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() || input.eq_ignore_ascii_case("all") {
            return ProviderSelection::All;
        }
        ProviderSelection::Only(
            input
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    pub fn includes(&self, name: &str) -> bool {
        match self {
            ProviderSelection::All => true,
            ProviderSelection::Only(names) => names.iter().any(|n| n == name),
        }
    }
}

/// 回應中的一個區塊，依決定順序輸出
#[derive(Debug, Clone, PartialEq)]
pub enum ReportSection {
    /// 達到門檻的代表結果（可能附帶補充資訊）
    HighConfidence {
        provider: String,
        hit: SearchHit,
        enhancement: Option<EnhancedDetail>,
    },
    /// 沒有任何高信心結果時，依服務分組的低信心結果
    LowConfidence { groups: Vec<SearchOutput> },
    /// 固定附加的服務結果，不參與信心分組
    Supplementary { output: SearchOutput },
    /// 完全沒有結果
    NoResults { errors: Vec<String> },
    /// 有結果但部分服務失敗
    Errors { errors: Vec<String> },
}

impl ReportSection {
    /// 是否為實際內容（不是錯誤或無結果訊息）
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            ReportSection::HighConfidence { .. }
                | ReportSection::LowConfidence { .. }
                | ReportSection::Supplementary { .. }
        )
    }
}

/// 一次請求的完整回應
#[derive(Debug, Clone)]
pub struct SearchReport {
    pub correlation_id: Uuid,
    pub sections: Vec<ReportSection>,
}

impl SearchReport {
    pub fn high_confidence(&self) -> impl Iterator<Item = (&str, &SearchHit)> {
        self.sections.iter().filter_map(|section| match section {
            ReportSection::HighConfidence { provider, hit, .. } => Some((provider.as_str(), hit)),
            _ => None,
        })
    }

    pub fn low_confidence(&self) -> Option<&[SearchOutput]> {
        self.sections.iter().find_map(|section| match section {
            ReportSection::LowConfidence { groups } => Some(groups.as_slice()),
            _ => None,
        })
    }

    pub fn supplementary(&self) -> impl Iterator<Item = &SearchOutput> {
        self.sections.iter().filter_map(|section| match section {
            ReportSection::Supplementary { output } => Some(output),
            _ => None,
        })
    }

    /// 收集到的錯誤（無結果或部分失敗）
    pub fn errors(&self) -> &[String] {
        self.sections
            .iter()
            .find_map(|section| match section {
                ReportSection::NoResults { errors } | ReportSection::Errors { errors } => {
                    Some(errors.as_slice())
                }
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn has_results(&self) -> bool {
        self.sections.iter().any(ReportSection::is_content)
    }
}
