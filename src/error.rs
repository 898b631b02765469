use thiserror::Error;

/// 搜尋流程的錯誤分類
///
/// 需要 `Clone`：同一次瀏覽器啟動的失敗會同時回給所有等待中的呼叫者。
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SearchError {
    /// 單一搜尋服務失敗（可恢復，只記錄不中斷整個請求）
    #[error("{provider}: {message}")]
    ProviderFailure { provider: String, message: String },

    /// 瀏覽器不存在、啟動逾時或崩潰
    #[error("瀏覽器啟動失敗: {0}")]
    ResourceLaunchFailure(String),

    /// 遇到反機器人驗證頁面
    #[error("偵測到反機器人驗證 ({url}): {hint}")]
    ChallengeDetected { url: String, hint: String },

    /// 網路或瀏覽器等待超過上限
    #[error("{operation} 逾時 ({elapsed_ms} ms)")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// 排隊中的任務在取得執行權前被取消
    #[error("排隊中的任務已取消")]
    Cancelled,

    /// 建立或操作頁面失敗
    #[error("頁面操作失敗: {0}")]
    Page(String),

    /// 設定錯誤
    #[error("設定錯誤: {0}")]
    Config(String),
}

impl SearchError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        SearchError::ProviderFailure {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        SearchError::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// 取得執行權前被取消的任務不算真正的失敗
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SearchError::Cancelled)
    }
}

pub type SearchResult<T> = Result<T, SearchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_messages() {
        let err = SearchError::provider("saucenao", "HTTP 429");
        assert_eq!(err.to_string(), "saucenao: HTTP 429");

        let err = SearchError::timeout("啟動瀏覽器", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "啟動瀏覽器 逾時 (1500 ms)");

        assert!(SearchError::Cancelled.is_cancelled());
        assert!(!SearchError::Page("x".into()).is_cancelled());
    }
}
