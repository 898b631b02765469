/// 日誌工具模組
///
/// 初始化 tracing，並提供診斷字串的格式化工具
use tracing_subscriber::EnvFilter;

/// 診斷字串的長度上限
pub const DIAGNOSTIC_MAX_LEN: usize = 160;

/// 初始化全域 subscriber
///
/// `RUST_LOG` 有設定時優先使用，否則依 `verbose` 決定 info / debug。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // 重複初始化（例如測試中）直接忽略
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 截斷長文本用於日誌與錯誤顯示
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

/// 把錯誤轉成簡短的單行診斷字串：`<服務>: <第一行訊息>`
pub fn diagnostic(source: &str, error: &str) -> String {
    let first_line = error.lines().next().unwrap_or("").trim();
    let message = if first_line.is_empty() {
        "未知錯誤"
    } else {
        first_line
    };
    format!("{}: {}", source, truncate_text(message, DIAGNOSTIC_MAX_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("abc", 5), "abc");
        assert_eq!(truncate_text("反向圖片搜尋", 4), "反向圖片...");
    }

    #[test]
    fn test_diagnostic_keeps_first_line() {
        let d = diagnostic("iqdb", "HTTP 錯誤: 503\n  caused by: upstream");
        assert_eq!(d, "iqdb: HTTP 錯誤: 503");

        let d = diagnostic("iqdb", "");
        assert_eq!(d, "iqdb: 未知錯誤");
    }
}
