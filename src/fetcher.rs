use crate::config::HttpSettings;
use anyhow::{Context, Result};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// HTTP Fetcher trait - 抽象介面
pub trait Fetcher {
    async fn fetch_page(&self, url: &str) -> Result<String>;

    /// 下載二進位內容，回傳 (資料, Content-Type)
    async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>)>;
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// HTTP 實作（帶重試與可選的限流）
pub struct HttpFetcher {
    client: Client,
    max_retries: u32,
    limiter: Option<DirectLimiter>,
}

impl HttpFetcher {
    /// 建立新的 HTTP Fetcher
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .build()
            .context("無法建立 HTTP 客戶端")?;

        let limiter = settings
            .requests_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            max_retries: settings.max_retries,
            limiter,
        })
    }

    /// 給需要自訂請求（例如 multipart 上傳）的服務使用
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// 等待限流許可
    pub async fn throttle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.fetch_page(url).await?;
        serde_json::from_str(&body).with_context(|| format!("JSON 解析失敗: {}", url))
    }

    /// 帶重試的請求
    async fn fetch_with_retry(&self, url: &str) -> Result<reqwest::Response> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
                debug!("重試 {} - {}", attempt, url);
            }

            self.throttle().await;

            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    last_error = Some(anyhow::anyhow!("HTTP 錯誤: {}", response.status()));
                }
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("請求失敗: {}", e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("未知錯誤")))
    }
}

/// 重試前等待（指數退避，最多 30 秒）
fn backoff_delay(attempt: u32) -> Duration {
    let millis = 500u64.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(millis).min(MAX_BACKOFF)
}

impl Fetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String> {
        let response = self.fetch_with_retry(url).await?;
        response.text().await.context("讀取回應失敗")
    }

    async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let response = self.fetch_with_retry(url).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = response.bytes().await.context("讀取回應失敗")?;
        Ok((bytes.to_vec(), content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_with_rate_limit() {
        let settings = HttpSettings {
            requests_per_minute: Some(6),
            ..Default::default()
        };
        let fetcher = HttpFetcher::new(&settings).unwrap();
        assert!(fetcher.limiter.is_some());

        // 0 視為不限流
        let settings = HttpSettings {
            requests_per_minute: Some(0),
            ..Default::default()
        };
        let fetcher = HttpFetcher::new(&settings).unwrap();
        assert!(fetcher.limiter.is_none());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(4), Duration::from_millis(4000));
        // 很大的重試次數不會溢位
        assert_eq!(backoff_delay(65), MAX_BACKOFF);
        assert_eq!(backoff_delay(u32::MAX), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_throttle_without_limiter_returns_immediately() {
        let fetcher = HttpFetcher::new(&HttpSettings::default()).unwrap();
        tokio::time::timeout(Duration::from_millis(50), fetcher.throttle())
            .await
            .unwrap();
    }
}
