use super::image_part;
use crate::fetcher::HttpFetcher;
use crate::reverse_search::{SearchHit, SearchOptions, SearchProvider};
use anyhow::{Context, Result, anyhow};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::multipart::Form;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const API_URL: &str = "https://saucenao.com/search.php";

/// 免費方案約每 30 秒 6 次
const MIN_INTERVAL: Duration = Duration::from_secs(5);

pub struct SauceNaoProvider {
    fetcher: Arc<HttpFetcher>,
    api_key: Option<String>,
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

#[derive(Debug, Deserialize)]
struct Response {
    header: ResponseHeader,
    #[serde(default)]
    results: Vec<ResultEntry>,
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    status: i32,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultEntry {
    header: EntryHeader,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct EntryHeader {
    similarity: String,
    thumbnail: Option<String>,
    index_name: Option<String>,
}

impl SauceNaoProvider {
    pub fn new(fetcher: Arc<HttpFetcher>, api_key: Option<String>) -> Self {
        Self {
            fetcher,
            api_key,
            limiter: Quota::with_period(MIN_INTERVAL).map(RateLimiter::direct),
        }
    }
}

#[async_trait::async_trait]
impl SearchProvider for SauceNaoProvider {
    fn name(&self) -> &str {
        "saucenao"
    }

    async fn search(&self, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let mut query = vec![
            ("output_type", "2".to_string()),
            ("db", "999".to_string()),
            ("numres", options.max_results.max(1).to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("api_key", key.clone()));
        }

        let form = Form::new().part("file", image_part(options)?);
        let response = self
            .fetcher
            .client()
            .post(API_URL)
            .query(&query)
            .multipart(form)
            .send()
            .await
            .context("請求失敗")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("HTTP 錯誤: {}", status));
        }

        let body = response.text().await.context("讀取回應失敗")?;
        parse_response(&body)
    }
}

fn parse_response(body: &str) -> Result<Vec<SearchHit>> {
    let response: Response = serde_json::from_str(body).context("JSON 解析失敗")?;

    // status > 0 是伺服器端錯誤，< 0 是請求錯誤（例如超過額度）
    if response.header.status != 0 {
        return Err(anyhow!(
            "API 錯誤 ({}): {}",
            response.header.status,
            response.header.message.as_deref().unwrap_or("未知錯誤")
        ));
    }

    let hits = response
        .results
        .into_iter()
        .filter_map(|entry| {
            let similarity = entry.header.similarity.trim().parse::<f32>().ok()?;
            let url = first_ext_url(&entry.data)?;

            let mut hit = SearchHit::new(similarity, url);
            hit.thumbnail = entry.header.thumbnail;
            hit.source = string_field(&entry.data, &["source"]);
            hit.author = string_field(
                &entry.data,
                &["member_name", "creator", "author_name", "twitter_user_handle"],
            );
            hit.time = string_field(&entry.data, &["created_at"]);
            if let Some(title) = string_field(&entry.data, &["title", "material"]) {
                hit.details.push(title);
            }
            if let Some(index) = entry.header.index_name {
                hit.details.push(index);
            }
            // 其餘連結（例如 danbooru / yande.re 鏡像）留給補充資訊使用
            hit.details.extend(ext_urls(&entry.data).into_iter().skip(1));
            Some(hit)
        })
        .collect::<Vec<_>>();

    debug!("saucenao 回傳 {} 筆", hits.len());
    Ok(hits)
}

fn ext_urls(data: &Value) -> Vec<String> {
    data.get("ext_urls")
        .and_then(Value::as_array)
        .map(|urls| {
            urls.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn first_ext_url(data: &Value) -> Option<String> {
    ext_urls(data)
        .into_iter()
        .next()
        .or_else(|| string_field(data, &["source"]).filter(|s| s.starts_with("http")))
}

/// 不同資料庫的欄位名稱不一致，依序取第一個有值的欄位
fn string_field(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match data.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => {
            let joined = items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "header": {"status": 0},
            "results": [
                {
                    "header": {"similarity": "93.12", "thumbnail": "https://img3.saucenao.com/t.jpg", "index_name": "Index #9: Danbooru"},
                    "data": {
                        "ext_urls": ["https://danbooru.donmai.us/post/show/42", "https://yande.re/post/show/7"],
                        "creator": ["artist_a", "artist_b"],
                        "material": "original",
                        "source": "https://twitter.com/x/status/1"
                    }
                },
                {
                    "header": {"similarity": "51.0", "thumbnail": null},
                    "data": {"ext_urls": ["https://www.pixiv.net/artworks/99"], "member_name": "someone", "title": "タイトル"}
                },
                {
                    "header": {"similarity": "40.0"},
                    "data": {}
                }
            ]
        }"#;

        let hits = parse_response(body).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].similarity, 93.12);
        assert_eq!(hits[0].url, "https://danbooru.donmai.us/post/show/42");
        assert_eq!(hits[0].author.as_deref(), Some("artist_a, artist_b"));
        assert!(hits[0].details.contains(&"https://yande.re/post/show/7".to_string()));
        assert_eq!(hits[1].author.as_deref(), Some("someone"));
        assert_eq!(hits[1].details[0], "タイトル");
    }

    #[test]
    fn test_api_error_status() {
        let body = r#"{"header": {"status": -2, "message": "Search Rate Too High."}}"#;
        let err = parse_response(body).unwrap_err();
        assert!(err.to_string().contains("Search Rate Too High"));
    }
}
