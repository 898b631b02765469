use super::Enhancer;
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::reverse_search::{EnhancedDetail, SearchHit};
use anyhow::Result;
use chrono::DateTime;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const BASE_URL: &str = "https://yande.re";

pub struct YandereEnhancer {
    fetcher: Arc<HttpFetcher>,
    fetch_media: bool,
}

#[derive(Debug, Deserialize)]
struct Post {
    #[serde(default)]
    tags: String,
    rating: Option<String>,
    source: Option<String>,
    author: Option<String>,
    created_at: Option<i64>,
    sample_url: Option<String>,
}

impl YandereEnhancer {
    pub fn new(fetcher: Arc<HttpFetcher>, fetch_media: bool) -> Self {
        Self {
            fetcher,
            fetch_media,
        }
    }
}

#[async_trait::async_trait]
impl Enhancer for YandereEnhancer {
    fn name(&self) -> &str {
        "yandere"
    }

    async fn enhance(&self, _hit: &SearchHit, post_id: &str) -> Result<Option<EnhancedDetail>> {
        let url = format!(
            "{}/post.json?tags={}",
            BASE_URL,
            urlencoding::encode(&format!("id:{}", post_id))
        );
        let posts: Vec<Post> = self.fetcher.fetch_json(&url).await?;

        // 貼文被刪除時回傳空陣列
        let Some(post) = posts.into_iter().next() else {
            return Ok(None);
        };

        let mut detail = EnhancedDetail {
            details: post_details(post_id, &post),
            media: None,
            media_type: None,
        };

        if self.fetch_media {
            if let Some(sample_url) = &post.sample_url {
                match self.fetcher.fetch_bytes(sample_url).await {
                    Ok((bytes, content_type)) => {
                        detail.media = Some(bytes);
                        detail.media_type = content_type;
                    }
                    Err(e) => debug!("yande.re #{} 預覽圖下載失敗: {:#}", post_id, e),
                }
            }
        }

        Ok(Some(detail))
    }
}

fn post_details(post_id: &str, post: &Post) -> Vec<String> {
    let mut lines = vec![format!("yande.re #{}", post_id)];

    if !post.tags.trim().is_empty() {
        lines.push(format!(
            "標籤: {}",
            post.tags.split_whitespace().collect::<Vec<_>>().join(", ")
        ));
    }
    if let Some(rating) = &post.rating {
        lines.push(format!("分級: {}", rating));
    }
    if let Some(author) = &post.author {
        lines.push(format!("上傳者: {}", author));
    }
    if let Some(source) = post.source.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("來源: {}", source));
    }
    if let Some(time) = post.created_at.and_then(|ts| DateTime::from_timestamp(ts, 0)) {
        lines.push(format!("時間: {}", time.format("%Y-%m-%d %H:%M")));
    }

    lines
}
