use super::Enhancer;
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::reverse_search::{EnhancedDetail, SearchHit};
use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const BASE_URL: &str = "https://danbooru.donmai.us";

pub struct DanbooruEnhancer {
    fetcher: Arc<HttpFetcher>,
    fetch_media: bool,
}

#[derive(Debug, Deserialize)]
struct Post {
    #[serde(default)]
    tag_string_artist: String,
    #[serde(default)]
    tag_string_character: String,
    #[serde(default)]
    tag_string_copyright: String,
    #[serde(default)]
    tag_string_general: String,
    rating: Option<String>,
    source: Option<String>,
    created_at: Option<String>,
    large_file_url: Option<String>,
    file_url: Option<String>,
}

impl DanbooruEnhancer {
    pub fn new(fetcher: Arc<HttpFetcher>, fetch_media: bool) -> Self {
        Self {
            fetcher,
            fetch_media,
        }
    }
}

#[async_trait::async_trait]
impl Enhancer for DanbooruEnhancer {
    fn name(&self) -> &str {
        "danbooru"
    }

    async fn enhance(&self, _hit: &SearchHit, post_id: &str) -> Result<Option<EnhancedDetail>> {
        let url = format!("{}/posts/{}.json", BASE_URL, post_id);
        let post: Post = self.fetcher.fetch_json(&url).await?;

        let mut detail = EnhancedDetail {
            details: post_details(post_id, &post),
            media: None,
            media_type: None,
        };

        if self.fetch_media {
            if let Some(media_url) = post.large_file_url.as_deref().or(post.file_url.as_deref()) {
                match self.fetcher.fetch_bytes(media_url).await {
                    Ok((bytes, content_type)) => {
                        detail.media = Some(bytes);
                        detail.media_type = content_type;
                    }
                    // 原圖只是附加內容，下載失敗不影響標籤
                    Err(e) => debug!("danbooru #{} 原圖下載失敗: {:#}", post_id, e),
                }
            }
        }

        Ok(Some(detail))
    }
}

fn post_details(post_id: &str, post: &Post) -> Vec<String> {
    let mut lines = vec![format!("Danbooru #{}", post_id)];

    let tag_lines = [
        ("作者", &post.tag_string_artist),
        ("角色", &post.tag_string_character),
        ("作品", &post.tag_string_copyright),
        ("標籤", &post.tag_string_general),
    ];
    for (label, tags) in tag_lines {
        if !tags.trim().is_empty() {
            lines.push(format!("{}: {}", label, tags.split_whitespace().collect::<Vec<_>>().join(", ")));
        }
    }

    if let Some(rating) = &post.rating {
        lines.push(format!("分級: {}", rating));
    }
    if let Some(source) = post.source.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("來源: {}", source));
    }
    if let Some(created_at) = &post.created_at {
        lines.push(format!("時間: {}", created_at));
    }

    lines
}
