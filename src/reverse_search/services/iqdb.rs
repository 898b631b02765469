use super::image_part;
use crate::fetcher::HttpFetcher;
use crate::reverse_search::utils::{collapse_whitespace, normalize_url, select_attr, selector};
use crate::reverse_search::{SearchHit, SearchOptions, SearchProvider};
use anyhow::{Context, Result, anyhow};
use regex::Regex;
use reqwest::multipart::Form;
use scraper::{Html, Selector};
use std::sync::Arc;

const BASE_URL: &str = "https://iqdb.org";

pub struct IqdbProvider {
    fetcher: Arc<HttpFetcher>,
    parser: IqdbParser,
}

impl IqdbProvider {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Result<Self> {
        Ok(Self {
            fetcher,
            parser: IqdbParser::new()?,
        })
    }
}

#[async_trait::async_trait]
impl SearchProvider for IqdbProvider {
    fn name(&self) -> &str {
        "iqdb"
    }

    async fn search(&self, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        self.fetcher.throttle().await;

        let form = Form::new()
            .text("MAX_FILE_SIZE", "8388608")
            .part("file", image_part(options)?);

        let response = self
            .fetcher
            .client()
            .post(format!("{}/", BASE_URL))
            .multipart(form)
            .send()
            .await
            .context("請求失敗")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("HTTP 錯誤: {}", status));
        }

        let html = response.text().await.context("讀取回應失敗")?;
        self.parser.parse(&html)
    }
}

/// iqdb 結果頁：每個 `#pages > div` 是一個結果表格，第一個是上傳的圖片
struct IqdbParser {
    block_selector: Selector,
    row_selector: Selector,
    link_selector: Selector,
    image_selector: Selector,
    similarity: Regex,
}

impl IqdbParser {
    fn new() -> Result<Self> {
        Ok(Self {
            block_selector: selector("#pages > div")?,
            row_selector: selector("tr")?,
            link_selector: selector("td.image a")?,
            image_selector: selector("td.image img")?,
            similarity: Regex::new(r"(\d+(?:\.\d+)?)% similarity")?,
        })
    }

    fn parse(&self, html: &str) -> Result<Vec<SearchHit>> {
        let document = Html::parse_document(html);

        if !html.contains("id=\"pages\"") && !html.contains("id='pages'") {
            // 上傳失敗時 iqdb 會回傳錯誤頁
            let message = document
                .root_element()
                .text()
                .map(str::trim)
                .find(|t| !t.is_empty())
                .unwrap_or("無法辨識的回應")
                .to_string();
            return Err(anyhow!("{}", collapse_whitespace(&message)));
        }

        let mut hits = Vec::new();
        for block in document.select(&self.block_selector) {
            let text = collapse_whitespace(&block.text().collect::<String>());
            if text.contains("Your image") || text.contains("No relevant matches") {
                continue;
            }

            let Some(href) = select_attr(&block, &self.link_selector, "href") else {
                continue;
            };
            let Some(similarity) = self
                .similarity
                .captures(&text)
                .and_then(|caps| caps[1].parse::<f32>().ok())
            else {
                continue;
            };

            let mut hit = SearchHit::new(similarity, normalize_url(&href, BASE_URL));
            hit.thumbnail = select_attr(&block, &self.image_selector, "src")
                .map(|src| normalize_url(&src, BASE_URL));

            // 其餘列：來源站、尺寸與分級
            for row in block.select(&self.row_selector) {
                let line = collapse_whitespace(&row.text().collect::<String>());
                if line.is_empty() || line.contains("% similarity") || line.ends_with("match") {
                    continue;
                }
                if hit.source.is_none() {
                    hit.source = Some(line);
                } else {
                    hit.details.push(line);
                }
            }

            hits.push(hit);
        }

        Ok(hits)
    }
}
