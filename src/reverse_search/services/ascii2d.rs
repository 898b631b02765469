use crate::browser::{BrowserResourceManager, ChromeBackend, ChromePage};
use crate::file_manager::FileManager;
use crate::reverse_search::utils::{normalize_url, select_attr, select_text, selector};
use crate::reverse_search::{SearchHit, SearchOptions, SearchProvider};
use anyhow::Result;
use scraper::{Html, Selector};
use std::path::Path;
use tracing::{debug, info};

const BASE_URL: &str = "https://ascii2d.net";
const FILE_INPUT: &str = "form[action='/search/file'] input[type=file]";
const SUBMIT_BUTTON: &str = "form[action='/search/file'] button[type=submit]";

/// ascii2d 色合檢索（需要瀏覽器才能通過防護）
///
/// 結果沒有相似度，適合設成固定附加的服務。
pub struct Ascii2dProvider {
    browser: BrowserResourceManager<ChromeBackend>,
    files: FileManager,
    parser: Ascii2dParser,
}

impl Ascii2dProvider {
    pub fn new(browser: BrowserResourceManager<ChromeBackend>, files: FileManager) -> Result<Self> {
        Ok(Self {
            browser,
            files,
            parser: Ascii2dParser::new()?,
        })
    }

    async fn upload_and_collect(&self, page: &ChromePage, image: &Path) -> Result<String> {
        page.goto(BASE_URL).await?;
        self.browser.check_for_challenge(page).await?;

        page.set_input_files(FILE_INPUT, &[image]).await?;
        page.click_and_wait(SUBMIT_BUTTON).await?;
        self.browser.check_for_challenge(page).await?;

        page.content().await
    }
}

#[async_trait::async_trait]
impl SearchProvider for Ascii2dProvider {
    fn name(&self) -> &str {
        "ascii2d"
    }

    fn requires_gated_resource(&self) -> bool {
        true
    }

    async fn search(&self, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        // 暫存檔在離開時刪除，不論成功或失敗
        let upload = self.files.write_temp_upload(&options.image).await?;
        let lease = self.browser.get_page().await?;

        let result = self.upload_and_collect(lease.page(), upload.path()).await;
        if result.is_err() {
            self.browser.save_error_snapshot(lease.page(), "ascii2d").await;
        }
        lease.close().await;

        let html = result?;
        let hits = self.parser.parse(&html, options.max_results);
        info!("ascii2d 找到 {} 筆", hits.len());
        Ok(hits)
    }
}

/// 結果頁：每個 `.item-box` 是一筆，第一筆是上傳的圖片本身
struct Ascii2dParser {
    item_selector: Selector,
    thumbnail_selector: Selector,
    link_selector: Selector,
    site_selector: Selector,
    info_selector: Selector,
}

impl Ascii2dParser {
    fn new() -> Result<Self> {
        Ok(Self {
            item_selector: selector(".item-box")?,
            thumbnail_selector: selector(".image-box img")?,
            link_selector: selector(".detail-box h6 a")?,
            site_selector: selector(".detail-box h6 small")?,
            info_selector: selector(".info-box small")?,
        })
    }

    fn parse(&self, html: &str, max_results: usize) -> Vec<SearchHit> {
        let document = Html::parse_document(html);
        let mut hits = Vec::new();

        for item in document.select(&self.item_selector).skip(1) {
            let links = item
                .select(&self.link_selector)
                .filter_map(|a| {
                    let href = a.value().attr("href")?;
                    let text = a.text().collect::<String>().trim().to_string();
                    Some((normalize_url(href, BASE_URL), text))
                })
                .collect::<Vec<_>>();

            // 沒有外部連結的結果（只有 hash）略過
            let Some((url, title)) = links.first().cloned() else {
                continue;
            };

            let mut hit = SearchHit::new(0.0, url);
            hit.thumbnail = select_attr(&item, &self.thumbnail_selector, "src")
                .map(|src| normalize_url(&src, BASE_URL));
            hit.source = select_text(&item, &self.site_selector);
            hit.author = links.get(1).map(|(_, name)| name.clone()).filter(|n| !n.is_empty());
            if !title.is_empty() {
                hit.details.push(title);
            }
            if let Some(info) = select_text(&item, &self.info_selector) {
                hit.details.push(info);
            }

            hits.push(hit);
            if hits.len() >= max_results.max(1) {
                break;
            }
        }

        debug!("ascii2d 解析出 {} 筆", hits.len());
        hits
    }
}
