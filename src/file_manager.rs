use crate::config::DiagnosticsSettings;
use anyhow::{Context, Result};
use chrono::Local;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 檔案操作管理器：錯誤快照與上傳暫存檔
#[derive(Debug, Clone)]
pub struct FileManager {
    /// 錯誤快照目錄
    log_dir: PathBuf,
    /// 暫存檔目錄
    temp_dir: PathBuf,
}

/// 一次錯誤快照寫出的檔案
#[derive(Debug, Clone)]
pub struct SnapshotFiles {
    pub screenshot: Option<PathBuf>,
    pub html: Option<PathBuf>,
}

impl FileManager {
    /// 建立新的檔案管理器
    pub fn new(settings: &DiagnosticsSettings) -> Result<Self> {
        // 建立必要的目錄
        fs::create_dir_all(&settings.log_dir)
            .with_context(|| format!("無法建立 log 目錄: {}", settings.log_dir.display()))?;
        fs::create_dir_all(&settings.temp_dir)
            .with_context(|| format!("無法建立暫存目錄: {}", settings.temp_dir.display()))?;

        Ok(Self {
            log_dir: settings.log_dir.clone(),
            temp_dir: settings.temp_dir.clone(),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// 儲存錯誤快照，檔名 = 標籤 + 時間戳記
    pub async fn save_snapshot(
        &self,
        label: &str,
        screenshot: Option<&[u8]>,
        html: Option<&str>,
    ) -> Result<SnapshotFiles> {
        let stem = format!(
            "{}_{}",
            sanitize_filename(label),
            Local::now().format("%Y%m%d_%H%M%S_%3f")
        );

        let mut files = SnapshotFiles {
            screenshot: None,
            html: None,
        };

        if let Some(png) = screenshot {
            let path = self.log_dir.join(format!("{}.png", stem));
            tokio::fs::write(&path, png)
                .await
                .context("無法寫入截圖")?;
            files.screenshot = Some(path);
        }

        if let Some(html) = html {
            let path = self.log_dir.join(format!("{}.html", stem));
            tokio::fs::write(&path, html)
                .await
                .context("無法寫入 HTML")?;
            files.html = Some(path);
        }

        Ok(files)
    }

    /// 把圖片寫到暫存檔，回傳的 guard 被 drop 時自動刪除
    pub async fn write_temp_upload(&self, data: &[u8]) -> Result<TempUpload> {
        // 計算 hash
        let mut hasher = Sha256::new();
        hasher.update(data);
        let hash = format!("{:x}", hasher.finalize());

        let filename = format!(
            "upload_{}_{}.{}",
            &hash[..12],
            uuid::Uuid::new_v4().simple(),
            guess_extension(data)
        );
        let path = self.temp_dir.join(filename);

        tokio::fs::write(&path, data)
            .await
            .context("無法寫入上傳暫存檔")?;
        debug!("已建立暫存檔: {}", path.display());

        Ok(TempUpload { path })
    }
}

/// 上傳暫存檔（RAII），不論成功或失敗都會被清除
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("刪除暫存檔失敗 ({}): {}", self.path.display(), e);
            }
        } else {
            debug!("已刪除暫存檔: {}", self.path.display());
        }
    }
}

/// 依檔頭判斷副檔名
pub fn guess_extension(data: &[u8]) -> &'static str {
    match data {
        [0x89, b'P', b'N', b'G', ..] => "png",
        [0xFF, 0xD8, 0xFF, ..] => "jpg",
        [b'G', b'I', b'F', b'8', ..] => "gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "webp",
        _ => "jpg",
    }
}

/// 依副檔名回傳 MIME type
pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

/// 清理檔名
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            c => c,
        })
        .take(50)
        .collect()
}
