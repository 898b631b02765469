pub mod ascii2d;
pub mod iqdb;
pub mod saucenao;

pub use ascii2d::Ascii2dProvider;
pub use iqdb::IqdbProvider;
pub use saucenao::SauceNaoProvider;

use crate::file_manager::{guess_extension, mime_for_extension};
use crate::reverse_search::SearchOptions;
use anyhow::Result;
use reqwest::multipart::Part;

/// 上傳用的 multipart 檔案欄位
pub(crate) fn image_part(options: &SearchOptions) -> Result<Part> {
    let ext = guess_extension(&options.image);
    let file_name = if options.file_name.is_empty() {
        format!("image.{}", ext)
    } else {
        options.file_name.clone()
    };

    Ok(Part::bytes(options.image.to_vec())
        .file_name(file_name)
        .mime_str(mime_for_extension(ext))?)
}
