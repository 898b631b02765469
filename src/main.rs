use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use reverse_image_aggregator::browser::{BrowserResourceManager, ChromeBackend};
use reverse_image_aggregator::config::Config;
use reverse_image_aggregator::enhance::{DanbooruEnhancer, Enhancer, YandereEnhancer};
use reverse_image_aggregator::fetcher::HttpFetcher;
use reverse_image_aggregator::file_manager::FileManager;
use reverse_image_aggregator::logging;
use reverse_image_aggregator::reverse_search::services::{
    Ascii2dProvider, IqdbProvider, SauceNaoProvider,
};
use reverse_image_aggregator::reverse_search::{
    ExecutionMode, ProviderSelection, ReportSection, SearchHit, SearchOrchestrator, SearchProvider,
    SearchTask,
};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let verbose = take_flag(&mut args, &["-v", "--verbose"]);
    logging::init(verbose);

    match args.first().map(String::as_str) {
        Some("search") => match args.get(1) {
            Some(image) => run_search(image, args.get(2).map(String::as_str)).await?,
            None => {
                println!("❌ 缺少圖片路徑");
                print_help();
            }
        },
        Some("providers") => list_providers()?,
        Some("--help") | Some("-h") | None => print_help(),
        Some(other) => {
            println!("未知命令: {}", other);
            print_help();
        }
    }

    Ok(())
}

fn take_flag(args: &mut Vec<String>, names: &[&str]) -> bool {
    let before = args.len();
    args.retain(|arg| !names.contains(&arg.as_str()));
    args.len() != before
}

/// 依設定建立所有服務
struct Services {
    providers: Vec<Arc<dyn SearchProvider>>,
    enhancers: Vec<Arc<dyn Enhancer>>,
    browser: BrowserResourceManager<ChromeBackend>,
}

fn build_services(config: &Config) -> Result<Services> {
    let fetcher = Arc::new(HttpFetcher::new(&config.http)?);
    let files = FileManager::new(&config.diagnostics)?;
    let browser = BrowserResourceManager::new(
        ChromeBackend::new(config.browser.clone()),
        config.browser.clone(),
        files.clone(),
    );

    let providers: Vec<Arc<dyn SearchProvider>> = vec![
        Arc::new(SauceNaoProvider::new(
            Arc::clone(&fetcher),
            config.provider("saucenao").api_key,
        )),
        Arc::new(IqdbProvider::new(Arc::clone(&fetcher))?),
        Arc::new(Ascii2dProvider::new(browser.clone(), files)?),
    ];

    let fetch_media = |name: &str| {
        config
            .enhancers
            .iter()
            .find(|e| e.name == name)
            .is_none_or(|e| e.fetch_media)
    };
    let enhancers: Vec<Arc<dyn Enhancer>> = vec![
        Arc::new(DanbooruEnhancer::new(Arc::clone(&fetcher), fetch_media("danbooru"))),
        Arc::new(YandereEnhancer::new(Arc::clone(&fetcher), fetch_media("yandere"))),
    ];

    Ok(Services {
        providers,
        enhancers,
        browser,
    })
}

async fn run_search(image_path: &str, selection: Option<&str>) -> Result<()> {
    println!("=== 反向圖片搜尋 ===\n");

    let config = Config::load()?;
    let image = tokio::fs::read(image_path)
        .await
        .with_context(|| format!("無法讀取圖片: {}", image_path))?;
    if image.is_empty() {
        bail!("圖片是空的: {}", image_path);
    }

    let services = build_services(&config)?;
    let browser = services.browser.clone();
    let orchestrator = SearchOrchestrator::new(config, services.providers, services.enhancers)?;

    let mode = match selection {
        Some(input) => ExecutionMode::Direct(ProviderSelection::parse(input)),
        None => orchestrator.default_mode(),
    };

    println!("⚙️  設定：");
    println!("  - 服務: {}", orchestrator.provider_names().join(", "));
    println!("  - 模式: {:?}", mode);
    println!("  - 瀏覽器並發數: {}\n", orchestrator.gate().capacity());

    browser
        .run_session(search_and_print(&orchestrator, image, image_path, mode))
        .await
}

async fn search_and_print(
    orchestrator: &SearchOrchestrator,
    image: Vec<u8>,
    image_path: &str,
    mode: ExecutionMode,
) -> Result<()> {
    // Ctrl+C 只會取消還在排隊的瀏覽器任務
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n⚠️  已取消排隊中的任務");
                cancel.cancel();
            }
        });
    }

    let file_name = Path::new(image_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let task = SearchTask::new(image, file_name)
        .with_max_results(orchestrator.config().search.max_results)
        .with_cancel(cancel);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner} {msg} [{elapsed}]")?);
    spinner.set_message("🔍 搜尋中...");
    spinner.enable_steady_tick(Duration::from_millis(120));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = async {
        let mut count = 0;
        while let Some(section) = rx.recv().await {
            spinner.suspend(|| print_section(&section));
            count += 1;
        }
        count
    };
    let ((), sections) = tokio::join!(orchestrator.run_streaming(&task, mode, tx), printer);
    spinner.finish_and_clear();

    println!("\n✨ 搜尋完成！({} 個區塊, id: {})", sections, task.correlation_id);
    Ok(())
}

fn list_providers() -> Result<()> {
    let config = Config::load()?;

    println!("搜尋服務:");
    for name in ["saucenao", "iqdb", "ascii2d"] {
        let settings = config.provider(name);
        let mut notes = vec![format!("門檻 {:.0}%", config.effective_threshold(name))];
        if !settings.enabled {
            notes.push("停用".to_string());
        }
        if settings.always_attach {
            notes.push("固定附加".to_string());
        }
        println!("  {:<10} {}", name, notes.join(", "));
    }

    println!("\n補充資訊:");
    for enhancer in &config.enhancers {
        let state = if enhancer.enabled { "" } else { " (停用)" };
        println!("  {}{}", enhancer.name, state);
    }

    Ok(())
}

fn print_section(section: &ReportSection) {
    match section {
        ReportSection::HighConfidence {
            provider,
            hit,
            enhancement,
        } => {
            println!("✅ [{}] {:.1}%", provider, hit.similarity);
            print_hit(hit, "   ");
            if let Some(detail) = enhancement {
                for line in &detail.details {
                    println!("   ✨ {}", line);
                }
                if let Some(media) = &detail.media {
                    println!("   🖼️  {} bytes", media.len());
                }
            }
        }
        ReportSection::LowConfidence { groups } => {
            println!("🤔 沒有達到門檻的結果，以下是最接近的：");
            for group in groups {
                println!("  [{}]", group.provider);
                for hit in &group.hits {
                    println!("    {:.1}%", hit.similarity);
                    print_hit(hit, "    ");
                }
            }
        }
        ReportSection::Supplementary { output } => {
            println!("📎 [{}]", output.provider);
            for hit in &output.hits {
                print_hit(hit, "   ");
            }
        }
        ReportSection::NoResults { errors } => {
            println!("❌ 沒有找到結果");
            print_errors(errors);
        }
        ReportSection::Errors { errors } => {
            println!("⚠️  部分服務失敗");
            print_errors(errors);
        }
    }
}

fn print_hit(hit: &SearchHit, indent: &str) {
    println!("{}{}", indent, hit.url);
    if let Some(source) = &hit.source {
        println!("{}來源: {}", indent, source);
    }
    if let Some(author) = &hit.author {
        println!("{}作者: {}", indent, author);
    }
    for line in &hit.details {
        println!("{}{}", indent, logging::truncate_text(line, 80));
    }
}

fn print_errors(errors: &[String]) {
    for error in errors {
        println!("   - {}", error);
    }
}

fn print_help() {
    println!("Image Search - 反向圖片搜尋聚合器\n");
    println!("用法:");
    println!("  image-search search <圖片> [all|服務1,服務2]  # 搜尋圖片");
    println!("  image-search providers                      # 列出服務與設定");
    println!("  image-search --help                         # 顯示此幫助\n");
    println!("選項:");
    println!("  -v, --verbose    顯示 debug 日誌\n");
    println!("沒有指定服務時使用設定檔的模式 (sequential / parallel)；");
    println!("指定服務時全部並行，每個服務的高信心結果各輸出一筆。\n");
    println!("設定檔:");
    println!("  ./config.toml 或環境變數 IMAGE_SEARCH_CONFIG 指定的路徑");
}
