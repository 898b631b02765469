use super::confidence::{self, partition, representatives};
use super::trait_def::SearchProvider;
use super::types::{
    ProviderSelection, ReportSection, SearchHit, SearchOptions, SearchOutput, SearchReport, SearchTask,
};
use crate::config::{Config, ParallelPolicy, SearchMode};
use crate::enhance::{EnhancementLedger, Enhancer, EnhancerChain};
use crate::error::SearchError;
use crate::gate::ConcurrencyGate;
use crate::logging;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// 執行模式
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionMode {
    /// 指定的服務全部並行，高信心結果各輸出一筆代表
    Direct(ProviderSelection),
    /// 依序嘗試，第一個達到門檻的就停止
    Sequential,
    /// 全部並行，依完成順序決定輸出
    Parallel(ParallelPolicy),
}

/// 搜尋協調器：一次請求跑多個搜尋服務，合併結果與錯誤
pub struct SearchOrchestrator {
    config: Arc<Config>,
    /// 宣告順序
    providers: Vec<Arc<dyn SearchProvider>>,
    enhancers: EnhancerChain,
    gate: ConcurrencyGate,
}

/// 單次請求的狀態
struct RequestState {
    sink: mpsc::UnboundedSender<ReportSection>,
    ledger: EnhancementLedger,
    errors: Vec<String>,
    emitted_content: bool,
    max_results: usize,
}

impl RequestState {
    fn new(sink: mpsc::UnboundedSender<ReportSection>, max_results: usize) -> Self {
        Self {
            sink,
            ledger: EnhancementLedger::new(),
            errors: Vec::new(),
            emitted_content: false,
            max_results,
        }
    }

    fn emit(&mut self, section: ReportSection) {
        if section.is_content() {
            self.emitted_content = true;
        }
        if self.sink.send(section).is_err() {
            debug!("接收端已關閉，捨棄輸出");
        }
    }

    fn record(&mut self, output: &SearchOutput) {
        if let Some(error) = &output.error {
            self.errors.push(error.clone());
        }
    }
}

impl SearchOrchestrator {
    pub fn new(
        config: Config,
        providers: Vec<Arc<dyn SearchProvider>>,
        enhancers: Vec<Arc<dyn Enhancer>>,
    ) -> Result<Self, SearchError> {
        config.validate()?;

        let mut names = HashSet::new();
        for provider in &providers {
            if !names.insert(provider.name().to_string()) {
                return Err(SearchError::Config(format!(
                    "重複的搜尋服務: {}",
                    provider.name()
                )));
            }
        }

        let gate = ConcurrencyGate::new(config.browser.concurrency)?;
        let enhancers = EnhancerChain::from_settings(&config.enhancers, enhancers)?;

        Ok(Self {
            config: Arc::new(config),
            providers,
            enhancers,
            gate,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// 設定檔指定的模式
    pub fn default_mode(&self) -> ExecutionMode {
        match self.config.search.mode {
            SearchMode::Sequential => ExecutionMode::Sequential,
            SearchMode::Parallel => ExecutionMode::Parallel(self.config.search.parallel_policy),
        }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// 執行一次搜尋並收集所有區塊
    pub async fn run(&self, task: &SearchTask, mode: ExecutionMode) -> SearchReport {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.run_streaming(task, mode, tx).await;

        let mut sections = Vec::new();
        while let Ok(section) = rx.try_recv() {
            sections.push(section);
        }

        SearchReport {
            correlation_id: task.correlation_id,
            sections,
        }
    }

    /// 執行一次搜尋，區塊一決定就送出
    ///
    /// 輸出順序：主要結果 → 固定附加結果 → 錯誤（或無結果訊息）。
    pub async fn run_streaming(
        &self,
        task: &SearchTask,
        mode: ExecutionMode,
        sink: mpsc::UnboundedSender<ReportSection>,
    ) {
        let span = info_span!("search", correlation_id = %task.correlation_id);

        async move {
            let options = task.options();
            let cancel = task.cancel.as_ref();
            let mut state = RequestState::new(sink, task.max_results);
            info!("🔍 開始搜尋: {} ({:?})", task.file_name, mode);

            let main = self.run_main(&mode, &options, cancel, &mut state);
            let attached = self.run_attached(&options, cancel);
            let ((), attached) = tokio::join!(main, attached);

            for mut output in attached {
                state.record(&output);
                output.hits.truncate(self.low_cap(&output.provider, state.max_results));
                if !output.hits.is_empty() {
                    state.emit(ReportSection::Supplementary { output });
                }
            }

            let errors = std::mem::take(&mut state.errors);
            if !state.emitted_content {
                info!("沒有找到結果 ({} 個錯誤)", errors.len());
                state.emit(ReportSection::NoResults { errors });
            } else if !errors.is_empty() {
                state.emit(ReportSection::Errors { errors });
            }
        }
        .instrument(span)
        .await
    }

    async fn run_main(
        &self,
        mode: &ExecutionMode,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
        state: &mut RequestState,
    ) {
        match mode {
            ExecutionMode::Direct(selection) => {
                let providers = self.select(selection, state);
                let outputs = self.search_all(&providers, options, cancel).await;
                for output in &outputs {
                    state.record(output);
                }
                self.present(outputs, state).await;
            }
            ExecutionMode::Sequential => self.run_sequential(options, cancel, state).await,
            ExecutionMode::Parallel(policy) => self.run_parallel(*policy, options, cancel, state).await,
        }
    }

    /// 依序嘗試，達到門檻就停止；都沒有的話，其餘服務並行後合併輸出
    async fn run_sequential(
        &self,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
        state: &mut RequestState,
    ) {
        let main = self.main_providers();
        let order = self.sequential_order(&main);
        let mut outputs = Vec::new();

        for provider in &order {
            let name = provider.name();
            let result = self
                .search_provider(provider, options, cancel)
                .instrument(info_span!("provider", name))
                .await;
            let output = to_output(name, result);
            state.record(&output);

            let threshold = self.config.effective_threshold(name);
            if confidence::meets_threshold(&output.hits, threshold) {
                let split = partition(output.hits, threshold);
                self.emit_high(name, split.high, state).await;
                debug!("{} 已達門檻，略過其餘服務", name);
                return;
            }
            outputs.push(output);
        }

        let remaining = main
            .into_iter()
            .filter(|p| !order.iter().any(|o| o.name() == p.name()))
            .collect::<Vec<_>>();
        if !remaining.is_empty() {
            debug!("依序搜尋沒有達到門檻，並行搜尋其餘 {} 個服務", remaining.len());
            for output in self.search_all(&remaining, options, cancel).await {
                state.record(&output);
                outputs.push(output);
            }
        }

        self.present(outputs, state).await;
    }

    /// 全部並行，依完成順序處理
    async fn run_parallel(
        &self,
        policy: ParallelPolicy,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
        state: &mut RequestState,
    ) {
        let providers = self.main_providers();
        // 勝出後取消還在閘門排隊的服務；外部取消也會傳下來
        let race = cancel.map(|token| token.child_token()).unwrap_or_default();

        let mut pending = providers
            .iter()
            .map(|provider| {
                let race = &race;
                async move {
                    let result = self.search_provider(provider, options, Some(race)).await;
                    (provider.name(), result)
                }
                .instrument(info_span!("provider", name = provider.name()))
            })
            .collect::<FuturesUnordered<_>>();

        let mut emitted = false;
        let mut fallback = Vec::new();
        // 輸出高信心結果（含補充資訊查詢）期間完成的服務先暫存
        let mut finished = VecDeque::new();

        loop {
            let (name, result) = match finished.pop_front() {
                Some(item) => item,
                None => match pending.next().await {
                    Some(item) => item,
                    None => break,
                },
            };
            let externally_cancelled = cancel.is_some_and(|token| token.is_cancelled());
            if emitted && !externally_cancelled && matches!(result, Err(SearchError::Cancelled)) {
                debug!("{} 尚未開始就已有結果，不列為錯誤", name);
                continue;
            }

            let output = to_output(name, result);
            state.record(&output);

            let split = partition(output.hits, self.config.effective_threshold(name));
            if !split.has_high() {
                fallback.push(SearchOutput::hits(name, split.low));
                continue;
            }

            match policy {
                ParallelPolicy::First if emitted => {
                    debug!("{} 的高信心結果較晚完成，不輸出", name);
                }
                ParallelPolicy::First => {
                    emitted = true;
                    race.cancel();
                    let emit = self.emit_high(name, split.high, state);
                    poll_alongside(emit, &mut pending, &mut finished).await;
                }
                ParallelPolicy::All => {
                    emitted = true;
                    let emit = self.emit_high(name, split.high, state);
                    poll_alongside(emit, &mut pending, &mut finished).await;
                }
            }
        }

        if !emitted {
            fallback.sort_by_key(|output| self.declared_position(&output.provider));
            self.emit_low(fallback, state);
        }
    }

    /// 固定附加的服務，結果不參與信心分組
    async fn run_attached(
        &self,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Vec<SearchOutput> {
        let attached = self
            .enabled_providers()
            .filter(|p| self.config.provider(p.name()).always_attach)
            .cloned()
            .collect::<Vec<_>>();
        self.search_all(&attached, options, cancel).await
    }

    /// 直接模式的輸出規則：有高信心結果就輸出代表，否則輸出合併的低信心結果
    async fn present(&self, mut outputs: Vec<SearchOutput>, state: &mut RequestState) {
        outputs.sort_by_key(|output| self.declared_position(&output.provider));

        let mut high_groups = Vec::new();
        let mut low_groups = Vec::new();
        for SearchOutput { provider, hits, .. } in outputs {
            let split = partition(hits, self.config.effective_threshold(&provider));
            if split.has_high() {
                high_groups.push((provider.clone(), split.high));
            }
            low_groups.push(SearchOutput::hits(provider, split.low));
        }

        if high_groups.is_empty() {
            self.emit_low(low_groups, state);
            return;
        }

        for (provider, high) in high_groups {
            self.emit_high(&provider, high, state).await;
        }
    }

    async fn emit_high(&self, provider: &str, high: Vec<SearchHit>, state: &mut RequestState) {
        let cap = self.config.provider(provider).max_high_results;

        for hit in representatives(high, cap) {
            info!("✅ {} 找到 {:.1}%: {}", provider, hit.similarity, hit.url);
            let enhancement = self
                .enhancers
                .enhance(&hit, &mut state.ledger, &mut state.errors)
                .await;
            state.emit(ReportSection::HighConfidence {
                provider: provider.to_string(),
                hit,
                enhancement,
            });
        }
    }

    fn emit_low(&self, groups: Vec<SearchOutput>, state: &mut RequestState) {
        let groups = groups
            .into_iter()
            .filter_map(|mut group| {
                group.hits.truncate(self.low_cap(&group.provider, state.max_results));
                (!group.hits.is_empty()).then_some(group)
            })
            .collect::<Vec<_>>();

        if !groups.is_empty() {
            info!("沒有達到門檻的結果，輸出 {} 個服務的低信心結果", groups.len());
            state.emit(ReportSection::LowConfidence { groups });
        }
    }

    /// 並行搜尋，輸出依傳入順序
    async fn search_all(
        &self,
        providers: &[Arc<dyn SearchProvider>],
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Vec<SearchOutput> {
        join_all(providers.iter().map(|provider| {
            async move {
                let result = self.search_provider(provider, options, cancel).await;
                to_output(provider.name(), result)
            }
            .instrument(info_span!("provider", name = provider.name()))
        }))
        .await
    }

    /// 呼叫單一服務：需要瀏覽器的先經過閘門，整體受逾時限制
    async fn search_provider(
        &self,
        provider: &Arc<dyn SearchProvider>,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let name = provider.name();
        let limit = self.config.search.provider_timeout();

        let call = async {
            match tokio::time::timeout(limit, provider.search(options)).await {
                Ok(Ok(hits)) => {
                    debug!("{} 回傳 {} 筆", name, hits.len());
                    Ok(hits)
                }
                Ok(Err(e)) => Err(SearchError::provider(name, format!("{:#}", e))),
                Err(_) => Err(SearchError::timeout("搜尋", limit)),
            }
        };

        if provider.requires_gated_resource() {
            self.gate.run(|| call, cancel).await?
        } else {
            call.await
        }
    }

    fn enabled_providers(&self) -> impl Iterator<Item = &Arc<dyn SearchProvider>> {
        self.providers
            .iter()
            .filter(|p| self.config.provider(p.name()).enabled)
    }

    /// 參與信心分組的服務（啟用且不是固定附加）
    fn main_providers(&self) -> Vec<Arc<dyn SearchProvider>> {
        self.enabled_providers()
            .filter(|p| !self.config.provider(p.name()).always_attach)
            .cloned()
            .collect()
    }

    fn select(&self, selection: &ProviderSelection, state: &mut RequestState) -> Vec<Arc<dyn SearchProvider>> {
        let main = self.main_providers();

        if let ProviderSelection::Only(names) = selection {
            for name in names {
                let known = self.enabled_providers().any(|p| p.name() == name);
                if !known {
                    state.errors.push(logging::diagnostic(name, "未知或未啟用的搜尋服務"));
                }
            }
        }

        main.into_iter()
            .filter(|p| selection.includes(p.name()))
            .collect()
    }

    fn sequential_order(&self, main: &[Arc<dyn SearchProvider>]) -> Vec<Arc<dyn SearchProvider>> {
        let order = &self.config.search.sequential_order;
        if order.is_empty() {
            return main.to_vec();
        }

        order
            .iter()
            .filter_map(|name| {
                let found = main.iter().find(|p| p.name() == name).cloned();
                if found.is_none() {
                    warn!("sequential_order 中的 {} 不存在或未啟用", name);
                }
                found
            })
            .collect()
    }

    fn declared_position(&self, name: &str) -> usize {
        self.providers
            .iter()
            .position(|p| p.name() == name)
            .unwrap_or(usize::MAX)
    }

    /// 低信心結果上限：服務自訂 > 請求上限
    fn low_cap(&self, provider: &str, task_max: usize) -> usize {
        self.config.provider(provider).max_results.unwrap_or(task_max)
    }
}

/// 執行 `work` 的同時繼續推進其他服務，完成的結果放進 `finished`
async fn poll_alongside<F, S>(work: F, pending: &mut S, finished: &mut VecDeque<S::Item>) -> F::Output
where
    F: Future,
    S: Stream + Unpin,
{
    tokio::pin!(work);
    loop {
        tokio::select! {
            biased;
            output = &mut work => return output,
            Some(item) = pending.next() => finished.push_back(item),
        }
    }
}

fn to_output(name: &str, result: Result<Vec<SearchHit>, SearchError>) -> SearchOutput {
    match result {
        Ok(hits) => SearchOutput::hits(name, hits),
        Err(e) => {
            warn!("❌ {} 失敗: {}", name, e);
            let diagnostic = match &e {
                SearchError::ProviderFailure { message, .. } => logging::diagnostic(name, message),
                other => logging::diagnostic(name, &other.to_string()),
            };
            SearchOutput::failed(name, diagnostic)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;
    use crate::enhance::tests::RecordingEnhancer;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeProvider {
        name: &'static str,
        scores: Vec<f32>,
        delay: Duration,
        fail: Option<&'static str>,
        gated: bool,
        calls: AtomicUsize,
        /// 共用的同時執行計數（閘門測試）
        running: Option<Arc<(AtomicUsize, AtomicUsize)>>,
        url_prefix: &'static str,
    }

    impl FakeProvider {
        fn new(name: &'static str, scores: &[f32]) -> Self {
            Self {
                name,
                scores: scores.to_vec(),
                delay: Duration::ZERO,
                fail: None,
                gated: false,
                calls: AtomicUsize::new(0),
                running: None,
                url_prefix: "https://example.com",
            }
        }

        fn delay_ms(mut self, ms: u64) -> Self {
            self.delay = Duration::from_millis(ms);
            self
        }

        fn failing(mut self, message: &'static str) -> Self {
            self.fail = Some(message);
            self
        }

        fn gated(mut self) -> Self {
            self.gated = true;
            self
        }

        fn urls(mut self, prefix: &'static str) -> Self {
            self.url_prefix = prefix;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SearchProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn requires_gated_resource(&self) -> bool {
            self.gated
        }

        async fn search(&self, _options: &SearchOptions) -> Result<Vec<SearchHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(counter) = &self.running {
                let now = counter.0.fetch_add(1, Ordering::SeqCst) + 1;
                counter.1.fetch_max(now, Ordering::SeqCst);
            }

            // 分兩段等待，需要被重新推進才能完成
            tokio::time::sleep(self.delay / 2).await;
            tokio::time::sleep(self.delay - self.delay / 2).await;

            if let Some(counter) = &self.running {
                counter.0.fetch_sub(1, Ordering::SeqCst);
            }
            if let Some(message) = self.fail {
                anyhow::bail!("{}\n詳細資訊", message);
            }

            Ok(self
                .scores
                .iter()
                .enumerate()
                .map(|(i, score)| SearchHit::new(*score, format!("{}/{}/{}", self.url_prefix, self.name, i)))
                .collect())
        }
    }

    fn task() -> SearchTask {
        SearchTask::new(vec![0x89, b'P', b'N', b'G'], "test.png").with_max_results(2)
    }

    fn threshold(value: f32) -> ProviderSettings {
        ProviderSettings {
            threshold: value,
            ..Default::default()
        }
    }

    fn orchestrator(config: Config, providers: &[&Arc<FakeProvider>]) -> SearchOrchestrator {
        let providers = providers
            .iter()
            .map(|p| Arc::clone(*p) as Arc<dyn SearchProvider>)
            .collect();
        SearchOrchestrator::new(config, providers, vec![]).unwrap()
    }

    fn high_providers(report: &SearchReport) -> Vec<&str> {
        report.high_confidence().map(|(provider, _)| provider).collect()
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_threshold_match() {
        let a = Arc::new(FakeProvider::new("a", &[92.0, 50.0]));
        let b = Arc::new(FakeProvider::new("b", &[99.0]));
        let c = Arc::new(FakeProvider::new("c", &[99.0]));
        let config = Config::default()
            .with_default_threshold(85.0)
            .with_provider("a", threshold(90.0))
            .with_provider("b", threshold(80.0))
            .with_provider("c", threshold(70.0));
        let orchestrator = orchestrator(config, &[&a, &b, &c]);

        let report = orchestrator.run(&task(), ExecutionMode::Sequential).await;

        assert_eq!(high_providers(&report), vec!["a"]);
        assert_eq!(report.high_confidence().next().unwrap().1.similarity, 92.0);
        assert_eq!(report.sections.len(), 1);
        assert_eq!(b.calls(), 0);
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_below_threshold_merges_low_confidence_in_declared_order() {
        let a = Arc::new(FakeProvider::new("a", &[10.0, 60.0, 30.0]));
        let b = Arc::new(FakeProvider::new("b", &[79.0, 20.0, 40.0, 50.0]));
        let c = Arc::new(FakeProvider::new("c", &[]));
        let mut config = Config::default()
            .with_default_threshold(85.0)
            .with_provider("a", ProviderSettings {
                max_results: Some(1),
                ..threshold(90.0)
            })
            .with_provider("b", threshold(80.0));
        config.search.sequential_order = vec!["c".into(), "b".into(), "a".into()];
        let orchestrator = orchestrator(config, &[&a, &b, &c]);

        let report = orchestrator.run(&task(), ExecutionMode::Sequential).await;

        assert!(report.high_confidence().next().is_none());
        let groups = report.low_confidence().unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.provider.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let a_scores: Vec<f32> = groups[0].hits.iter().map(|h| h.similarity).collect();
        let b_scores: Vec<f32> = groups[1].hits.iter().map(|h| h.similarity).collect();
        assert_eq!(a_scores, vec![60.0]);
        // 沒有自訂上限時用請求的 max_results
        assert_eq!(b_scores, vec![79.0, 50.0]);
        assert!(report.errors().is_empty());
    }

    #[tokio::test]
    async fn test_sequential_fallback_runs_remaining_providers() {
        let a = Arc::new(FakeProvider::new("a", &[40.0]));
        let b = Arc::new(FakeProvider::new("b", &[95.0]));
        let mut config = Config::default();
        config.search.sequential_order = vec!["a".into()];
        let orchestrator = orchestrator(config, &[&a, &b]);

        let report = orchestrator.run(&task(), ExecutionMode::Sequential).await;

        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(high_providers(&report), vec!["b"]);
        assert!(report.low_confidence().is_none());
    }

    #[tokio::test]
    async fn test_parallel_first_completion_wins() {
        let a = Arc::new(FakeProvider::new("a", &[99.0]).delay_ms(80));
        let b = Arc::new(FakeProvider::new("b", &[90.0]).delay_ms(5));
        let orchestrator = orchestrator(Config::default(), &[&a, &b]);

        let report = orchestrator
            .run(&task(), ExecutionMode::Parallel(ParallelPolicy::First))
            .await;

        assert_eq!(high_providers(&report), vec!["b"]);
        // a 仍然跑完，但結果不輸出也不算錯誤
        assert_eq!(a.calls(), 1);
        assert!(report.errors().is_empty());
        assert!(report.low_confidence().is_none());
    }

    #[tokio::test]
    async fn test_parallel_all_emits_each_provider_in_completion_order() {
        let a = Arc::new(FakeProvider::new("a", &[99.0]).delay_ms(60));
        let b = Arc::new(FakeProvider::new("b", &[90.0]).delay_ms(5));
        let c = Arc::new(FakeProvider::new("c", &[30.0]).delay_ms(20));
        let orchestrator = orchestrator(Config::default(), &[&a, &b, &c]);

        let report = orchestrator
            .run(&task(), ExecutionMode::Parallel(ParallelPolicy::All))
            .await;

        assert_eq!(high_providers(&report), vec!["b", "a"]);
        // 有高信心結果時，低信心結果不輸出
        assert!(report.low_confidence().is_none());
    }

    #[tokio::test]
    async fn test_parallel_without_high_confidence_falls_back_to_low() {
        let a = Arc::new(FakeProvider::new("a", &[50.0]).delay_ms(30));
        let b = Arc::new(FakeProvider::new("b", &[60.0]).delay_ms(5));
        let orchestrator = orchestrator(Config::default(), &[&a, &b]);

        let report = orchestrator
            .run(&task(), ExecutionMode::Parallel(ParallelPolicy::First))
            .await;

        let names: Vec<&str> = report
            .low_confidence()
            .unwrap()
            .iter()
            .map(|g| g.provider.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_parallel_first_cancels_queued_gated_sibling() {
        let a = Arc::new(FakeProvider::new("a", &[95.0]).gated().delay_ms(20));
        let b = Arc::new(FakeProvider::new("b", &[95.0]).gated().delay_ms(20));
        let config = Config::default().with_concurrency(1);
        let orchestrator = orchestrator(config, &[&a, &b]);

        let report = orchestrator
            .run(&task(), ExecutionMode::Parallel(ParallelPolicy::First))
            .await;

        assert_eq!(report.high_confidence().count(), 1);
        assert_eq!(a.calls() + b.calls(), 1);
        assert!(report.errors().is_empty());
        assert_eq!(orchestrator.gate().queued(), 0);
    }

    #[tokio::test]
    async fn test_direct_mode_emits_representative_per_provider() {
        let a = Arc::new(FakeProvider::new("a", &[88.0, 97.0, 91.0]));
        let b = Arc::new(FakeProvider::new("b", &[95.0, 93.0, 99.0]));
        let c = Arc::new(FakeProvider::new("c", &[96.0]));
        let config = Config::default().with_provider(
            "b",
            ProviderSettings {
                max_high_results: 2,
                ..Default::default()
            },
        );
        let orchestrator = orchestrator(config, &[&a, &b, &c]);

        let selection = ProviderSelection::parse("a,b");
        let report = orchestrator.run(&task(), ExecutionMode::Direct(selection)).await;

        let emitted: Vec<(&str, f32)> = report
            .high_confidence()
            .map(|(provider, hit)| (provider, hit.similarity))
            .collect();
        assert_eq!(emitted, vec![("a", 97.0), ("b", 99.0), ("b", 95.0)]);
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test]
    async fn test_direct_unknown_selection_reported() {
        let a = Arc::new(FakeProvider::new("a", &[97.0]));
        let orchestrator = orchestrator(Config::default(), &[&a]);

        let report = orchestrator
            .run(&task(), ExecutionMode::Direct(ProviderSelection::parse("a,nope")))
            .await;

        assert_eq!(high_providers(&report), vec!["a"]);
        assert_eq!(report.errors(), ["nope: 未知或未啟用的搜尋服務".to_string()]);
    }

    #[tokio::test]
    async fn test_provider_failure_does_not_abort_siblings() {
        let a = Arc::new(FakeProvider::new("a", &[]).failing("HTTP 錯誤: 503"));
        let b = Arc::new(FakeProvider::new("b", &[96.0]));
        let orchestrator = orchestrator(Config::default(), &[&a, &b]);

        let report = orchestrator
            .run(&task(), ExecutionMode::Direct(ProviderSelection::All))
            .await;

        assert_eq!(high_providers(&report), vec!["b"]);
        // 錯誤在內容之後，只保留第一行
        assert!(matches!(report.sections.last(), Some(ReportSection::Errors { .. })));
        assert_eq!(report.errors(), ["a: HTTP 錯誤: 503".to_string()]);
    }

    #[tokio::test]
    async fn test_no_results_includes_errors() {
        let a = Arc::new(FakeProvider::new("a", &[]).failing("連線被拒絕"));
        let b = Arc::new(FakeProvider::new("b", &[]));
        let orchestrator = orchestrator(Config::default(), &[&a, &b]);

        let report = orchestrator.run(&task(), ExecutionMode::Sequential).await;

        assert!(!report.has_results());
        assert_eq!(
            report.sections,
            vec![ReportSection::NoResults {
                errors: vec!["a: 連線被拒絕".to_string()]
            }]
        );
    }

    #[tokio::test]
    async fn test_provider_timeout_becomes_diagnostic() {
        let a = Arc::new(FakeProvider::new("a", &[99.0]).delay_ms(200));
        let mut config = Config::default();
        config.search.provider_timeout_ms = 20;
        let orchestrator = orchestrator(config, &[&a]);

        let report = orchestrator
            .run(&task(), ExecutionMode::Direct(ProviderSelection::All))
            .await;

        assert!(!report.has_results());
        assert_eq!(report.errors(), ["a: 搜尋 逾時 (20 ms)".to_string()]);
    }

    #[tokio::test]
    async fn test_always_attach_runs_in_every_mode_outside_partition() {
        let a = Arc::new(FakeProvider::new("a", &[99.0]));
        let s = Arc::new(FakeProvider::new("s", &[100.0, 0.0, 0.0, 0.0]));
        let config = Config::default().with_provider(
            "s",
            ProviderSettings {
                always_attach: true,
                ..Default::default()
            },
        );
        let orchestrator = orchestrator(config, &[&s, &a]);

        for mode in [
            ExecutionMode::Sequential,
            ExecutionMode::Parallel(ParallelPolicy::First),
            ExecutionMode::Direct(ProviderSelection::All),
        ] {
            let report = orchestrator.run(&task(), mode).await;
            assert_eq!(high_providers(&report), vec!["a"]);

            let supplementary: Vec<&SearchOutput> = report.supplementary().collect();
            assert_eq!(supplementary.len(), 1);
            assert_eq!(supplementary[0].provider, "s");
            assert_eq!(supplementary[0].hits.len(), 2);
            assert!(matches!(
                report.sections.last(),
                Some(ReportSection::Supplementary { .. })
            ));
        }
        assert_eq!(s.calls(), 3);
    }

    #[tokio::test]
    async fn test_enhancement_deduplicated_across_providers() {
        let a = Arc::new(FakeProvider::new("a", &[95.0]).urls("https://danbooru.donmai.us/posts/42?from="));
        let b = Arc::new(FakeProvider::new("b", &[93.0]).urls("https://danbooru.donmai.us/posts/42?via="));
        let enhancer = Arc::new(RecordingEnhancer::new("danbooru"));
        let config = Config::default().with_default_enhancers();
        let orchestrator = SearchOrchestrator::new(
            config,
            vec![a.clone() as Arc<dyn SearchProvider>, b.clone()],
            vec![enhancer.clone() as Arc<dyn Enhancer>],
        )
        .unwrap();

        let report = orchestrator
            .run(&task(), ExecutionMode::Direct(ProviderSelection::All))
            .await;

        let enhancements: Vec<bool> = report
            .sections
            .iter()
            .filter_map(|section| match section {
                ReportSection::HighConfidence { enhancement, .. } => Some(enhancement.is_some()),
                _ => None,
            })
            .collect();
        assert_eq!(enhancements, vec![true, false]);
        assert_eq!(enhancer.call_count(), 1);
    }

    #[tokio::test]
    async fn test_parallel_siblings_progress_while_enhancing() {
        let a = Arc::new(FakeProvider::new("a", &[95.0]).urls("https://danbooru.donmai.us/posts/42?from="));
        let b = Arc::new(FakeProvider::new("b", &[92.0]).delay_ms(60));
        let mut enhancer = RecordingEnhancer::new("danbooru");
        enhancer.delay = Duration::from_millis(150);
        let enhancer = Arc::new(enhancer);
        let mut config = Config::default().with_default_enhancers();
        config.search.provider_timeout_ms = 100;
        let orchestrator = SearchOrchestrator::new(
            config,
            vec![a.clone() as Arc<dyn SearchProvider>, b.clone()],
            vec![enhancer.clone() as Arc<dyn Enhancer>],
        )
        .unwrap();

        let report = orchestrator
            .run(&task(), ExecutionMode::Parallel(ParallelPolicy::All))
            .await;

        // a 的補充資訊查詢比 b 的逾時還久，b 仍要在時限內完成
        assert_eq!(high_providers(&report), vec!["a", "b"]);
        assert!(report.errors().is_empty());
        assert_eq!(enhancer.call_count(), 1);
    }

    #[tokio::test]
    async fn test_gated_providers_respect_capacity() {
        let counter = Arc::new((AtomicUsize::new(0), AtomicUsize::new(0)));
        let providers: Vec<Arc<FakeProvider>> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|name| {
                let mut provider = FakeProvider::new(name, &[50.0]).gated().delay_ms(15);
                provider.running = Some(Arc::clone(&counter));
                Arc::new(provider)
            })
            .collect();
        let config = Config::default().with_concurrency(2);
        let refs: Vec<&Arc<FakeProvider>> = providers.iter().collect();
        let orchestrator = orchestrator(config, &refs);

        let report = orchestrator
            .run(&task(), ExecutionMode::Direct(ProviderSelection::All))
            .await;

        assert_eq!(report.low_confidence().unwrap().len(), 4);
        assert!(counter.1.load(Ordering::SeqCst) <= 2);
        assert!(providers.iter().all(|p| p.calls() == 1));
    }

    #[tokio::test]
    async fn test_cancelled_request_skips_queued_gated_provider() {
        let a = Arc::new(FakeProvider::new("a", &[99.0]).gated());
        let b = Arc::new(FakeProvider::new("b", &[60.0]));
        let orchestrator = orchestrator(Config::default(), &[&a, &b]);

        let token = CancellationToken::new();
        token.cancel();
        let task = task().with_cancel(token);

        let report = orchestrator
            .run(&task, ExecutionMode::Direct(ProviderSelection::All))
            .await;

        assert_eq!(a.calls(), 0);
        assert!(report.low_confidence().is_some());
        assert_eq!(report.errors(), ["a: 排隊中的任務已取消".to_string()]);
    }

    #[tokio::test]
    async fn test_streaming_sends_sections_in_order() {
        let a = Arc::new(FakeProvider::new("a", &[99.0]).delay_ms(40));
        let b = Arc::new(FakeProvider::new("b", &[90.0]));
        let c = Arc::new(FakeProvider::new("c", &[]).failing("壞掉了"));
        let orchestrator = orchestrator(Config::default(), &[&a, &b, &c]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator
            .run_streaming(&task(), ExecutionMode::Parallel(ParallelPolicy::All), tx)
            .await;

        let mut sections = vec![];
        while let Some(section) = rx.recv().await {
            sections.push(section);
        }
        assert_eq!(sections.len(), 3);
        assert!(matches!(&sections[0], ReportSection::HighConfidence { provider, .. } if provider == "b"));
        assert!(matches!(&sections[1], ReportSection::HighConfidence { provider, .. } if provider == "a"));
        assert!(matches!(&sections[2], ReportSection::Errors { errors } if errors == &vec!["c: 壞掉了".to_string()]));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let a = Arc::new(FakeProvider::new("a", &[]));
        let again = Arc::new(FakeProvider::new("a", &[]));
        let result = SearchOrchestrator::new(
            Config::default(),
            vec![a as Arc<dyn SearchProvider>, again],
            vec![],
        );
        assert!(matches!(result, Err(SearchError::Config(_))));
    }

    #[test]
    fn test_default_mode_from_config() {
        let config = Config::default()
            .with_mode(SearchMode::Parallel)
            .with_parallel_policy(ParallelPolicy::All);
        let orchestrator = SearchOrchestrator::new(config, vec![], vec![]).unwrap();
        assert_eq!(
            orchestrator.default_mode(),
            ExecutionMode::Parallel(ParallelPolicy::All)
        );
    }
}
