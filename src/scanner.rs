//! 扫描调度
//!
//! 两层有界并发：`scan` 以 `threads` 个并发处理目标，`check_target` 对每个目标
//! 以 `workers` 个并发评估模板。整个检查受 `timeout` 截止时间约束，
//! 取消信号会传递到所有正在执行的请求。

use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::PrefetchMode;
use crate::http_probe::fetch_page;
use crate::offline::{can_offline_match, PageSnapshot};
use crate::reporting::{ResultLog, ScanStats, StatsSnapshot};
use crate::services::ScanServices;
use crate::targets::ScanTarget;
use crate::template::Template;
use crate::template_engine::{TemplateEngine, TemplateOutcome};
use crate::{Result, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Canceled,
    DeadlineExceeded,
}

/// 单个目标的检查结果
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub target: String,
    /// 匹配的模板ID，按完成顺序
    pub matched: Vec<String>,
    pub outcomes: Vec<TemplateOutcome>,
    /// 通过主机白名单、参与评估的模板数
    pub evaluated: usize,
    pub status: CompletionStatus,
    pub elapsed: Duration,
}

impl CheckReport {
    pub fn is_match(&self) -> bool {
        !self.matched.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub reports: Vec<CheckReport>,
    pub stats: StatsSnapshot,
    pub status: CompletionStatus,
}

/// 进度回调：(已完成, 总数)
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;
/// 扫描统计回调
pub type StatsCallback = Arc<dyn Fn(&StatsSnapshot) + Send + Sync>;

/// 在锁内计数并回调，保证回调收到的进度单调不减
struct ProgressTracker {
    done: Mutex<usize>,
    total: usize,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    fn new(total: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            done: Mutex::new(0),
            total,
            callback,
        }
    }

    fn advance(&self) {
        let mut done = self.done.lock();
        *done += 1;
        if let Some(callback) = &self.callback {
            callback(*done, self.total);
        }
    }
}

pub struct Scanner {
    engine: TemplateEngine,
    result_log: Option<Arc<ResultLog>>,
    stats: Arc<ScanStats>,
    progress: Option<ProgressCallback>,
    on_stats: Option<StatsCallback>,
}

impl Scanner {
    pub fn new(services: Arc<ScanServices>) -> Self {
        Self {
            engine: TemplateEngine::new(services),
            result_log: None,
            stats: Arc::new(ScanStats::new()),
            progress: None,
            on_stats: None,
        }
    }

    pub fn with_result_log(mut self, log: Arc<ResultLog>) -> Self {
        self.result_log = Some(log);
        self
    }

    /// 每完成一个模板评估调用一次
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// 每完成一个目标调用一次
    pub fn with_stats_callback(mut self, callback: StatsCallback) -> Self {
        self.on_stats = Some(callback);
        self
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn services(&self) -> &ScanServices {
        self.engine.services()
    }

    /// 对单个目标评估所有适用的模板
    pub async fn check_target(
        &self,
        target: &ScanTarget,
        templates: &[Arc<Template>],
        cancel: &CancellationToken,
    ) -> Result<CheckReport> {
        let started = Instant::now();
        let settings = &self.services().settings;

        let applicable: Vec<Arc<Template>> = templates
            .iter()
            .filter(|t| t.applies_to_host(target.hostname()))
            .cloned()
            .collect();
        debug!("{}: {}/{} 个模板适用", target, applicable.len(), templates.len());

        // 截止时间到达时只取消本次检查
        let token = cancel.child_token();
        let deadline = {
            let token = token.clone();
            let timeout = settings.scan_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        let result = self.run_templates(target, applicable.clone(), &token).await;
        deadline.abort();

        let outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(e) if e.is_canceled() => Vec::new(),
            Err(e) => return Err(e),
        };
        let status = if cancel.is_cancelled() {
            CompletionStatus::Canceled
        } else if token.is_cancelled() {
            warn!("{}: 检查超过截止时间 {:?}", target, settings.scan_timeout());
            CompletionStatus::DeadlineExceeded
        } else {
            CompletionStatus::Completed
        };

        Ok(CheckReport {
            target: target.raw.clone(),
            matched: outcomes.iter().map(|o| o.template_id.clone()).collect(),
            outcomes,
            evaluated: applicable.len(),
            status,
            elapsed: started.elapsed(),
        })
    }

    async fn run_templates(
        &self,
        target: &ScanTarget,
        templates: Vec<Arc<Template>>,
        token: &CancellationToken,
    ) -> Result<Vec<TemplateOutcome>> {
        let snapshot = Arc::new(self.prefetch(target, &templates, token).await?);
        let semaphore = Arc::new(Semaphore::new(self.services().settings.workers.max(1)));
        let results: Arc<Mutex<Vec<TemplateOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let progress = Arc::new(ProgressTracker::new(templates.len(), self.progress.clone()));
        let target = Arc::new(target.clone());

        let mut handles = Vec::new();
        for template in templates {
            // 取消后不再启动排队中的模板
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|_| ScanError::InvalidInput("worker pool closed".to_string()))?,
            };

            let engine = self.engine.clone();
            let target = target.clone();
            let snapshot = snapshot.clone();
            let results = results.clone();
            let progress = progress.clone();
            let result_log = self.result_log.clone();
            let token = token.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = engine.execute_template(&template, &target, &snapshot, &token).await;
                progress.advance();

                let outcome = outcome?;
                if outcome.matched {
                    info!("[{}] 命中 {}", template.id, target);
                    if let Some(log) = &result_log {
                        if let Err(e) = log.append(&target.raw, &template.id) {
                            error!("写入结果文件失败: {}", e);
                        }
                    }
                    results.lock().push(outcome);
                }
                Ok::<(), ScanError>(())
            }));
        }

        let mut fatal = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_canceled() => {}
                Ok(Err(e)) => {
                    error!("{}: {}", target, e);
                    fatal.get_or_insert(e);
                }
                Err(e) => error!("模板任务异常退出: {}", e),
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        let outcomes = std::mem::take(&mut *results.lock());
        Ok(outcomes)
    }

    /// 抓取一次目标页面，供所有模板离线匹配
    async fn prefetch(&self, target: &ScanTarget, templates: &[Arc<Template>], token: &CancellationToken) -> Result<PageSnapshot> {
        let mode = self.services().settings.prefetch;
        let wanted = templates
            .iter()
            .any(|t| t.requests.iter().any(can_offline_match));
        if mode == PrefetchMode::Off || !wanted {
            return Ok(PageSnapshot::empty());
        }

        let url = target.url.as_str();
        if mode == PrefetchMode::Headless {
            match self.services().browser.render(url, token).await {
                Ok(page) => return Ok(PageSnapshot::rendered(url, page.html)),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => warn!("{}: 无头预取失败，改用HTTP: {}", target, e),
            }
        }

        match fetch_page(self.services(), url, token).await {
            Ok(body) => Ok(PageSnapshot::fetched(url, body)),
            Err(e) if e.is_canceled() => Err(e),
            Err(e) => {
                debug!("{}: 预取失败: {}", target, e);
                Ok(PageSnapshot::empty())
            }
        }
    }

    /// 批量扫描目标，以 `threads` 个并发执行
    pub async fn scan(
        &self,
        targets: Vec<ScanTarget>,
        templates: &[Arc<Template>],
        cancel: &CancellationToken,
    ) -> Result<ScanSummary> {
        let threads = self.services().settings.threads.max(1);
        self.stats.start(targets.len());
        info!("开始扫描 {} 个目标，{} 个模板，并发 {}", targets.len(), templates.len(), threads);

        // 致命错误时停止其余目标，不影响调用方的令牌
        let scan_token = cancel.child_token();
        let scan_token = &scan_token;

        let mut checks = stream::iter(targets)
            .map(|target| async move {
                let started = Instant::now();
                let result = self.check_target(&target, templates, scan_token).await;
                (target, result, started.elapsed())
            })
            .buffer_unordered(threads);

        let mut reports = Vec::new();
        while let Some((target, result, elapsed)) = checks.next().await {
            match result {
                Ok(report) => {
                    if report.is_match() {
                        self.stats.record_success(report.matched.len(), elapsed);
                    } else {
                        self.stats.record_miss(elapsed);
                    }
                    reports.push(report);
                }
                Err(e) if e.is_canceled() => self.stats.record_error(elapsed),
                Err(e) => {
                    self.stats.record_error(elapsed);
                    error!("{}: {}", target, e);
                    if e.is_fatal() {
                        scan_token.cancel();
                        return Err(e);
                    }
                }
            }

            if let Some(callback) = &self.on_stats {
                callback(&self.stats.snapshot());
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        let status = if cancel.is_cancelled() {
            CompletionStatus::Canceled
        } else {
            CompletionStatus::Completed
        };
        let stats = self.stats.snapshot();
        info!("扫描结束: 处理 {}/{}，成功 {}", stats.processed, stats.loaded, stats.successes);

        Ok(ScanSummary { reports, stats, status })
    }
}
