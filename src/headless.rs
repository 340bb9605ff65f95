//! 无头浏览器服务与 headless 请求执行
//!
//! `BrowserService` 持有一个按需启动的共享浏览器实例，以及限制同时打开标签页
//! 数量的信号量。浏览器只会初始化一次，并发的首次使用是安全的。

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::extractor::run_extractors;
use crate::http_probe::build_full_url;
use crate::match_context::{HeadlessCapture, MatchContext};
use crate::matcher::check_matchers_with_vars;
use crate::template::Request;
use crate::template_engine::ExecutionContext;
use crate::variables::VariableScope;
use crate::{Result, ScanError};

/// 渲染页面并返回完整HTML
///
/// `tab` 是标签页配额，实现必须持有到标签页真正关闭为止。
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str, timeout: Duration, tab: OwnedSemaphorePermit) -> Result<String>;
}

/// 启动浏览器实例
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn PageRenderer>>;
}

/// 基于本地 Chrome/Chromium 的启动器
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    pub ignore_certificate_errors: bool,
    pub idle_timeout: Duration,
}

impl Default for ChromeLauncher {
    fn default() -> Self {
        Self {
            ignore_certificate_errors: true,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn PageRenderer>> {
        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .ignore_certificate_errors(self.ignore_certificate_errors)
            .idle_browser_timeout(self.idle_timeout)
            .build()
            .map_err(|e| ScanError::BrowserInit(format!("无效的浏览器启动参数: {}", e)))?;

        let browser = tokio::task::spawn_blocking(move || Browser::new(options))
            .await
            .map_err(|e| ScanError::BrowserInit(format!("浏览器启动任务失败: {}", e)))?
            .map_err(|e| ScanError::BrowserInit(e.to_string()))?;

        info!("无头浏览器已启动");
        Ok(Arc::new(ChromeRenderer { browser }))
    }
}

struct ChromeRenderer {
    browser: Browser,
}

#[async_trait]
impl PageRenderer for ChromeRenderer {
    async fn render(&self, url: &str, timeout: Duration, tab: OwnedSemaphorePermit) -> Result<String> {
        let browser = self.browser.clone();
        let url = url.to_string();

        tokio::task::spawn_blocking(move || {
            // 外层超时返回后配额仍随闭包存活，直到标签页关闭
            let _tab_permit = tab;
            let deadline = Instant::now() + timeout;

            let tab = browser
                .new_tab()
                .map_err(|e| ScanError::Headless(format!("打开标签页失败: {}", e)))?;

            // 各步骤共享同一个截止时间
            let content = (|| -> anyhow::Result<String> {
                tab.set_default_timeout(remaining(deadline)?);
                tab.navigate_to(&url)?;
                tab.set_default_timeout(remaining(deadline)?);
                tab.wait_until_navigated()?;
                tab.set_default_timeout(remaining(deadline)?);
                tab.wait_for_element("body")?;
                tab.get_content()
            })();

            if let Err(e) = tab.close(true) {
                debug!("关闭标签页失败: {}", e);
            }

            content.map_err(|e| ScanError::Headless(format!("渲染 {} 失败: {}", url, e)))
        })
        .await
        .map_err(|e| ScanError::Headless(format!("渲染任务失败: {}", e)))?
    }
}

fn remaining(deadline: Instant) -> anyhow::Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
        .ok_or_else(|| anyhow::anyhow!("渲染超时"))
}

/// 浏览器生命周期与标签页并发控制
pub struct BrowserService {
    launcher: Arc<dyn BrowserLauncher>,
    renderer: Mutex<Option<Arc<dyn PageRenderer>>>,
    tabs: Arc<Semaphore>,
    tab_limit: usize,
    timeout: Duration,
    max_html_size: usize,
}

impl BrowserService {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, tab_limit: usize, timeout: Duration, max_html_size: usize) -> Self {
        let tab_limit = tab_limit.max(1);
        Self {
            launcher,
            renderer: Mutex::new(None),
            tabs: Arc::new(Semaphore::new(tab_limit)),
            tab_limit,
            timeout,
            max_html_size,
        }
    }

    pub fn tab_limit(&self) -> usize {
        self.tab_limit
    }

    pub fn available_tabs(&self) -> usize {
        self.tabs.available_permits()
    }

    pub async fn is_running(&self) -> bool {
        self.renderer.lock().await.is_some()
    }

    /// 获取共享浏览器，不存在时启动
    async fn renderer(&self) -> Result<Arc<dyn PageRenderer>> {
        let mut guard = self.renderer.lock().await;
        if let Some(renderer) = guard.as_ref() {
            return Ok(renderer.clone());
        }

        let renderer = self.launcher.launch().await?;
        *guard = Some(renderer.clone());
        Ok(renderer)
    }

    /// 在独立标签页中渲染页面，结果按最大长度截断
    pub async fn render(&self, url: &str, cancel: &CancellationToken) -> Result<HeadlessCapture> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(ScanError::Canceled),
            permit = self.tabs.clone().acquire_owned() => permit
                .map_err(|_| ScanError::Headless("标签页信号量已关闭".to_string()))?,
        };

        let renderer = self.renderer().await?;
        let started = Instant::now();

        let html = tokio::select! {
            _ = cancel.cancelled() => return Err(ScanError::Canceled),
            result = tokio::time::timeout(self.timeout, renderer.render(url, self.timeout, permit)) => match result {
                Ok(html) => html?,
                Err(_) => return Err(ScanError::Headless(format!("渲染 {} 超时", url))),
            },
        };

        Ok(HeadlessCapture {
            url: url.to_string(),
            html: truncate_utf8(html, self.max_html_size),
            render_time: started.elapsed(),
        })
    }

    /// 关闭浏览器，下次使用时重新启动
    pub async fn shutdown(&self) {
        if self.renderer.lock().await.take().is_some() {
            info!("无头浏览器已关闭");
        }
    }

    /// 强制重新初始化浏览器
    pub async fn restart(&self) -> Result<()> {
        self.shutdown().await;
        self.renderer().await.map(|_| ())
    }
}

fn truncate_utf8(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}

/// 执行headless请求：渲染第一个路径（默认BaseURL）并匹配
pub async fn execute(ctx: &ExecutionContext<'_>, request: &Request, scope: &mut VariableScope) -> Result<bool> {
    let raw = request
        .paths
        .first()
        .map(|p| scope.substitute(p))
        .unwrap_or_else(|| scope.substitute("{{BaseURL}}"));
    let url = build_full_url(&ctx.target.url, &raw)?;

    debug!("[{}] headless 渲染 {}", ctx.template_id, url);
    let capture = match ctx.services.browser.render(&url, ctx.cancel).await {
        Ok(capture) => capture,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!("[{}] headless 请求 {} 失败: {}", ctx.template_id, url, e);
            return Ok(false);
        }
    };

    let match_ctx = MatchContext::from_headless(capture);
    if check_matchers_with_vars(&request.matchers, request.matchers_condition, &match_ctx, scope.values()) {
        run_extractors(&request.extractors, &match_ctx, scope);
        return Ok(true);
    }
    Ok(false)
}
