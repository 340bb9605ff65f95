//! 模板执行引擎
//!
//! 对单个目标评估一个模板。没有声明流程时按顺序执行请求，第一个匹配的请求
//! 决定结果；声明了流程时按步骤依次执行，任一步骤失败即整体不匹配。

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::flow::Flow;
use crate::offline::{match_offline, OfflineVerdict, PageSnapshot};
use crate::services::ScanServices;
use crate::targets::ScanTarget;
use crate::template::{Request, RequestType, Template};
use crate::variables::VariableScope;
use crate::{dns_probe, headless, http_probe, network_probe};
use crate::{Result, ScanError};

/// 协议执行器共用的请求上下文
pub struct ExecutionContext<'a> {
    pub services: &'a ScanServices,
    pub target: &'a ScanTarget,
    pub cancel: &'a CancellationToken,
    pub template_id: &'a str,
}

/// 单个模板在单个目标上的评估结果
#[derive(Debug, Clone, Default)]
pub struct TemplateOutcome {
    pub template_id: String,
    pub matched: bool,
    /// 决定结果的请求在 `requests` 中的位置
    pub matched_request: Option<usize>,
    pub extracted: HashMap<String, String>,
    /// 结果来自页面快照
    pub offline: bool,
}

/// 模板执行引擎
#[derive(Clone)]
pub struct TemplateEngine {
    services: Arc<ScanServices>,
}

impl TemplateEngine {
    pub fn new(services: Arc<ScanServices>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<ScanServices> {
        &self.services
    }

    /// 执行模板。只有取消和浏览器初始化失败会作为错误返回
    pub async fn execute_template(
        &self,
        template: &Template,
        target: &ScanTarget,
        snapshot: &PageSnapshot,
        cancel: &CancellationToken,
    ) -> Result<TemplateOutcome> {
        let ctx = ExecutionContext {
            services: &self.services,
            target,
            cancel,
            template_id: &template.id,
        };

        let mut scope = VariableScope::for_template(template);
        scope.bind_target(&target.url);

        let mut outcome = TemplateOutcome {
            template_id: template.id.clone(),
            ..Default::default()
        };

        match template.flow.as_deref() {
            Some(expression) => {
                let flow = match Flow::parse(expression, &template.requests) {
                    Ok(flow) => flow,
                    Err(e) => {
                        warn!("[{}] {}", template.id, e);
                        return Ok(outcome);
                    }
                };

                for step in &flow.steps {
                    let request = &template.requests[step.index];
                    let (matched, offline) = self.run_request(&ctx, request, snapshot, &mut scope).await?;
                    if !matched {
                        debug!("[{}] 流程在 {}({}) 处终止", template.id, step.protocol, step.index + 1);
                        return Ok(outcome);
                    }
                    outcome.matched_request = Some(step.index);
                    outcome.offline = offline;
                }
                outcome.matched = !flow.steps.is_empty();
            }
            None => {
                for (index, request) in template.requests.iter().enumerate() {
                    let (matched, offline) = self.run_request(&ctx, request, snapshot, &mut scope).await?;
                    if matched {
                        outcome.matched = true;
                        outcome.matched_request = Some(index);
                        outcome.offline = offline;
                        break;
                    }
                }
            }
        }

        if outcome.matched {
            outcome.extracted = collect_extracted(template, &scope);
        }
        Ok(outcome)
    }

    /// 先尝试离线匹配，再实时执行；返回 (是否匹配, 是否离线)
    async fn run_request(
        &self,
        ctx: &ExecutionContext<'_>,
        request: &Request,
        snapshot: &PageSnapshot,
        scope: &mut VariableScope,
    ) -> Result<(bool, bool)> {
        if ctx.cancel.is_cancelled() {
            return Err(ScanError::Canceled);
        }

        if snapshot.is_available() {
            match match_offline(request, snapshot, scope, &ctx.target.url) {
                OfflineVerdict::Matched => return Ok((true, true)),
                OfflineVerdict::Rejected => return Ok((false, true)),
                OfflineVerdict::Unavailable => {}
            }
        }

        let result = match request.request_type {
            RequestType::Http => http_probe::execute(ctx, request, scope).await,
            RequestType::Dns => dns_probe::execute(ctx, request, scope).await,
            RequestType::Network => network_probe::execute(ctx, request, scope).await,
            RequestType::Headless => headless::execute(ctx, request, scope).await,
        };

        match result {
            Ok(matched) => Ok((matched, false)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("[{}] {} 请求失败: {}", ctx.template_id, request.request_type, e);
                Ok((false, false))
            }
        }
    }
}

fn collect_extracted(template: &Template, scope: &VariableScope) -> HashMap<String, String> {
    template
        .requests
        .iter()
        .flat_map(|r| r.extractors.iter())
        .filter_map(|e| e.name.as_deref())
        .filter_map(|name| scope.get(name).map(|v| (name.to_string(), v.render())))
        .collect()
}
