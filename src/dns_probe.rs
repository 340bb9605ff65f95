//! DNS 请求执行

use async_trait::async_trait;
use log::{debug, info};
use std::fmt;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::proto::rr::{RData, RecordType};
use trust_dns_resolver::TokioAsyncResolver;

use crate::extractor::run_extractors;
use crate::match_context::{DnsCapture, MatchContext};
use crate::matcher::check_matchers_with_vars;
use crate::template::Request;
use crate::template_engine::ExecutionContext;
use crate::variables::VariableScope;
use crate::{Result, ScanError};

/// 支持的查询类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsQueryType {
    A,
    Aaaa,
    Txt,
    Cname,
    Ns,
    Mx,
}

impl DnsQueryType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "A" => Some(DnsQueryType::A),
            "AAAA" => Some(DnsQueryType::Aaaa),
            "TXT" => Some(DnsQueryType::Txt),
            "CNAME" => Some(DnsQueryType::Cname),
            "NS" => Some(DnsQueryType::Ns),
            "MX" => Some(DnsQueryType::Mx),
            _ => None,
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            DnsQueryType::A => RecordType::A,
            DnsQueryType::Aaaa => RecordType::AAAA,
            DnsQueryType::Txt => RecordType::TXT,
            DnsQueryType::Cname => RecordType::CNAME,
            DnsQueryType::Ns => RecordType::NS,
            DnsQueryType::Mx => RecordType::MX,
        }
    }
}

impl fmt::Display for DnsQueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.record_type(), f)
    }
}

/// 记录解析接口，返回文本形式的记录值
#[async_trait]
pub trait RecordResolver: Send + Sync {
    async fn lookup(&self, name: &str, query_type: DnsQueryType) -> Result<Vec<String>>;
}

/// 系统DNS解析器
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordResolver for SystemResolver {
    async fn lookup(&self, name: &str, query_type: DnsQueryType) -> Result<Vec<String>> {
        let response = match self.resolver.lookup(name, query_type.record_type()).await {
            Ok(response) => response,
            Err(e) => {
                if let ResolveErrorKind::NoRecordsFound { .. } = e.kind() {
                    return Ok(Vec::new());
                }
                return Err(ScanError::Dns(format!("{} {} 查询失败: {}", name, query_type, e)));
            }
        };

        Ok(response.iter().filter_map(record_text).collect())
    }
}

fn record_text(record: &RData) -> Option<String> {
    let text = match record {
        RData::MX(mx) => mx.exchange().to_string(),
        RData::TXT(txt) => txt
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect::<Vec<_>>()
            .join(""),
        other => other.to_string(),
    };
    let text = text.trim_end_matches('.').to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// 执行DNS请求：对目标主机名发起一次查询
pub async fn execute(ctx: &ExecutionContext<'_>, request: &Request, scope: &mut VariableScope) -> Result<bool> {
    let raw_type = request
        .query_type
        .clone()
        .or_else(|| request.paths.first().map(|p| scope.substitute(p)))
        .unwrap_or_else(|| "A".to_string());

    let query_type = match DnsQueryType::parse(&raw_type) {
        Some(query_type) => query_type,
        None => {
            info!("[{}] 不支持的DNS查询类型: {}", ctx.template_id, raw_type);
            return Ok(false);
        }
    };

    let name = request
        .name
        .as_deref()
        .map(|n| scope.substitute(n))
        .unwrap_or_else(|| ctx.target.hostname().to_string())
        .trim()
        .trim_end_matches('.')
        .to_string();
    if name.is_empty() || name.contains("{{") {
        return Err(ScanError::InvalidTarget(format!("{} 没有主机名", ctx.target)));
    }

    let lookup = ctx.services.resolver.lookup(&name, query_type);
    let records = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(ScanError::Canceled),
        records = lookup => records?,
    };
    debug!("[{}] {} {} -> {:?}", ctx.template_id, query_type, name, records);

    let match_ctx = MatchContext::from_dns(DnsCapture {
        query: name,
        query_type: query_type.to_string(),
        records,
    });

    if check_matchers_with_vars(&request.matchers, request.matchers_condition, &match_ctx, scope.values()) {
        run_extractors(&request.extractors, &match_ctx, scope);
        return Ok(true);
    }
    Ok(false)
}
