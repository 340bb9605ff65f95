//! 离线匹配
//!
//! 每个目标只抓取一次页面。只依赖页面正文的 word/regex 匹配器可以直接在这份
//! 快照上求值，不必为每个模板重新发起请求。快照只代表目标URL本身，
//! 请求其他路径的模板不会走离线匹配。

use log::debug;
use url::Url;

use crate::extractor::run_extractors;
use crate::http_probe::{build_full_url, normalize_url};
use crate::match_context::MatchContext;
use crate::matcher::check_matchers_with_vars;
use crate::template::{MatcherKind, Part, Request, RequestType};
use crate::variables::VariableScope;

/// 目标页面快照
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub url: String,
    pub body: Option<String>,
    /// 由浏览器渲染得到（而非原始HTTP响应）
    pub rendered: bool,
}

impl PageSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rendered(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: Some(body.into()),
            rendered: true,
        }
    }

    pub fn fetched(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: Some(body.into()),
            rendered: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.body.is_some()
    }
}

/// 离线匹配结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineVerdict {
    Matched,
    /// 快照足以判定不匹配
    Rejected,
    /// 需要实时请求
    Unavailable,
}

/// 请求的所有匹配器都是针对正文的 word/regex
pub fn can_offline_match(request: &Request) -> bool {
    matches!(request.request_type, RequestType::Http | RequestType::Headless)
        && !request.matchers.is_empty()
        && request
            .matchers
            .iter()
            .all(|m| matches!(m.kind, MatcherKind::Word | MatcherKind::Regex) && m.part == Part::Body)
}

/// 请求的每个路径都指向快照所在的URL
pub fn targets_snapshot(request: &Request, scope: &VariableScope, base: &Url, snapshot_url: &str) -> bool {
    let expected = normalize_url(snapshot_url);
    if request.paths.is_empty() {
        return normalize_url(&scope.substitute("{{BaseURL}}")) == expected;
    }
    request.paths.iter().all(|path| {
        build_full_url(base, &scope.substitute(path))
            .map(|url| normalize_url(&url) == expected)
            .unwrap_or(false)
    })
}

/// 在快照上评估请求；匹配时运行提取器
pub fn match_offline(request: &Request, snapshot: &PageSnapshot, scope: &mut VariableScope, base: &Url) -> OfflineVerdict {
    let body = match snapshot.body.as_deref() {
        Some(body) => body,
        None => return OfflineVerdict::Unavailable,
    };
    if !can_offline_match(request) || !targets_snapshot(request, scope, base, &snapshot.url) {
        return OfflineVerdict::Unavailable;
    }

    let ctx = MatchContext::from_page_body(body);
    if check_matchers_with_vars(&request.matchers, request.matchers_condition, &ctx, scope.values()) {
        debug!("离线匹配成功: {}", snapshot.url);
        run_extractors(&request.extractors, &ctx, scope);
        return OfflineVerdict::Matched;
    }

    // 原始HTTP响应可能与渲染结果不同，只有渲染快照能否定headless请求
    if request.request_type == RequestType::Headless && snapshot.rendered {
        OfflineVerdict::Rejected
    } else {
        OfflineVerdict::Unavailable
    }
}
