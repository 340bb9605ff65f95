//! HTTP 请求执行
//!
//! 依次请求每个候选URL：获取令牌桶许可、发送请求（瞬时错误按线性退避重试）、
//! 读取限长响应体并解压gzip，然后运行匹配器。未匹配时跟随页面中的
//! `top.location="..."` 跳转，跳转次数和已访问URL集合共同防止循环。

use flate2::read::GzDecoder;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION, USER_AGENT};
use reqwest::{Method, Response};
use std::collections::HashSet;
use std::io::Read;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::extractor::run_extractors;
use crate::match_context::{HttpCapture, MatchContext};
use crate::matcher::check_matchers_with_vars;
use crate::retry::{is_retryable_http_error, retry_with_backoff};
use crate::services::ScanServices;
use crate::template::Request;
use crate::template_engine::ExecutionContext;
use crate::variables::VariableScope;
use crate::{Result, ScanError};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

static JS_REDIRECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"top\.location(?:\.href)?\s*=\s*["']([^"']+)["']"#).expect("static redirect pattern")
});

/// 提取 `top.location="..."` 跳转目标
pub fn parse_js_redirect(body: &str) -> Option<String> {
    JS_REDIRECT
        .captures(body)
        .map(|caps| caps[1].trim().to_string())
        .filter(|target| !target.is_empty())
}

/// 绝对URL原样使用，其余相对 `base` 解析
pub fn build_full_url(base: &Url, path: &str) -> Result<String> {
    let path = path.trim();
    if path.starts_with("http://") || path.starts_with("https://") {
        return Url::parse(path)
            .map(|u| u.to_string())
            .map_err(|e| ScanError::InvalidRequest(format!("无效的URL {}: {}", path, e)));
    }
    base.join(path)
        .map(|u| u.to_string())
        .map_err(|e| ScanError::InvalidRequest(format!("无法解析路径 {}: {}", path, e)))
}

/// 已访问集合使用的归一化形式：去掉路径末尾的斜杠
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => {
            let host = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                (Some(host), None) => host.to_string(),
                _ => String::new(),
            };
            let query = url.query().map(|q| format!("?{}", q)).unwrap_or_default();
            format!("{}://{}{}{}", url.scheme(), host, url.path().trim_end_matches('/'), query)
        }
        Err(_) => raw.trim_end_matches('/').to_string(),
    }
}

/// 执行HTTP请求，任一候选URL匹配即返回true
pub async fn execute(ctx: &ExecutionContext<'_>, request: &Request, scope: &mut VariableScope) -> Result<bool> {
    let candidates: Vec<String> = if request.paths.is_empty() {
        vec![scope.substitute("{{BaseURL}}")]
    } else {
        request.paths.iter().map(|p| scope.substitute(p)).collect()
    };

    let max_redirects = ctx.services.settings.max_js_redirects;

    for raw in candidates {
        let mut url = match build_full_url(&ctx.target.url, &raw) {
            Ok(url) => url,
            Err(e) => {
                warn!("[{}] {}", ctx.template_id, e);
                continue;
            }
        };

        let mut visited = HashSet::new();
        let mut redirects = 0;

        loop {
            visited.insert(normalize_url(&url));

            let capture = match send_request(ctx.services, request, scope, &url, ctx.cancel).await {
                Ok(capture) => capture,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!("[{}] 请求 {} 失败: {}", ctx.template_id, url, e);
                    break;
                }
            };

            let body = String::from_utf8_lossy(&capture.body).into_owned();
            let match_ctx = MatchContext::from_http(capture);

            if check_matchers_with_vars(&request.matchers, request.matchers_condition, &match_ctx, scope.values()) {
                debug!("[{}] 匹配成功: {}", ctx.template_id, url);
                run_extractors(&request.extractors, &match_ctx, scope);
                return Ok(true);
            }

            let next = match parse_js_redirect(&body) {
                Some(next) if redirects < max_redirects => next,
                _ => break,
            };

            // 跳转地址相对目标URL解析
            let next_url = match build_full_url(&ctx.target.url, &next) {
                Ok(next_url) => next_url,
                Err(e) => {
                    debug!("[{}] 忽略无效跳转: {}", ctx.template_id, e);
                    break;
                }
            };

            if visited.contains(&normalize_url(&next_url)) {
                debug!("[{}] 检测到跳转循环: {}", ctx.template_id, next_url);
                break;
            }

            debug!("[{}] 跟随JS跳转 {} -> {}", ctx.template_id, url, next_url);
            redirects += 1;
            url = next_url;
        }
    }

    Ok(false)
}

fn build_headers(services: &ScanServices, request: &Request, scope: &VariableScope) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let user_agent = services.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

    for (key, value) in &request.headers {
        let value = scope.substitute(value);
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("忽略无效的请求头: {}", key),
        }
    }
    headers
}

/// 发送一次请求（含重试）并读取响应
pub async fn send_request(
    services: &ScanServices,
    request: &Request,
    scope: &VariableScope,
    url: &str,
    cancel: &CancellationToken,
) -> Result<HttpCapture> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| ScanError::InvalidRequest(format!("无效的HTTP方法: {}", request.method)))?;
    let parsed = Url::parse(url).map_err(|e| ScanError::InvalidRequest(format!("无效的URL {}: {}", url, e)))?;
    let host = parsed.host_str().unwrap_or_default().to_string();
    let headers = build_headers(services, request, scope);
    let body = request.body.as_ref().map(|b| scope.substitute(b));

    let settings = &services.settings;
    let host_ref = host.as_str();
    let outcome = retry_with_backoff(
        settings.retries,
        settings.retry_delay(),
        cancel,
        |attempt| {
            let mut builder = services
                .client
                .request(method.clone(), parsed.clone())
                .headers(headers.clone());
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }
            let label = format!("{} {}", method, parsed);
            async move {
                services.limiters.acquire(host_ref, cancel).await?;
                debug!("{} (第{}次尝试)", label, attempt + 1);
                builder.send().await.map_err(ScanError::from)
            }
        },
        |err: &ScanError| matches!(err, ScanError::Http(e) if is_retryable_http_error(e)),
    )
    .await?;

    if outcome.attempts > 1 {
        debug!("{} 共尝试 {} 次", url, outcome.attempts);
    }
    let response = outcome.result?;
    read_response(response, url, settings.max_body_size, cancel).await
}

async fn read_response(mut response: Response, url: &str, max_body_size: usize, cancel: &CancellationToken) -> Result<HttpCapture> {
    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect();
    let gzip = headers
        .iter()
        .any(|(name, value)| name.eq_ignore_ascii_case("content-encoding") && value.to_ascii_lowercase().contains("gzip"));

    let mut raw = Vec::new();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(ScanError::Canceled),
            chunk = response.chunk() => chunk?,
        };
        match chunk {
            Some(bytes) => {
                raw.extend_from_slice(&bytes);
                if raw.len() >= max_body_size {
                    raw.truncate(max_body_size);
                    break;
                }
            }
            None => break,
        }
    }

    let body = if gzip { gunzip(&raw, max_body_size)? } else { raw };

    Ok(HttpCapture {
        url: url.to_string(),
        status,
        headers,
        body,
    })
}

/// 解压gzip响应体，截断的数据保留已解出的部分
pub fn gunzip(data: &[u8], max_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = GzDecoder::new(data).take(max_size as u64);
    match decoder.read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(e) if !out.is_empty() => {
            debug!("gzip数据不完整，使用已解压的 {} 字节: {}", out.len(), e);
            Ok(out)
        }
        Err(e) => Err(ScanError::Network(format!("gzip解压失败: {}", e))),
    }
}

/// 抓取页面正文，供离线匹配使用
pub async fn fetch_page(services: &ScanServices, url: &str, cancel: &CancellationToken) -> Result<String> {
    let request = Request::http(vec![url.to_string()], Vec::new());
    let capture = send_request(services, &request, &VariableScope::new(), url, cancel).await?;
    Ok(String::from_utf8_lossy(&capture.body).into_owned())
}
