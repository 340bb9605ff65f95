//! 提取器
//!
//! 请求匹配后从响应中提取命名值并写入当前目标的变量作用域，
//! 供同一模板后续请求的 `{{name}}` 替换使用。

use base64::{engine::general_purpose, Engine as _};
use log::{debug, error, warn};
use std::collections::HashMap;

use crate::match_context::MatchContext;
use crate::matcher::compile_pattern;
use crate::selectors::{json_path_values, json_value_to_string, xpath_values};
use crate::template::{Extractor, ExtractorKind, Part};
use crate::variables::VariableScope;
use crate::{Result, ScanError};

/// 依次运行提取器，返回本次提取到的值
pub fn run_extractors(extractors: &[Extractor], ctx: &MatchContext, scope: &mut VariableScope) -> HashMap<String, String> {
    let mut extracted = HashMap::new();

    for extractor in extractors {
        let name = match extractor.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => {
                warn!("跳过未命名的 {:?} 提取器", extractor.kind);
                continue;
            }
        };

        match extract_value(extractor, ctx) {
            Ok(Some(value)) => {
                debug!("提取器 {} 提取到值: {}", name, value);
                scope.set(name.clone(), value.clone());
                extracted.insert(name, value);
            }
            Ok(None) => debug!("提取器 {} 未找到值", name),
            Err(e) => error!("提取器 {} 执行失败: {}", name, e),
        }
    }

    extracted
}

/// 提取第一个找到的值，按需进行base64解码
pub fn extract_value(extractor: &Extractor, ctx: &MatchContext) -> Result<Option<String>> {
    let value = match extractor.kind {
        ExtractorKind::Regex => extract_regex(extractor, ctx)?,
        ExtractorKind::Xpath => extract_xpath(extractor, ctx)?,
        ExtractorKind::Jsonpath => extract_jsonpath(extractor, ctx),
    };

    Ok(value.map(|v| if extractor.base64 { decode_base64(&v) } else { v }))
}

fn extract_regex(extractor: &Extractor, ctx: &MatchContext) -> Result<Option<String>> {
    let text = match ctx.part_text(extractor.part) {
        Some(text) => text,
        None => return Ok(None),
    };

    for pattern in &extractor.regex {
        let re = compile_pattern(pattern, extractor.nocase).map_err(|e| ScanError::Extractor(e.to_string()))?;
        let group = extractor
            .group
            .unwrap_or(if re.captures_len() > 1 { 1 } else { 0 });

        if let Some(caps) = re.captures(&text) {
            if let Some(m) = caps.get(group) {
                return Ok(Some(m.as_str().to_string()));
            }
        }
    }

    Ok(None)
}

fn extract_xpath(extractor: &Extractor, ctx: &MatchContext) -> Result<Option<String>> {
    let html = match ctx.part_text(Part::Body) {
        Some(html) => html,
        None => return Ok(None),
    };

    for expression in &extractor.xpath {
        let values = xpath_values(&html, expression).map_err(|e| ScanError::Extractor(e.to_string()))?;
        if let Some(value) = values.into_iter().find(|v| !v.is_empty()) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn extract_jsonpath(extractor: &Extractor, ctx: &MatchContext) -> Option<String> {
    let body = ctx.part_text(Part::Body)?;
    let json: serde_json::Value = serde_json::from_str(&body).ok()?;

    extractor
        .jsonpath
        .iter()
        .find_map(|path| json_path_values(&json, path).first().map(json_value_to_string))
}

/// base64解码，失败时保留原值
fn decode_base64(value: &str) -> String {
    let trimmed = value.trim();
    general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::URL_SAFE.decode(trimmed))
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_else(|e| {
            debug!("base64解码失败，保留原值: {}", e);
            value.to_string()
        })
}
