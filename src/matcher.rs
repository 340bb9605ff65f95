//! 匹配器求值
//!
//! `check_matchers` 按 and/or 合并一组匹配器的结果。单个匹配器出错
//! （无效正则、无效选择器、DSL结果不是布尔值）只记录日志并视为不匹配。

use log::{debug, error};
use regex::Regex;
use std::collections::HashMap;

use crate::dsl::DslEvaluator;
use crate::match_context::MatchContext;
use crate::selectors::{json_path_values, xpath_values};
use crate::template::{Condition, Matcher, MatcherKind, Part, VarValue};
use crate::{Result, ScanError};

/// 长度比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    /// 解析 `== = != > >= < <=`，其他值（包括空值和and/or）按 `==` 处理
    pub fn parse(op: Option<&str>) -> Self {
        match op.map(str::trim) {
            Some("!=") => Comparison::Ne,
            Some(">") => Comparison::Gt,
            Some(">=") => Comparison::Ge,
            Some("<") => Comparison::Lt,
            Some("<=") => Comparison::Le,
            _ => Comparison::Eq,
        }
    }

    pub fn apply(&self, actual: usize, expected: usize) -> bool {
        match self {
            Comparison::Eq => actual == expected,
            Comparison::Ne => actual != expected,
            Comparison::Gt => actual > expected,
            Comparison::Ge => actual >= expected,
            Comparison::Lt => actual < expected,
            Comparison::Le => actual <= expected,
        }
    }
}

/// 评估匹配器列表；空列表恒为真
pub fn check_matchers(matchers: &[Matcher], condition: Condition, ctx: &MatchContext) -> bool {
    check_matchers_with_vars(matchers, condition, ctx, &HashMap::new())
}

/// 同 `check_matchers`，DSL表达式可以引用作用域变量
pub fn check_matchers_with_vars(
    matchers: &[Matcher],
    condition: Condition,
    ctx: &MatchContext,
    vars: &HashMap<String, VarValue>,
) -> bool {
    let results = matchers.iter().enumerate().map(|(index, matcher)| {
        let matched = match check_single_matcher(matcher, ctx, vars) {
            Ok(matched) => matched,
            Err(e) => {
                error!("匹配器 {} ({:?}) 求值失败: {}", matcher_label(matcher, index), matcher.kind, e);
                false
            }
        };
        debug!("匹配器 {} ({:?}) 结果: {}", matcher_label(matcher, index), matcher.kind, matched);
        matched
    });

    condition.combine(results)
}

fn matcher_label(matcher: &Matcher, index: usize) -> String {
    matcher.name.clone().unwrap_or_else(|| format!("#{}", index + 1))
}

/// 评估单个匹配器，`negative` 会对结果取反
pub fn check_single_matcher(matcher: &Matcher, ctx: &MatchContext, vars: &HashMap<String, VarValue>) -> Result<bool> {
    let matched = match matcher.kind {
        MatcherKind::Status => match_status(matcher, ctx),
        MatcherKind::Word => match_words(matcher, ctx),
        MatcherKind::Regex => match_regex(matcher, ctx)?,
        MatcherKind::Size => match_size(matcher, ctx),
        MatcherKind::Dlength => match_dlength(matcher, ctx),
        MatcherKind::Binary => match_binary(matcher, ctx)?,
        MatcherKind::Xpath => match_xpath(matcher, ctx)?,
        MatcherKind::Jsonpath => match_jsonpath(matcher, ctx),
        MatcherKind::Dns => {
            let payload = ctx.dns.as_ref().map(|d| d.text());
            match_protocol_payload(matcher, payload.as_deref())?
        }
        MatcherKind::Network => {
            let payload = ctx.network.as_ref().map(|n| String::from_utf8_lossy(&n.data).into_owned());
            match_protocol_payload(matcher, payload.as_deref())?
        }
        MatcherKind::Headless => {
            let payload = ctx.headless.as_ref().map(|h| h.html.as_str());
            match_protocol_payload(matcher, payload)?
        }
        MatcherKind::Dsl => match_dsl(matcher, ctx, vars)?,
    };

    Ok(matched != matcher.negative)
}

pub fn match_status(matcher: &Matcher, ctx: &MatchContext) -> bool {
    match ctx.status() {
        Some(status) => matcher.status.contains(&status),
        None => false,
    }
}

/// 归一化：合并连续空白，统一引号
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        out.push(match ch {
            '\'' | '`' | '\u{2018}' | '\u{2019}' | '\u{201C}' | '\u{201D}' => '"',
            other => other,
        });
    }
    out
}

/// 在文本中按条件查找关键词
pub fn contains_words(text: &str, words: &[String], condition: Condition, nocase: bool) -> bool {
    if words.is_empty() {
        return false;
    }

    let prepare = |s: &str| {
        let normalized = normalize_text(s);
        if nocase {
            normalized.to_lowercase()
        } else {
            normalized
        }
    };

    let haystack = prepare(text);
    condition.combine(words.iter().map(|word| haystack.contains(&prepare(word))))
}

pub fn match_words(matcher: &Matcher, ctx: &MatchContext) -> bool {
    match ctx.part_text(matcher.part) {
        Some(text) => contains_words(&text, &matcher.words, matcher.word_condition(), matcher.nocase),
        None => false,
    }
}

/// 编译正则，nocase 时加 `(?i)` 前缀
pub fn compile_pattern(pattern: &str, nocase: bool) -> Result<Regex> {
    let source = if nocase && !pattern.starts_with("(?i)") {
        format!("(?i){}", pattern)
    } else {
        pattern.to_string()
    };
    Regex::new(&source).map_err(|e| ScanError::Matcher(format!("无效的正则表达式 {}: {}", pattern, e)))
}

/// 任一正则命中即为匹配；无效正则记录后跳过
fn any_regex(patterns: &[String], text: &str, nocase: bool) -> Result<bool> {
    let mut last_error = None;
    let mut valid = 0;
    for pattern in patterns {
        match compile_pattern(pattern, nocase) {
            Ok(re) => {
                valid += 1;
                if re.is_match(text) {
                    return Ok(true);
                }
            }
            Err(e) => {
                error!("{}", e);
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) if valid == 0 => Err(e),
        _ => Ok(false),
    }
}

pub fn match_regex(matcher: &Matcher, ctx: &MatchContext) -> Result<bool> {
    match ctx.part_text(matcher.part) {
        Some(text) => any_regex(&matcher.regex, &text, matcher.nocase),
        None => Ok(false),
    }
}

pub fn match_size(matcher: &Matcher, ctx: &MatchContext) -> bool {
    let length = match ctx.part_len(matcher.part) {
        Some(length) => length,
        None => return false,
    };
    let op = Comparison::parse(matcher.condition.as_deref());
    matcher.size.iter().any(|expected| op.apply(length, *expected))
}

pub fn match_dlength(matcher: &Matcher, ctx: &MatchContext) -> bool {
    match (matcher.dlength, ctx.part_len(matcher.part)) {
        (Some(expected), Some(length)) => Comparison::parse(matcher.condition.as_deref()).apply(length, expected),
        _ => false,
    }
}

/// 字节序列查找
pub fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// 二进制模式：合法十六进制按字节解码，否则按原始字节处理
fn binary_pattern(pattern: &str) -> Vec<u8> {
    let trimmed = pattern.trim();
    if trimmed.len() % 2 == 0 && !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        if let Ok(bytes) = hex::decode(trimmed) {
            return bytes;
        }
    }
    pattern.as_bytes().to_vec()
}

pub fn match_binary(matcher: &Matcher, ctx: &MatchContext) -> Result<bool> {
    let data = match ctx.part_bytes(matcher.part) {
        Some(data) => data,
        None => return Ok(false),
    };
    Ok(matcher
        .binary
        .iter()
        .any(|pattern| contains_bytes(&data, &binary_pattern(pattern))))
}

pub fn match_xpath(matcher: &Matcher, ctx: &MatchContext) -> Result<bool> {
    let html = match ctx.part_text(Part::Body) {
        Some(html) => html,
        None => return Ok(false),
    };
    for expression in &matcher.xpath {
        match xpath_values(&html, expression) {
            Ok(values) if !values.is_empty() => return Ok(true),
            Ok(_) => {}
            Err(e) => error!("{}", e),
        }
    }
    Ok(false)
}

pub fn match_jsonpath(matcher: &Matcher, ctx: &MatchContext) -> bool {
    let body = match ctx.part_text(Part::Body) {
        Some(body) => body,
        None => return false,
    };
    let json: serde_json::Value = match serde_json::from_str(&body) {
        Ok(json) => json,
        Err(e) => {
            debug!("响应不是合法的JSON: {}", e);
            return false;
        }
    };
    matcher
        .jsonpath
        .iter()
        .any(|path| !json_path_values(&json, path).is_empty())
}

/// dns/network/headless 匹配：pattern 正则、words 和 regex 中声明了的都必须满足
fn match_protocol_payload(matcher: &Matcher, payload: Option<&str>) -> Result<bool> {
    let payload = match payload {
        Some(payload) => payload,
        None => return Ok(false),
    };

    let mut checked = false;

    if let Some(pattern) = matcher.pattern.as_deref().filter(|p| !p.is_empty()) {
        checked = true;
        if !compile_pattern(pattern, matcher.nocase)?.is_match(payload) {
            return Ok(false);
        }
    }

    if !matcher.words.is_empty() {
        checked = true;
        if !contains_words(payload, &matcher.words, matcher.word_condition(), matcher.nocase) {
            return Ok(false);
        }
    }

    if !matcher.regex.is_empty() {
        checked = true;
        if !any_regex(&matcher.regex, payload, matcher.nocase)? {
            return Ok(false);
        }
    }

    Ok(checked)
}

pub fn match_dsl(matcher: &Matcher, ctx: &MatchContext, vars: &HashMap<String, VarValue>) -> Result<bool> {
    if matcher.dsl.is_empty() {
        return Ok(false);
    }

    let body = ctx.part_text(Part::Body).unwrap_or_default();
    let headers = ctx.part_text(Part::Header).unwrap_or_default();
    let evaluator = DslEvaluator::from_response(ctx.status(), &body, &headers).with_scope(vars);

    let condition = matcher.dsl_condition();
    for expression in &matcher.dsl {
        let result = evaluator
            .evaluate_bool(expression)
            .map_err(|e| ScanError::Dsl(format!("{}: {}", expression, e)))?;
        match condition {
            Condition::And if !result => return Ok(false),
            Condition::Or if result => return Ok(true),
            _ => {}
        }
    }
    Ok(condition == Condition::And)
}
