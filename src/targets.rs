//! 扫描目标解析

use std::fmt;
use std::path::Path;
use url::Url;

use crate::{Result, ScanError};

/// 单个扫描目标。没有协议的输入默认使用 `https://`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub raw: String,
    pub url: Url,
}

impl ScanTarget {
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(ScanError::InvalidTarget("空目标".to_string()));
        }

        let candidate = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{}", raw)
        };

        let url = Url::parse(&candidate).map_err(|e| ScanError::InvalidTarget(format!("{}: {}", raw, e)))?;
        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(ScanError::InvalidTarget(format!("{}: 缺少主机名", raw))),
        }

        Ok(Self {
            raw: raw.to_string(),
            url,
        })
    }

    pub fn hostname(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// 主机名加非默认端口
    pub fn host(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.hostname(), port),
            None => self.hostname().to_string(),
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// 按行解析目标列表，跳过空行和 `#` 注释；无效行作为错误单独返回
pub fn parse_targets(text: &str) -> (Vec<ScanTarget>, Vec<ScanError>) {
    let mut targets = Vec::new();
    let mut errors = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match ScanTarget::parse(line) {
            Ok(target) => targets.push(target),
            Err(e) => errors.push(e),
        }
    }

    (targets, errors)
}

pub fn load_targets(path: &Path) -> Result<(Vec<ScanTarget>, Vec<ScanError>)> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_targets(&text))
}
