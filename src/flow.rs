//! 请求流程表达式
//!
//! 流程是由 `&&` 连接的步骤序列，例如 `http(1) && http(2)`。
//! 索引从1开始，指向模板规范化后的 `requests` 列表。

use once_cell::sync::Lazy;
use regex::Regex;

use crate::template::{Request, RequestType};
use crate::{Result, ScanError};

static STEP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)(http|dns|network|headless)\s*\(\s*(\d+)\s*\)$").expect("static flow pattern")
});

/// 流程中的一个步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStep {
    pub protocol: RequestType,
    /// `requests` 中从0开始的位置
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub steps: Vec<FlowStep>,
}

impl Flow {
    /// 解析流程表达式并校验每个索引都落在 `requests` 范围内
    pub fn parse(expression: &str, requests: &[Request]) -> Result<Self> {
        let mut steps = Vec::new();

        for raw in expression.split("&&") {
            let part = raw.trim();
            let caps = STEP_PATTERN
                .captures(part)
                .ok_or_else(|| ScanError::Flow(format!("无法解析流程步骤: '{}'", part)))?;

            let protocol: RequestType = caps[1].parse()?;
            let position: usize = caps[2]
                .parse()
                .map_err(|_| ScanError::Flow(format!("无效的请求索引: {}", &caps[2])))?;

            if position == 0 || position > requests.len() {
                return Err(ScanError::Flow(format!(
                    "请求索引 {} 超出范围 (共 {} 个请求)",
                    position,
                    requests.len()
                )));
            }

            let index = position - 1;
            let actual = requests[index].request_type;
            if actual != protocol {
                return Err(ScanError::Flow(format!(
                    "步骤 {}({}) 指向的请求类型为 {}",
                    protocol, position, actual
                )));
            }

            steps.push(FlowStep { protocol, index });
        }

        Ok(Self { steps })
    }
}
