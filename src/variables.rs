//! `{{name}}` 占位符替换与每个目标独立的变量作用域

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use url::Url;

use crate::template::{Template, VarValue};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("static placeholder pattern"));

/// 替换字符串中所有已知的占位符，未知占位符原样保留
pub fn substitute(input: &str, vars: &HashMap<String, VarValue>) -> String {
    if !input.contains("{{") {
        return input.to_string();
    }

    PLACEHOLDER
        .replace_all(input, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.render(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// 一次模板评估使用的变量集合
///
/// 从模板声明的变量克隆而来，提取器只写入这里，不会影响模板本身
/// 或其他目标上的并发评估。
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    values: HashMap<String, VarValue>,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_template(template: &Template) -> Self {
        Self {
            values: template
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<VarValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.values.get(name)
    }

    pub fn values(&self) -> &HashMap<String, VarValue> {
        &self.values
    }

    pub fn substitute(&self, input: &str) -> String {
        substitute(input, &self.values)
    }

    /// 写入由目标URL派生的变量：BaseURL、RootURL、Host、Hostname、Port、Scheme
    pub fn bind_target(&mut self, url: &Url) {
        let hostname = url.host_str().unwrap_or_default().to_string();
        let host = match url.port() {
            Some(port) => format!("{}:{}", hostname, port),
            None => hostname.clone(),
        };
        let base = format!("{}://{}", url.scheme(), host);
        let port = url
            .port_or_known_default()
            .map(|p| p.to_string())
            .unwrap_or_default();

        self.set("BaseURL", base.clone());
        self.set("RootURL", base);
        self.set("Host", host);
        self.set("Hostname", hostname);
        self.set("Port", port);
        self.set("Scheme", url.scheme());
    }
}
