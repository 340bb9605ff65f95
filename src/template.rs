//! 检测模板的数据结构定义
//!
//! 本模块定义了YAML检测模板的内存表示：模板信息、变量、按协议分类的请求块、
//! 匹配器和提取器。原始YAML先反序列化为 `TemplateDocument`，再规范化为
//! 不可变的 `Template`，其中所有请求块合并为一个有序的 `requests` 列表。

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::flow::Flow;
use crate::{Result, ScanError};

/// 模板严重性等级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// 信息级别
    Info,
    /// 低危
    Low,
    /// 中危
    Medium,
    /// 高危
    High,
    /// 严重
    Critical,
    /// 未知或未声明
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// 作者信息类型（支持字符串或字符串数组）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AuthorInfo {
    /// 单个作者（字符串）
    Single(String),
    /// 多个作者（字符串数组）
    Multiple(Vec<String>),
}

impl fmt::Display for AuthorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorInfo::Single(author) => write!(f, "{}", author),
            AuthorInfo::Multiple(authors) => write!(f, "{}", authors.join(", ")),
        }
    }
}

/// 标签信息类型（逗号分隔的字符串或字符串数组）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TagsInfo {
    Single(String),
    Multiple(Vec<String>),
}

impl TagsInfo {
    /// 展开为去除空白后的标签列表
    pub fn to_vec(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            TagsInfo::Single(tags) => tags.split(',').collect(),
            TagsInfo::Multiple(tags) => tags.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// 模板信息块
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateInfo {
    /// 模板名称
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub author: Option<AuthorInfo>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub description: Option<String>,
    /// 参考链接
    #[serde(default, deserialize_with = "one_or_many")]
    pub reference: Vec<String>,
    #[serde(default)]
    pub tags: Option<TagsInfo>,
}

/// 变量与载荷的值：标量、列表或列表映射
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VarValue {
    Scalar(String),
    List(Vec<String>),
    Nested(BTreeMap<String, Vec<String>>),
}

impl VarValue {
    /// 替换时使用的文本形式，列表以逗号连接
    pub fn render(&self) -> String {
        match self {
            VarValue::Scalar(value) => value.clone(),
            VarValue::List(values) => values.join(","),
            VarValue::Nested(map) => map
                .values()
                .flatten()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// 载荷选择：标量本身，列表的第一个元素，映射中按键序第一个非空列表的第一个元素
    pub fn first(&self) -> Option<String> {
        match self {
            VarValue::Scalar(value) => Some(value.clone()),
            VarValue::List(values) => values.first().cloned(),
            VarValue::Nested(map) => map.values().find_map(|values| values.first().cloned()),
        }
    }

    fn from_yaml(value: serde_yaml::Value) -> std::result::Result<Self, String> {
        match value {
            serde_yaml::Value::Sequence(items) => items
                .into_iter()
                .map(scalar_text)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(VarValue::List),
            serde_yaml::Value::Mapping(mapping) => {
                let mut nested = BTreeMap::new();
                for (key, value) in mapping {
                    let key = scalar_text(key)?;
                    let values = match value {
                        serde_yaml::Value::Sequence(items) => items
                            .into_iter()
                            .map(scalar_text)
                            .collect::<std::result::Result<Vec<_>, _>>()?,
                        other => vec![scalar_text(other)?],
                    };
                    nested.insert(key, values);
                }
                Ok(VarValue::Nested(nested))
            }
            serde_yaml::Value::Tagged(tagged) => VarValue::from_yaml(tagged.value),
            scalar => scalar_text(scalar).map(VarValue::Scalar),
        }
    }
}

impl From<&str> for VarValue {
    fn from(value: &str) -> Self {
        VarValue::Scalar(value.to_string())
    }
}

impl From<String> for VarValue {
    fn from(value: String) -> Self {
        VarValue::Scalar(value)
    }
}

impl<'de> Deserialize<'de> for VarValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        VarValue::from_yaml(value).map_err(de::Error::custom)
    }
}

fn scalar_text(value: serde_yaml::Value) -> std::result::Result<String, String> {
    match value {
        serde_yaml::Value::Null => Ok(String::new()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Tagged(tagged) => scalar_text(tagged.value),
        other => Err(format!("expected a scalar value, found {:?}", other)),
    }
}

/// 请求协议类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Http,
    Dns,
    Network,
    Headless,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Http => "http",
            RequestType::Dns => "dns",
            RequestType::Network => "network",
            RequestType::Headless => "headless",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(RequestType::Http),
            "dns" => Ok(RequestType::Dns),
            "network" | "tcp" => Ok(RequestType::Network),
            "headless" => Ok(RequestType::Headless),
            other => Err(ScanError::InvalidRequest(format!("unknown request type: {}", other))),
        }
    }
}

/// 匹配条件（and/or），大小写不敏感，默认and
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    #[default]
    And,
    Or,
}

impl Condition {
    pub fn parse_lossy(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "or" => Condition::Or,
            _ => Condition::And,
        }
    }

    /// 按条件合并一组布尔结果；空集合视为真
    ///
    /// 迭代器按需求值，`and` 遇假、`or` 遇真即停止。
    pub fn combine<I: IntoIterator<Item = bool>>(&self, results: I) -> bool {
        let mut results = results.into_iter().peekable();
        if results.peek().is_none() {
            return true;
        }
        match self {
            Condition::And => results.all(|r| r),
            Condition::Or => results.any(|r| r),
        }
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(Condition::parse_lossy(raw.as_deref()))
    }
}

/// 匹配器/提取器作用的响应部分
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Part {
    #[default]
    Body,
    Header,
    All,
    Status,
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw.map(|p| p.trim().to_ascii_lowercase()).as_deref() {
            Some("header") | Some("headers") | Some("all_headers") => Part::Header,
            Some("all") | Some("response") => Part::All,
            Some("status") | Some("status_code") => Part::Status,
            _ => Part::Body,
        })
    }
}

/// 匹配器类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    Status,
    Word,
    Regex,
    Size,
    Dlength,
    Binary,
    Xpath,
    #[serde(alias = "json")]
    Jsonpath,
    Dns,
    Network,
    Headless,
    Dsl,
}

/// 匹配器定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(rename = "type")]
    pub kind: MatcherKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub part: Part,
    #[serde(default, deserialize_with = "one_or_many")]
    pub words: Vec<String>,
    /// 词/DSL的and/or条件，dlength与size的比较运算符
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default, alias = "case-insensitive")]
    pub nocase: bool,
    #[serde(default, deserialize_with = "one_or_many")]
    pub regex: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub status: Vec<u16>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub size: Vec<usize>,
    #[serde(default)]
    pub dlength: Option<usize>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub binary: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub xpath: Vec<String>,
    #[serde(default, alias = "json", deserialize_with = "one_or_many")]
    pub jsonpath: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub dsl: Vec<String>,
    /// 结果取反
    #[serde(default)]
    pub negative: bool,
}

impl Matcher {
    /// 构造只设置类型的匹配器，其余字段为空
    pub fn new(kind: MatcherKind) -> Self {
        Self {
            kind,
            name: None,
            part: Part::Body,
            words: Vec::new(),
            condition: None,
            nocase: false,
            regex: Vec::new(),
            status: Vec::new(),
            size: Vec::new(),
            dlength: None,
            binary: Vec::new(),
            xpath: Vec::new(),
            jsonpath: Vec::new(),
            pattern: None,
            dsl: Vec::new(),
            negative: false,
        }
    }

    /// 关键词之间的条件，未声明时为or
    pub fn word_condition(&self) -> Condition {
        match self.condition.as_deref() {
            Some(_) => Condition::parse_lossy(self.condition.as_deref()),
            None => Condition::Or,
        }
    }

    /// 多个DSL表达式之间的条件，未声明时为and
    pub fn dsl_condition(&self) -> Condition {
        Condition::parse_lossy(self.condition.as_deref())
    }
}

/// 提取器类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    Regex,
    Xpath,
    #[serde(alias = "json")]
    Jsonpath,
}

/// 提取器定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extractor {
    #[serde(rename = "type")]
    pub kind: ExtractorKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub part: Part,
    #[serde(default, deserialize_with = "one_or_many")]
    pub regex: Vec<String>,
    #[serde(default, deserialize_with = "lenient_index")]
    pub group: Option<usize>,
    #[serde(default, alias = "case-insensitive")]
    pub nocase: bool,
    #[serde(default, deserialize_with = "one_or_many")]
    pub xpath: Vec<String>,
    #[serde(default, alias = "json", deserialize_with = "one_or_many")]
    pub jsonpath: Vec<String>,
    #[serde(default)]
    pub base64: bool,
}

/// YAML中的原始请求块
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRequest {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub path: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    #[serde(default, rename = "matchers-condition")]
    pub matchers_condition: Condition,
    #[serde(default)]
    pub extractors: Vec<Extractor>,
    #[serde(default)]
    pub payloads: BTreeMap<String, VarValue>,
    #[serde(default)]
    pub options: BTreeMap<String, VarValue>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub host: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// 规范化后的请求
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub request_type: RequestType,
    pub method: String,
    pub paths: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub matchers: Vec<Matcher>,
    pub matchers_condition: Condition,
    pub extractors: Vec<Extractor>,
    pub payloads: BTreeMap<String, VarValue>,
    pub options: BTreeMap<String, VarValue>,
    pub hosts: Vec<String>,
    /// DNS查询名
    pub name: Option<String>,
    /// DNS记录类型（dns块中 `type: CNAME` 这样的写法）
    pub query_type: Option<String>,
}

impl Request {
    /// 从原始块构造请求，`block` 为声明该请求的块类型
    pub fn from_raw(raw: RawRequest, block: Option<RequestType>) -> Result<Self> {
        let declared = raw.kind.as_deref().map(str::trim).filter(|k| !k.is_empty());

        let (request_type, query_type) = match (block, declared) {
            (Some(RequestType::Dns), Some(kind)) if !kind.eq_ignore_ascii_case("dns") => {
                (RequestType::Dns, Some(kind.to_ascii_uppercase()))
            }
            (Some(block), Some(kind)) => {
                let parsed = kind.parse::<RequestType>()?;
                if parsed != block {
                    return Err(ScanError::InvalidRequest(format!(
                        "request declared as {} inside a {} block",
                        parsed, block
                    )));
                }
                (block, None)
            }
            (Some(block), None) => (block, None),
            // 旧式 `requests` 块：按声明的类型推断，默认http
            (None, Some(kind)) => match kind.parse::<RequestType>() {
                Ok(parsed) => (parsed, None),
                Err(_) if is_record_type(kind) => (RequestType::Dns, Some(kind.to_ascii_uppercase())),
                Err(e) => return Err(e),
            },
            (None, None) => (RequestType::Http, None),
        };

        Ok(Self {
            request_type,
            method: raw
                .method
                .map(|m| m.trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "GET".to_string()),
            paths: raw.path,
            headers: raw.headers,
            body: raw.body,
            matchers: raw.matchers,
            matchers_condition: raw.matchers_condition,
            extractors: raw.extractors,
            payloads: raw.payloads,
            options: raw.options,
            hosts: raw.host,
            name: raw.name,
            query_type,
        })
    }

    /// 便于测试和程序化构造的最小HTTP请求
    pub fn http(paths: Vec<String>, matchers: Vec<Matcher>) -> Self {
        Self {
            request_type: RequestType::Http,
            method: "GET".to_string(),
            paths,
            headers: BTreeMap::new(),
            body: None,
            matchers,
            matchers_condition: Condition::And,
            extractors: Vec::new(),
            payloads: BTreeMap::new(),
            options: BTreeMap::new(),
            hosts: Vec::new(),
            name: None,
            query_type: None,
        }
    }

    pub fn option(&self, key: &str) -> Option<String> {
        self.options.get(key).and_then(VarValue::first)
    }
}

fn is_record_type(kind: &str) -> bool {
    kind.len() <= 10 && kind.chars().all(|c| c.is_ascii_alphanumeric()) && kind.chars().any(|c| c.is_ascii_uppercase())
}

/// 模板文件的原始反序列化结构
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateDocument {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub info: TemplateInfo,
    #[serde(default)]
    pub metadata: HashMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub classification: HashMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub variables: BTreeMap<String, VarValue>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(default)]
    pub http: Vec<RawRequest>,
    /// 旧式请求块
    #[serde(default)]
    pub requests: Vec<RawRequest>,
    #[serde(default)]
    pub dns: Vec<RawRequest>,
    #[serde(default, alias = "tcp")]
    pub network: Vec<RawRequest>,
    #[serde(default)]
    pub headless: Vec<RawRequest>,
}

impl TemplateDocument {
    pub fn request_block_count(&self) -> usize {
        self.http.len() + self.requests.len() + self.dns.len() + self.network.len() + self.headless.len()
    }
}

/// 规范化的检测模板，加载后不可变
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: String,
    pub info: TemplateInfo,
    pub metadata: HashMap<String, serde_yaml::Value>,
    pub classification: HashMap<String, serde_yaml::Value>,
    pub variables: BTreeMap<String, VarValue>,
    pub hosts: Vec<String>,
    pub flow: Option<String>,
    pub requests: Vec<Request>,
}

impl Template {
    /// 从YAML内容解析模板
    pub fn from_yaml(yaml_content: &str) -> Result<Self> {
        let document: TemplateDocument = serde_yaml::from_str(yaml_content)?;
        Self::from_document(document, None)
    }

    /// 规范化原始文档：按 http、requests、dns、network、headless 的顺序合并请求
    pub fn from_document(document: TemplateDocument, fallback_id: Option<&str>) -> Result<Self> {
        let block_count = document.request_block_count();
        let id = document
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .or_else(|| fallback_id.map(str::to_string))
            .ok_or_else(|| ScanError::InvalidInput("template has no id".to_string()))?;
        if block_count == 0 {
            return Err(ScanError::InvalidInput(format!("template {} declares no requests", id)));
        }

        let blocks = [
            (Some(RequestType::Http), document.http),
            (None, document.requests),
            (Some(RequestType::Dns), document.dns),
            (Some(RequestType::Network), document.network),
            (Some(RequestType::Headless), document.headless),
        ];

        let mut requests = Vec::with_capacity(block_count);
        for (block, raws) in blocks {
            for raw in raws {
                requests.push(Request::from_raw(raw, block)?);
            }
        }

        let flow = document.flow.map(|f| f.trim().to_string()).filter(|f| !f.is_empty());
        if let Some(expr) = &flow {
            Flow::parse(expr, &requests)?;
        }

        Ok(Self {
            id,
            info: document.info,
            metadata: document.metadata,
            classification: document.classification,
            variables: document.variables,
            hosts: document.hosts.into_iter().filter(|h| !h.trim().is_empty()).collect(),
            flow,
            requests,
        })
    }

    /// 获取模板标签
    pub fn tags(&self) -> Vec<String> {
        self.info.tags.as_ref().map(TagsInfo::to_vec).unwrap_or_default()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// 主机白名单：为空时适用于所有主机，否则按子串匹配主机名
    pub fn applies_to_host(&self, hostname: &str) -> bool {
        self.hosts.is_empty() || self.hosts.iter().any(|h| hostname.contains(h.trim()))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

/// 字段既可写成单值也可写成列表
fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IndexValue {
    Number(usize),
    Text(String),
}

fn lenient_index<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<IndexValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IndexValue::Number(n)) => Ok(Some(n)),
        Some(IndexValue::Text(s)) => s.trim().parse().map(Some).map_err(de::Error::custom),
    }
}
