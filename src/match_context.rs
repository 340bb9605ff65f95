//! 匹配上下文
//!
//! 每次请求产生一个 `MatchContext`，只填充与该请求协议相关的部分。

use std::borrow::Cow;
use std::time::Duration;

use crate::template::Part;

/// HTTP响应
#[derive(Debug, Clone, Default)]
pub struct HttpCapture {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// DNS查询结果
#[derive(Debug, Clone, Default)]
pub struct DnsCapture {
    pub query: String,
    pub query_type: String,
    pub records: Vec<String>,
}

impl DnsCapture {
    pub fn text(&self) -> String {
        self.records.join("\n")
    }
}

/// 原始网络连接收到的数据
#[derive(Debug, Clone, Default)]
pub struct NetworkCapture {
    pub address: String,
    pub data: Vec<u8>,
}

/// 浏览器渲染后的页面
#[derive(Debug, Clone, Default)]
pub struct HeadlessCapture {
    pub url: String,
    pub html: String,
    pub render_time: Duration,
}

/// 页面视图：HTTP响应或渲染页面的统一读取方式
#[derive(Debug, Clone, Copy)]
pub struct PageView<'a> {
    pub status: Option<u16>,
    pub headers: &'a [(String, String)],
    pub body: &'a [u8],
}

impl<'a> PageView<'a> {
    /// 每行一个 `name: value`，同名头的多个值以逗号连接
    pub fn header_text(&self) -> String {
        let mut merged: Vec<(String, Vec<&str>)> = Vec::new();
        for (name, value) in self.headers {
            match merged.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
                Some((_, values)) => values.push(value),
                None => merged.push((name.clone(), vec![value.as_str()])),
            }
        }
        merged
            .into_iter()
            .map(|(name, values)| format!("{}: {}", name, values.join(",")))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn header_len(&self) -> usize {
        self.headers.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    pub http: Option<HttpCapture>,
    pub dns: Option<DnsCapture>,
    pub network: Option<NetworkCapture>,
    pub headless: Option<HeadlessCapture>,
}

impl MatchContext {
    pub fn from_http(capture: HttpCapture) -> Self {
        Self { http: Some(capture), ..Default::default() }
    }

    pub fn from_dns(capture: DnsCapture) -> Self {
        Self { dns: Some(capture), ..Default::default() }
    }

    pub fn from_network(capture: NetworkCapture) -> Self {
        Self { network: Some(capture), ..Default::default() }
    }

    pub fn from_headless(capture: HeadlessCapture) -> Self {
        Self { headless: Some(capture), ..Default::default() }
    }

    /// 仅有页面内容的上下文（离线匹配）
    pub fn from_page_body(body: &str) -> Self {
        Self::from_headless(HeadlessCapture {
            html: body.to_string(),
            ..Default::default()
        })
    }

    pub fn page(&self) -> Option<PageView<'_>> {
        if let Some(http) = &self.http {
            return Some(PageView {
                status: Some(http.status),
                headers: &http.headers,
                body: &http.body,
            });
        }
        self.headless.as_ref().map(|page| PageView {
            status: None,
            headers: &[],
            body: page.html.as_bytes(),
        })
    }

    /// DNS或网络请求的原始载荷
    fn payload(&self) -> Option<Cow<'_, [u8]>> {
        if let Some(dns) = &self.dns {
            return Some(Cow::Owned(dns.text().into_bytes()));
        }
        self.network.as_ref().map(|n| Cow::Borrowed(n.data.as_slice()))
    }

    /// 按部分取字节内容，该部分不存在时返回 None
    pub fn part_bytes(&self, part: Part) -> Option<Cow<'_, [u8]>> {
        if let Some(page) = self.page() {
            return match part {
                Part::Body => Some(Cow::Borrowed(page.body)),
                Part::Header => Some(Cow::Owned(page.header_text().into_bytes())),
                Part::All => {
                    let mut all = page.body.to_vec();
                    all.push(b'\n');
                    all.extend_from_slice(page.header_text().as_bytes());
                    Some(Cow::Owned(all))
                }
                Part::Status => page.status.map(|s| Cow::Owned(s.to_string().into_bytes())),
            };
        }

        match part {
            Part::Body | Part::All => self.payload(),
            Part::Header | Part::Status => None,
        }
    }

    pub fn part_text(&self, part: Part) -> Option<String> {
        self.part_bytes(part)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// 按部分计算长度
    pub fn part_len(&self, part: Part) -> Option<usize> {
        if let Some(page) = self.page() {
            return match part {
                Part::Body => Some(page.body.len()),
                Part::Header => Some(page.header_len()),
                Part::All => Some(page.body.len() + page.header_len()),
                Part::Status => None,
            };
        }
        self.part_bytes(part).map(|bytes| bytes.len())
    }

    pub fn status(&self) -> Option<u16> {
        self.page().and_then(|page| page.status)
    }
}
