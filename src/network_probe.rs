//! 原始 TCP/UDP 请求执行

use log::debug;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::extractor::run_extractors;
use crate::match_context::{MatchContext, NetworkCapture};
use crate::matcher::check_matchers_with_vars;
use crate::template::{Request, VarValue};
use crate::template_engine::ExecutionContext;
use crate::variables::VariableScope;
use crate::{Result, ScanError};

pub const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("tcp") => Ok(Transport::Tcp),
            Some("udp") => Ok(Transport::Udp),
            Some(other) => Err(ScanError::InvalidRequest(format!("不支持的网络协议: {}", other))),
        }
    }
}

/// 待发送的载荷：优先 `data` 载荷，其次按键序第一个载荷，最后是请求体
pub fn payload_for_send(request: &Request) -> Option<String> {
    request
        .payloads
        .get("data")
        .or_else(|| request.payloads.values().next())
        .and_then(VarValue::first)
        .or_else(|| request.body.clone())
        .filter(|p| !p.is_empty())
}

/// 连接目标地址，发送载荷后读取一次响应
pub async fn exchange(
    transport: Transport,
    address: &str,
    payload: Option<&[u8]>,
    connect_timeout: Duration,
    read_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let exchange = async {
        match transport {
            Transport::Tcp => tcp_exchange(address, payload, connect_timeout, read_timeout).await,
            Transport::Udp => udp_exchange(address, payload, read_timeout).await,
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(ScanError::Canceled),
        result = exchange => result,
    }
}

async fn tcp_exchange(
    address: &str,
    payload: Option<&[u8]>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Vec<u8>> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ScanError::Network(format!("连接 {} 超时", address)))?
        .map_err(|e| ScanError::Network(format!("连接 {} 失败: {}", address, e)))?;

    if let Some(payload) = payload {
        tokio::time::timeout(read_timeout, stream.write_all(payload))
            .await
            .map_err(|_| ScanError::Network(format!("向 {} 写入超时", address)))??;
    }

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    match tokio::time::timeout(read_timeout, stream.read(&mut buffer)).await {
        Ok(Ok(n)) => {
            buffer.truncate(n);
            Ok(buffer)
        }
        Ok(Err(e)) => Err(ScanError::Network(format!("读取 {} 失败: {}", address, e))),
        Err(_) => {
            debug!("读取 {} 超时，未收到数据", address);
            Ok(Vec::new())
        }
    }
}

async fn udp_exchange(address: &str, payload: Option<&[u8]>, read_timeout: Duration) -> Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect(address)
        .await
        .map_err(|e| ScanError::Network(format!("连接 {} 失败: {}", address, e)))?;
    socket.send(payload.unwrap_or_default()).await?;

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    match tokio::time::timeout(read_timeout, socket.recv(&mut buffer)).await {
        Ok(Ok(n)) => {
            buffer.truncate(n);
            Ok(buffer)
        }
        Ok(Err(e)) => Err(ScanError::Network(format!("读取 {} 失败: {}", address, e))),
        Err(_) => Ok(Vec::new()),
    }
}

/// 执行network请求：依次尝试每个地址，任一匹配即返回true
pub async fn execute(ctx: &ExecutionContext<'_>, request: &Request, scope: &mut VariableScope) -> Result<bool> {
    let transport = Transport::parse(request.option("protocol").as_deref())?;
    let port = request
        .option("port")
        .map(|p| scope.substitute(&p))
        .or_else(|| ctx.target.url.port_or_known_default().map(|p| p.to_string()))
        .ok_or_else(|| ScanError::InvalidRequest("无法确定目标端口".to_string()))?;

    let hosts = if request.hosts.is_empty() {
        vec!["{{Hostname}}".to_string()]
    } else {
        request.hosts.clone()
    };

    let payload = payload_for_send(request).map(|p| scope.substitute(&p));
    let settings = &ctx.services.settings;

    for host in hosts {
        let host = scope.substitute(&host);
        let address = if host.rsplit_once(':').map_or(false, |(_, p)| p.parse::<u16>().is_ok()) {
            host
        } else {
            format!("{}:{}", host, port)
        };

        let data = match exchange(
            transport,
            &address,
            payload.as_deref().map(str::as_bytes),
            settings.connection_timeout(),
            settings.read_timeout(),
            ctx.cancel,
        )
        .await
        {
            Ok(data) => data,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!("[{}] {}", ctx.template_id, e);
                continue;
            }
        };

        let match_ctx = MatchContext::from_network(NetworkCapture { address, data });
        if check_matchers_with_vars(&request.matchers, request.matchers_condition, &match_ctx, scope.values()) {
            run_extractors(&request.extractors, &match_ctx, scope);
            return Ok(true);
        }
    }

    Ok(false)
}
