use log::debug;
use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::ScanError;

/// Transient failure messages that are worth another attempt.
const RETRYABLE_MESSAGES: &[&str] = &[
    "connection refused",
    "connection reset by peer",
    "no route to host",
    "network is unreachable",
    "timeout",
    "timed out",
    "temporary failure",
    "server misbehaving",
    "connection timed out",
    "i/o timeout",
];

/// Lookups that will never succeed on retry.
const PERMANENT_MESSAGES: &[&str] = &[
    "name or service not known",
    "nodename nor servname provided",
    "no such host",
    "invalid url",
    "builder error",
];

/// Result of a retried operation along with how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: std::result::Result<T, E>,
    pub attempts: u32,
}

/// Run `op` up to `retries + 1` times, sleeping `delay * n` before retry `n`.
///
/// Only errors accepted by `is_retryable` are retried. Cancellation during an
/// attempt or a backoff sleep stops the loop with `ScanError::Canceled`.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    retries: u32,
    delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
    is_retryable: P,
) -> std::result::Result<RetryOutcome<T, E>, ScanError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ScanError::Canceled);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ScanError::Canceled),
            result = op(attempt) => result,
        };
        attempt += 1;

        match result {
            Ok(value) => return Ok(RetryOutcome { result: Ok(value), attempts: attempt }),
            Err(err) if attempt <= retries && is_retryable(&err) => {
                let wait = delay * attempt;
                debug!("Transient failure on attempt {}, retrying in {:?}", attempt, wait);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ScanError::Canceled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            Err(err) => return Ok(RetryOutcome { result: Err(err), attempts: attempt }),
        }
    }
}

/// Classify an error message chain against the transient whitelist.
pub fn is_retryable_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    if PERMANENT_MESSAGES.iter().any(|m| message.contains(m)) {
        return false;
    }
    RETRYABLE_MESSAGES.iter().any(|m| message.contains(m))
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

/// Transient HTTP transport failures: connect errors, timeouts and the message whitelist.
pub fn is_retryable_http_error(err: &reqwest::Error) -> bool {
    let chain = error_chain(err);
    if PERMANENT_MESSAGES.iter().any(|m| chain.to_ascii_lowercase().contains(m)) {
        return false;
    }
    err.is_timeout() || err.is_connect() || is_retryable_message(&chain)
}

pub fn is_retryable_io_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::TimedOut | ErrorKind::ConnectionAborted
    ) || is_retryable_message(&error_chain(err))
}
