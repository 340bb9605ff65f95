use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tplscan::{
    rate_limit::{HostLimiters, TokenBucket},
    retry::{is_retryable_io_error, is_retryable_message, retry_with_backoff},
    ScanError,
};

#[tokio::test]
async fn test_retry_exhausts_attempts_with_backoff() -> tplscan::Result<()> {
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let outcome = retry_with_backoff(
        2,
        Duration::from_millis(20),
        &CancellationToken::new(),
        |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("connection reset by peer") }
        },
        |msg: &&str| is_retryable_message(msg),
    )
    .await?;

    assert_eq!(outcome.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(outcome.result.is_err());
    // waits 20ms then 40ms
    assert!(started.elapsed() >= Duration::from_millis(60));
    Ok(())
}

#[tokio::test]
async fn test_retry_stops_on_permanent_error() -> tplscan::Result<()> {
    let outcome = retry_with_backoff(
        5,
        Duration::from_millis(10),
        &CancellationToken::new(),
        |_| async { Err::<(), _>("no such host") },
        |msg: &&str| is_retryable_message(msg),
    )
    .await?;

    assert_eq!(outcome.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn test_retry_succeeds_after_transient_failure() -> tplscan::Result<()> {
    let outcome = retry_with_backoff(
        3,
        Duration::from_millis(5),
        &CancellationToken::new(),
        |attempt| async move {
            if attempt == 0 {
                Err("i/o timeout")
            } else {
                Ok(attempt)
            }
        },
        |msg: &&str| is_retryable_message(msg),
    )
    .await?;

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.result, Ok(1));
    Ok(())
}

#[tokio::test]
async fn test_retry_cancel_interrupts_backoff() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = retry_with_backoff(
        3,
        Duration::from_secs(30),
        &cancel,
        |_| async { Err::<(), _>("timed out") },
        |msg: &&str| is_retryable_message(msg),
    )
    .await;

    assert!(matches!(result, Err(ScanError::Canceled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_retry_with_canceled_token_never_runs() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = retry_with_backoff(
        1,
        Duration::from_millis(1),
        &cancel,
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), &str>(()) }
        },
        |_: &&str| true,
    )
    .await;

    assert!(matches!(result, Err(ScanError::Canceled)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_retryable_classification() {
    assert!(is_retryable_message("Connection refused (os error 111)"));
    assert!(is_retryable_message("operation timed out"));
    assert!(is_retryable_message("dial tcp: i/o timeout"));
    assert!(!is_retryable_message("no such host"));
    assert!(!is_retryable_message("timeout: name or service not known"));
    assert!(!is_retryable_message("404 not found"));

    use std::io::{Error, ErrorKind};
    assert!(is_retryable_io_error(&Error::from(ErrorKind::ConnectionReset)));
    assert!(is_retryable_io_error(&Error::new(ErrorKind::Other, "server misbehaving")));
    assert!(!is_retryable_io_error(&Error::from(ErrorKind::PermissionDenied)));
}

#[test]
fn test_token_bucket_burst() {
    let bucket = TokenBucket::new(Duration::from_millis(100), 2);
    assert!(bucket.try_acquire().is_ok());
    assert!(bucket.try_acquire().is_ok());

    let wait = bucket.try_acquire().unwrap_err();
    assert!(wait > Duration::ZERO);
    assert!(wait <= Duration::from_millis(100));
}

#[test]
fn test_token_bucket_zero_frequency_never_waits() {
    let bucket = TokenBucket::new(Duration::ZERO, 1);
    for _ in 0..100 {
        assert!(bucket.try_acquire().is_ok());
    }
}

#[tokio::test]
async fn test_token_bucket_acquire_waits_for_refill() -> tplscan::Result<()> {
    let bucket = TokenBucket::new(Duration::from_millis(50), 1);
    let cancel = CancellationToken::new();

    let started = Instant::now();
    bucket.acquire(&cancel).await?;
    bucket.acquire(&cancel).await?;
    assert!(started.elapsed() >= Duration::from_millis(40));
    Ok(())
}

#[tokio::test]
async fn test_token_bucket_acquire_canceled() {
    let bucket = TokenBucket::new(Duration::from_secs(60), 1);
    let cancel = CancellationToken::new();
    tokio_test::assert_ok!(bucket.acquire(&cancel).await);

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    assert!(matches!(bucket.acquire(&cancel).await, Err(ScanError::Canceled)));
}

#[tokio::test]
async fn test_host_limiters_are_per_host() -> tplscan::Result<()> {
    let limiters = HostLimiters::new(Duration::from_secs(60), 1);
    assert!(limiters.is_empty());

    let a = limiters.limiter_for("Example.com");
    let b = limiters.limiter_for("example.com");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(limiters.len(), 1);

    // one host exhausted does not block another
    let cancel = CancellationToken::new();
    limiters.acquire("example.com", &cancel).await?;
    assert!(limiters.limiter_for("example.com").try_acquire().is_err());
    limiters.acquire("other.test", &cancel).await?;
    assert_eq!(limiters.len(), 2);
    Ok(())
}
