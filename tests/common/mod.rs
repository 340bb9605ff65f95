#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

use tplscan::config::{AdvancedSettings, PrefetchMode};
use tplscan::dns_probe::{DnsQueryType, RecordResolver};
use tplscan::headless::{BrowserLauncher, PageRenderer};
use tplscan::services::ScanServices;
use tplscan::{Result, ScanError, Template};

/// Short timeouts, no prefetch and a generous rate limit.
pub fn test_settings() -> AdvancedSettings {
    AdvancedSettings {
        threads: 4,
        workers: 4,
        timeout: 30,
        retries: 0,
        retry_delay: 10,
        connection_timeout: 2,
        read_timeout: 2,
        headless_tabs: 2,
        headless_timeout: 5,
        rate_limiter_frequency: 0,
        rate_limiter_burst_size: 1000,
        prefetch: PrefetchMode::Off,
        ..AdvancedSettings::default()
    }
}

pub fn services_with(settings: AdvancedSettings) -> Arc<ScanServices> {
    Arc::new(
        ScanServices::builder(settings)
            .resolver(Arc::new(FakeResolver::default()))
            .launcher(Arc::new(FakeLauncher::new("<html><body>rendered</body></html>")))
            .build()
            .expect("services"),
    )
}

pub fn test_services() -> Arc<ScanServices> {
    services_with(test_settings())
}

pub fn template(yaml: &str) -> Arc<Template> {
    Arc::new(Template::from_yaml(yaml).expect("template parses"))
}

pub fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Resolver answering from a fixed table.
#[derive(Default)]
pub struct FakeResolver {
    pub records: HashMap<(String, DnsQueryType), Vec<String>>,
    pub lookups: AtomicUsize,
}

impl FakeResolver {
    pub fn with(mut self, name: &str, query_type: DnsQueryType, records: &[&str]) -> Self {
        self.records
            .insert((name.to_string(), query_type), records.iter().map(|r| r.to_string()).collect());
        self
    }
}

#[async_trait]
impl RecordResolver for FakeResolver {
    async fn lookup(&self, name: &str, query_type: DnsQueryType) -> Result<Vec<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .get(&(name.to_string(), query_type))
            .cloned()
            .unwrap_or_default())
    }
}

/// Renderer returning canned HTML while tracking how many renders overlap.
pub struct FakeRenderer {
    html: String,
    delay: Duration,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub urls: Mutex<Vec<String>>,
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn render(&self, url: &str, _timeout: Duration, _tab: OwnedSemaphorePermit) -> Result<String> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(self.html.clone())
    }
}

pub struct FakeLauncher {
    pub launches: AtomicUsize,
    pub renderer: Arc<FakeRenderer>,
    pub fail: bool,
}

impl FakeLauncher {
    pub fn new(html: &str) -> Self {
        Self::with_delay(html, Duration::from_millis(0))
    }

    pub fn with_delay(html: &str, delay: Duration) -> Self {
        Self {
            launches: AtomicUsize::new(0),
            renderer: Arc::new(FakeRenderer {
                html: html.to_string(),
                delay,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
            }),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("")
        }
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn PageRenderer>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ScanError::BrowserInit("no browser available".to_string()));
        }
        Ok(self.renderer.clone())
    }
}
