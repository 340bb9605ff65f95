//! 扫描共享服务
//!
//! 进程内只构造一次，以引用传给各协议执行器：HTTP客户端连接池、按主机的
//! 限速器表、无头浏览器和DNS解析器都在这里。

use reqwest::Client;
use std::sync::Arc;

use crate::config::AdvancedSettings;
use crate::dns_probe::{RecordResolver, SystemResolver};
use crate::headless::{BrowserLauncher, BrowserService, ChromeLauncher};
use crate::rate_limit::HostLimiters;
use crate::Result;

pub struct ScanServices {
    pub settings: AdvancedSettings,
    pub client: Client,
    pub limiters: HostLimiters,
    pub browser: BrowserService,
    pub resolver: Arc<dyn RecordResolver>,
    pub user_agent: Option<String>,
}

impl ScanServices {
    /// 使用系统解析器和本地Chrome创建服务
    pub fn new(settings: AdvancedSettings) -> Result<Self> {
        ScanServicesBuilder::new(settings).build()
    }

    pub fn builder(settings: AdvancedSettings) -> ScanServicesBuilder {
        ScanServicesBuilder::new(settings)
    }
}

pub struct ScanServicesBuilder {
    settings: AdvancedSettings,
    resolver: Option<Arc<dyn RecordResolver>>,
    launcher: Option<Arc<dyn BrowserLauncher>>,
    user_agent: Option<String>,
}

impl ScanServicesBuilder {
    pub fn new(settings: AdvancedSettings) -> Self {
        Self {
            settings,
            resolver: None,
            launcher: None,
            user_agent: None,
        }
    }

    pub fn resolver(mut self, resolver: Arc<dyn RecordResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent.filter(|ua| !ua.trim().is_empty());
        self
    }

    pub fn build(self) -> Result<ScanServices> {
        let settings = self.settings;
        settings.validate()?;

        let client = Client::builder()
            .connect_timeout(settings.connection_timeout())
            .timeout(settings.connection_timeout() + settings.read_timeout())
            .danger_accept_invalid_certs(!settings.verify_tls)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        let launcher = self.launcher.unwrap_or_else(|| {
            Arc::new(ChromeLauncher {
                ignore_certificate_errors: !settings.verify_tls,
                ..ChromeLauncher::default()
            })
        });
        let browser = BrowserService::new(
            launcher,
            settings.headless_tabs,
            settings.headless_timeout(),
            settings.max_body_size,
        );
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SystemResolver::new()));
        let limiters = HostLimiters::new(settings.rate_limiter_frequency(), settings.rate_limiter_burst_size);

        Ok(ScanServices {
            settings,
            client,
            limiters,
            browser,
            resolver,
            user_agent: self.user_agent,
        })
    }
}
