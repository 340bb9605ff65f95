use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub templates_dir: PathBuf,
    pub results_file: PathBuf,
    pub user_agent: Option<String>,
    pub settings: AdvancedSettings,
}

/// Operator-tunable knobs handed to every executor.
///
/// The value is passed explicitly through `ScanServices`, so two scans running
/// side by side can use different settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdvancedSettings {
    pub threads: usize,
    pub workers: usize,
    pub timeout: u64, // seconds
    pub retries: u32,
    pub retry_delay: u64, // milliseconds
    pub max_body_size: usize, // bytes
    pub connection_timeout: u64, // seconds
    pub read_timeout: u64, // seconds
    pub headless_tabs: usize,
    pub headless_timeout: u64, // seconds
    pub rate_limiter_frequency: u64, // milliseconds
    pub rate_limiter_burst_size: usize,
    pub max_js_redirects: usize,
    pub prefetch: PrefetchMode,
    pub verify_tls: bool,
}

/// How the per-target page snapshot for offline matching is obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchMode {
    Headless,
    Http,
    Off,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            templates_dir: PathBuf::from("./templates"),
            results_file: PathBuf::from("goods.txt"),
            user_agent: None,
            settings: AdvancedSettings::default(),
        }
    }
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            threads: 300,
            workers: 50,
            timeout: 500,
            retries: 2,
            retry_delay: 500,
            max_body_size: 10 * 1024 * 1024,
            connection_timeout: 10,
            read_timeout: 5,
            headless_tabs: 10,
            headless_timeout: 60,
            rate_limiter_frequency: 10,
            rate_limiter_burst_size: 100,
            max_js_redirects: 5,
            prefetch: PrefetchMode::Headless,
            verify_tls: false,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.settings.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| crate::ScanError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)?;
        Ok(())
    }
}

impl AdvancedSettings {
    pub fn validate(&self) -> crate::Result<()> {
        let counts = [
            ("threads", self.threads),
            ("workers", self.workers),
            ("headless_tabs", self.headless_tabs),
            ("rate_limiter_burst_size", self.rate_limiter_burst_size),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(crate::ScanError::InvalidInput(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn headless_timeout(&self) -> Duration {
        Duration::from_secs(self.headless_timeout)
    }

    pub fn rate_limiter_frequency(&self) -> Duration {
        Duration::from_millis(self.rate_limiter_frequency)
    }
}
