//! tplscan - Template-Driven Vulnerability and Fingerprint Scanner
//!
//! Loads declarative YAML detection templates and evaluates them against
//! targets over HTTP, DNS, raw TCP/UDP and a headless browser.
//!
//! # Warning
//! This tool is designed for authorized security assessment only. Users are
//! responsible for ensuring they have permission to scan the targets they use.

pub mod cli;
pub mod config;
pub mod display;
pub mod dns_probe;
pub mod dsl;
pub mod error;
pub mod extractor;
pub mod flow;
pub mod headless;
pub mod http_probe;
pub mod match_context;
pub mod matcher;
pub mod network_probe;
pub mod offline;
pub mod rate_limit;
pub mod reporting;
pub mod retry;
pub mod scanner;
pub mod selectors;
pub mod services;
pub mod targets;
pub mod template;
pub mod template_engine;
pub mod template_loader;
pub mod variables;

pub use error::{Result, ScanError};
pub use scanner::{CheckReport, CompletionStatus, Scanner};
pub use services::ScanServices;
pub use targets::ScanTarget;
pub use template::Template;
