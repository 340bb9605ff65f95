use clap::Parser;
use env_logger::Env;
use std::path::Path;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tplscan::{
    cli::{Cli, Commands},
    config::Config,
    display::DisplayManager,
    reporting::{write_json_report, ResultLog, StatsSnapshot},
    scanner::{CompletionStatus, Scanner},
    services::ScanServices,
    targets::{load_targets, ScanTarget},
    template::Template,
    template_loader::load_templates,
    Result,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(cli.common.log_level()))
        .format_timestamp_secs()
        .init();

    let display = DisplayManager::with_quiet(cli.common.quiet);
    display.print_banner("TPLSCAN - Template Scanner", Some("Authorized Testing Only"));

    let mut config = match &cli.common.config {
        Some(path) => match Config::load_from_file(&path.to_string_lossy()) {
            Ok(config) => {
                display.print_success(&format!("Loaded configuration from {}", path.display()));
                config
            }
            Err(e) => {
                display.print_error(&format!("Failed to load configuration: {}", e));
                process::exit(1);
            }
        },
        None => Config::default(),
    };
    cli.common.apply(&mut config);

    if let Err(e) = config.settings.validate() {
        display.print_error(&e.to_string());
        process::exit(1);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received, canceling scan");
                cancel.cancel();
            }
        });
    }

    let result = match &cli.command {
        Commands::Check { url } => execute_check(&config, &display, url, &cancel).await,
        Commands::Scan { targets, output } => {
            execute_scan(&config, &display, targets, output.as_deref(), &cancel).await
        }
        Commands::Templates { tag } => execute_list(&config, &display, tag.as_deref()),
    };

    if let Err(e) = result {
        if e.is_canceled() {
            display.print_warning("Canceled");
            process::exit(130);
        }
        display.print_error(&format!("Scan failed: {}", e));
        process::exit(1);
    }
}

fn load(config: &Config, display: &DisplayManager) -> Result<Vec<Arc<Template>>> {
    let report = load_templates(&config.templates_dir)?;
    display.print_info(&format!(
        "Loaded {} templates from {} ({} profiles skipped, {} failed)",
        report.templates.len(),
        config.templates_dir.display(),
        report.profiles_skipped,
        report.failures.len()
    ));
    Ok(report.templates.into_iter().map(Arc::new).collect())
}

fn build_scanner(config: &Config) -> Result<(Scanner, Arc<ScanServices>)> {
    let services = Arc::new(
        ScanServices::builder(config.settings.clone())
            .user_agent(config.user_agent.clone())
            .build()?,
    );
    let log = Arc::new(ResultLog::open(&config.results_file)?);
    Ok((Scanner::new(services.clone()).with_result_log(log), services))
}

async fn execute_check(config: &Config, display: &DisplayManager, url: &str, cancel: &CancellationToken) -> Result<()> {
    let target = ScanTarget::parse(url)?;
    let templates = load(config, display)?;
    let (scanner, services) = build_scanner(config)?;

    display.print_section_header(&format!("CHECK {}", target.url));
    let pb = display.create_progress_bar(0, target.raw.as_str());
    let progress_bar = pb.clone();
    let scanner = scanner.with_progress(Arc::new(move |done: usize, total: usize| {
        progress_bar.set_length(total as u64);
        progress_bar.set_position(done as u64);
    }));

    let report = scanner.check_target(&target, &templates, cancel).await;
    pb.finish_and_clear();
    services.browser.shutdown().await;

    display.print_check_report(&report?, &templates);
    Ok(())
}

async fn execute_scan(
    config: &Config,
    display: &DisplayManager,
    targets_path: &Path,
    output: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (targets, invalid) = load_targets(targets_path)?;
    for e in &invalid {
        display.print_warning(&e.to_string());
    }
    let templates = load(config, display)?;
    let (scanner, services) = build_scanner(config)?;

    display.print_section_header(&format!("SCAN {} TARGETS", targets.len()));
    let pb = display.create_progress_bar(targets.len() as u64, "targets");
    let progress_bar = pb.clone();
    let scanner = scanner.with_stats_callback(Arc::new(move |stats: &StatsSnapshot| {
        progress_bar.set_position(stats.processed as u64);
        progress_bar.set_message(format!("{} hits", stats.successes));
    }));

    let summary = scanner.scan(targets, &templates, cancel).await;
    pb.finish_and_clear();
    services.browser.shutdown().await;
    let summary = summary?;

    for report in &summary.reports {
        for id in &report.matched {
            if let Some(template) = templates.iter().find(|t| &t.id == id) {
                display.print_match(&report.target, template);
            }
        }
    }
    display.print_scan_summary(&summary.stats, summary.status);

    if let Some(path) = output {
        write_json_report(&summary, path)?;
        display.print_success(&format!("Report written to {}", path.display()));
    }
    if summary.status == CompletionStatus::Completed {
        display.print_success(&format!("Results appended to {}", config.results_file.display()));
    }
    Ok(())
}

fn execute_list(config: &Config, display: &DisplayManager, tag: Option<&str>) -> Result<()> {
    let templates: Vec<Arc<Template>> = load(config, display)?
        .into_iter()
        .filter(|t| tag.map_or(true, |tag| t.has_tag(tag)))
        .collect();
    display.print_template_table(&templates);
    Ok(())
}
