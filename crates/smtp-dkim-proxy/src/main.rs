use anyhow::Context;
use clap::Parser;
use smtp_dkim_proxy::config::ProxyConfig;
use smtp_dkim_proxy::diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use smtp_dkim_proxy::server::Listener;
use smtp_dkim_proxy::vhost::Registry;
use std::path::PathBuf;
use std::sync::Arc;

/// SMTP submission proxy that DKIM signs outgoing mail
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Configuration file to load.
    /// If omitted, the standard locations are searched.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory where diagnostic log files will be placed.
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// Load the configuration, set up every virtual host and then exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    let mut logging = LoggingConfig::new(opts.diag_format);
    logging.log_dir = opts.diag_log_dir.clone();
    let _log_guard = logging.init()?;

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    let config_path = match &opts.config {
        Some(path) => path.clone(),
        None => ProxyConfig::find_config_file().ok_or_else(|| {
            anyhow::anyhow!(
                "no configuration file found; looked in {:?}",
                ProxyConfig::search_paths()
            )
        })?,
    };

    let config = ProxyConfig::load(&config_path)
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;

    let registry = Registry::from_config(&config).await?;
    if registry.is_empty() {
        tracing::warn!("no virtual hosts are configured; every login will fail");
    }

    let listener = Listener::bind(&config, Arc::new(registry)).await?;

    if opts.validate {
        tracing::info!("{} is OK", config_path.display());
        return Ok(());
    }

    let (_addr, _accept_loop) = listener.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    Ok(())
}
