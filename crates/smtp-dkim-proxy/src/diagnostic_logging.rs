use anyhow::Context;
use clap::ValueEnum;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const DEFAULT_FILTER_ENV_VAR: &str = "SMTP_DKIM_PROXY_LOG";
pub const DEFAULT_FILTER: &str = "smtp_dkim_proxy=info,rfc5321=info";

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

pub struct LoggingConfig<'a> {
    pub log_dir: Option<PathBuf>,
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
    pub diag_format: DiagnosticFormat,
}

impl LoggingConfig<'_> {
    pub fn new(diag_format: DiagnosticFormat) -> Self {
        Self {
            log_dir: None,
            filter_env_var: DEFAULT_FILTER_ENV_VAR,
            default_filter: DEFAULT_FILTER,
            diag_format,
        }
    }

    fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        let filter = std::env::var(self.filter_env_var);
        let filter = filter.as_deref().unwrap_or(self.default_filter);
        EnvFilter::try_new(filter).with_context(|| format!("parsing log filter '{filter}'"))
    }

    /// Install the global subscriber. When logging to files, the
    /// returned guard must be held until exit so that buffered
    /// records are flushed.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let (log_writer, guard) = if let Some(log_dir) = &self.log_dir {
            let file_appender = tracing_appender::rolling::hourly(log_dir, "log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        } else {
            (BoxMakeWriter::new(std::io::stderr), None)
        };

        let layer = fmt::layer().with_thread_names(true).with_writer(log_writer);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        tracing_subscriber::registry()
            .with(layer.with_filter(self.env_filter()?))
            .try_init()
            .context("installing diagnostic logger")?;

        Ok(guard)
    }
}
