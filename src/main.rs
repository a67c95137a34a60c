use anyhow::{bail, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod amqp;
mod browser;
mod cli;
mod monitor;
mod pipeline;
mod postprocess;
mod result;
mod storage;
mod task;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    let log_level = args
        .log_level
        .unwrap_or_else(|| cli::config::Config::from_env().log_level);
    init_logging(log_level)?;

    info!("starting MIDA v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("command failed: {e:#}");
            Err(e)
        }
    }
}

/// Maps the numeric log level (0=Error, 1=Warn, 2=Info, 3=Debug) onto an
/// EnvFilter; RUST_LOG directives still apply on top.
fn init_logging(level: u8) -> Result<()> {
    let level = match level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => bail!("invalid log level (valid values: 0, 1, 2, 3)"),
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("mida={level}").parse()?)
        .add_directive("warn".parse()?);

    tracing_subscriber::fmt().with_env_filter(filter).init();

    Ok(())
}
