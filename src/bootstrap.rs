//! Process bootstrap helpers shared by the broker and agent daemons

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// directives; with a log file, output appends there without ANSI colors.
pub fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let directives =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,a2a_fabric=debug".to_string());
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::new(directives));
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_writer(Arc::new(file)).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// Detach from the terminal, optionally writing a pid file
#[cfg(unix)]
pub fn detach(pid_file: Option<&Path>) -> anyhow::Result<()> {
    use anyhow::Context;

    let mut daemon = daemonize::Daemonize::new();
    if let Some(path) = pid_file {
        daemon = daemon.pid_file(path);
    }
    daemon.start().context("failed to daemonize")?;
    Ok(())
}

#[cfg(not(unix))]
pub fn detach(_pid_file: Option<&Path>) -> anyhow::Result<()> {
    anyhow::bail!("daemon mode is only supported on Unix")
}

/// Fetch the value following `args[*index]` (a flag) and advance the cursor
pub fn flag_value(args: &[String], index: &mut usize) -> anyhow::Result<String> {
    *index += 1;
    match args.get(*index) {
        Some(value) => Ok(value.clone()),
        None => anyhow::bail!("{} expects a value", args[*index - 1]),
    }
}
