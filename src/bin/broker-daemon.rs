//! Entry point for the fabric broker: the registry, discovery index,
//! liveness tracker, and envelope router.

use a2a_fabric::api::{start_server, AppState};
use a2a_fabric::bootstrap::{detach, flag_value, init_logging};
use a2a_fabric::{Broker, BrokerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const USAGE: &str = "\
broker-daemon: registry and router for the A2A fabric

Usage: broker-daemon [OPTIONS]

Options:
  --config <PATH>     configuration file (toml/json/yaml), default broker.toml
  --host <HOST>       listen address, default 0.0.0.0
  --port <PORT>       listen port, default 8000
  --daemon            detach and run in the background (Unix only)
  --pid-file <PATH>   pid file for daemon mode
  --log-file <PATH>   append logs to this file instead of stderr
  -h, --help          show this message
";

struct Flags {
    config: PathBuf,
    host: String,
    port: u16,
    daemon: bool,
    pid_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
}

fn parse_flags(args: &[String]) -> anyhow::Result<Flags> {
    let mut flags = Flags {
        config: PathBuf::from("broker.toml"),
        host: "0.0.0.0".to_string(),
        port: 8000,
        daemon: false,
        pid_file: None,
        log_file: None,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => flags.config = flag_value(args, &mut i)?.into(),
            "--host" => flags.host = flag_value(args, &mut i)?,
            "--port" => {
                flags.port = flag_value(args, &mut i)?
                    .parse()
                    .map_err(|_| anyhow::anyhow!("--port expects a number"))?;
            }
            "--daemon" => flags.daemon = true,
            "--pid-file" => flags.pid_file = Some(flag_value(args, &mut i)?.into()),
            "--log-file" => flags.log_file = Some(flag_value(args, &mut i)?.into()),
            "--help" | "-h" => {
                print!("{}", USAGE);
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument '{}', try --help", other),
        }
        i += 1;
    }

    Ok(flags)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let flags = parse_flags(&args)?;

    init_logging(flags.log_file.as_deref())?;
    info!("Broker daemon v{}", a2a_fabric::VERSION);

    if flags.daemon {
        detach(flags.pid_file.as_deref())?;
    }

    let config = if flags.config.exists() {
        info!("loading broker configuration from {:?}", flags.config);
        BrokerConfig::from_file(&flags.config)?
    } else {
        info!("no config file, reading broker configuration from the environment");
        BrokerConfig::from_env()
    };
    config.validate()?;

    let state = AppState {
        broker: Arc::new(Broker::new(config)?),
    };

    info!("broker listening on {}:{}", flags.host, flags.port);
    tokio::select! {
        outcome = start_server(state, &flags.host, flags.port) => outcome?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_parse_with_defaults() {
        let args: Vec<String> = ["--port", "9000", "--daemon"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let flags = parse_flags(&args).unwrap();
        assert_eq!(flags.port, 9000);
        assert!(flags.daemon);
        assert_eq!(flags.host, "0.0.0.0");
        assert_eq!(flags.config, PathBuf::from("broker.toml"));
    }

    #[test]
    fn test_flags_reject_bad_input() {
        assert!(parse_flags(&["--port".to_string()]).is_err());
        assert!(parse_flags(&["--port".to_string(), "many".to_string()]).is_err());
        assert!(parse_flags(&["--bogus".to_string()]).is_err());
    }
}
