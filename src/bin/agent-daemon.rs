//! Entry point for a fabric agent: serves the envelope inbox (and the
//! client-facing /query endpoint) while registering and heartbeating against
//! the broker in the background.

use a2a_fabric::bootstrap::{detach, flag_value, init_logging};
use a2a_fabric::inbox::{start_server, AgentState};
use a2a_fabric::{AgentRuntime, AgentRuntimeConfig, PassthroughTranslator, ToolClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const USAGE: &str = "\
agent-daemon: a fabric agent process

Usage: agent-daemon [OPTIONS]

Options:
  --name <NAME>       logical agent name, default llm_agent
  --config <PATH>     configuration file (toml/json/yaml), default agent.toml
  --host <HOST>       inbox listen address, default 0.0.0.0
  --port <PORT>       inbox listen port, default 8003
  --daemon            detach and run in the background (Unix only)
  --pid-file <PATH>   pid file for daemon mode
  --log-file <PATH>   append logs to this file instead of stderr
  -h, --help          show this message
";

struct Flags {
    name: String,
    config: PathBuf,
    host: String,
    port: u16,
    daemon: bool,
    pid_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
}

impl Flags {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let mut flags = Self {
            name: "llm_agent".to_string(),
            config: PathBuf::from("agent.toml"),
            host: "0.0.0.0".to_string(),
            port: 8003,
            daemon: false,
            pid_file: None,
            log_file: None,
        };

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--name" => flags.name = flag_value(args, &mut i)?,
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
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let flags = Flags::parse(&args)?;

    init_logging(flags.log_file.as_deref())?;
    info!("Agent daemon v{} ({})", a2a_fabric::VERSION, flags.name);

    if flags.daemon {
        detach(flags.pid_file.as_deref())?;
    }

    let config = if flags.config.exists() {
        info!("loading agent configuration from {:?}", flags.config);
        AgentRuntimeConfig::from_file(&flags.config)?
    } else {
        info!("no config file, reading agent configuration from the environment");
        AgentRuntimeConfig::from_env(&flags.name)
    };

    let executor = ToolClient::new(&config.tool_url)?;
    let runtime = AgentRuntime::new(config, Arc::new(PassthroughTranslator), Arc::new(executor))?;

    // The agent cannot serve unregistered; take the process down if
    // registration never succeeds
    let registrar = Arc::clone(&runtime);
    tokio::spawn(async move {
        if let Err(e) = registrar.start().await {
            error!("registration failed: {}", e);
            std::process::exit(1);
        }
    });

    let state = AgentState { runtime };
    info!("inbox listening on {}:{}", flags.host, flags.port);
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
    fn test_flags_parse_name_and_port() {
        let args: Vec<String> = ["--name", "ventas_agent", "--port", "8002"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let flags = Flags::parse(&args).unwrap();
        assert_eq!(flags.name, "ventas_agent");
        assert_eq!(flags.port, 8002);
        assert!(!flags.daemon);
        assert_eq!(flags.config, PathBuf::from("agent.toml"));
    }

    #[test]
    fn test_flags_reject_missing_value() {
        assert!(Flags::parse(&["--name".to_string()]).is_err());
    }
}
