use std::{path::PathBuf, time::Duration};

use clap::Args;

use crate::{
    duration::{parse_duration, parse_duration_arg},
    identity::default_identity_path,
};

pub const DEFAULT_COMMAND_ENDPOINT: &str = "https://api.datamuse.com/words?ml={word}&max=1";

#[derive(Debug, Args, Clone)]
pub struct BrokerConfig {
    #[arg(long, env = "BROKER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// How long a dispatch waits for one agent before trying the next.
    #[arg(long, env = "REPLY_TIMEOUT", default_value = "30s", value_parser = parse_duration_arg)]
    pub reply_timeout: Duration,

    /// Target URL for `/command`; `{word}` is replaced by the query word.
    #[arg(long, env = "COMMAND_ENDPOINT", default_value = DEFAULT_COMMAND_ENDPOINT)]
    pub command_endpoint: String,

    /// Timeout agents apply to each command, e.g. `5s`.
    #[arg(long, env = "COMMAND_TIMEOUT", default_value = "5s", value_parser = parse_timeout_string)]
    pub command_timeout: String,

    /// Append results to this JSON-lines file instead of logging them.
    #[arg(long, env = "RESULTS_FILE")]
    pub results_file: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl BrokerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Args, Clone)]
pub struct AgentConfig {
    /// Broker address: a bare host, or an http(s):// or ws(s):// URL.
    #[arg(long = "dispatcher-host", env = "DISPATCHER", default_value = "ws://localhost:8080")]
    pub dispatcher_host: String,

    /// Reconnect interval.
    #[arg(long, env = "INTERVAL", default_value = "10s", value_parser = parse_interval)]
    pub interval: Duration,

    #[arg(long, env = "AGENT_ID_FILE")]
    pub identity_file: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl AgentConfig {
    pub fn identity_path(&self) -> PathBuf {
        self.identity_file
            .clone()
            .unwrap_or_else(default_identity_path)
    }
}

fn parse_timeout_string(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    parse_duration(trimmed).map_err(|error| error.to_string())?;
    Ok(trimmed.to_string())
}

fn parse_interval(raw: &str) -> Result<Duration, String> {
    let interval = parse_duration_arg(raw)?;
    if interval.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(interval)
}
