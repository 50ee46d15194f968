use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use agent_dispatch::{
    agent::AgentRuntime,
    broker::{self, BrokerState, CommandTemplate},
    config::{AgentConfig, BrokerConfig},
    dispatcher::Dispatcher,
    identity::AgentIdentity,
    logging::init_logging,
    registry::ConnectionRegistry,
    sink::{run_result_pump, JsonlFileSink, LogSink, ResultSink},
};

const RESULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Parser)]
#[command(name = "agent-dispatch")]
#[command(about = "Push HTTP commands to remotely connected agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Accept agent connections and route `/command` requests to them.
    Broker(BrokerConfig),
    /// Connect to a broker and execute the commands it sends.
    Agent(AgentConfig),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Broker(cfg) => run_broker(cfg).await,
        Commands::Agent(cfg) => run_agent(cfg).await,
    }
}

async fn run_broker(cfg: BrokerConfig) -> Result<()> {
    init_logging(&cfg.log_level)?;

    let sink: Arc<dyn ResultSink> = match &cfg.results_file {
        Some(path) => Arc::new(JsonlFileSink::new(path.clone())),
        None => Arc::new(LogSink),
    };
    let (results_tx, results_rx) = mpsc::channel(RESULT_QUEUE_CAPACITY);
    let pump = tokio::spawn(run_result_pump(results_rx, sink));

    let dispatcher = Dispatcher::with_reply_timeout(ConnectionRegistry::new(), cfg.reply_timeout);
    let commands = CommandTemplate::new(cfg.command_endpoint.clone(), cfg.command_timeout.clone());
    let state = BrokerState::new(dispatcher, commands, results_tx);

    let addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind broker on {addr}"))?;
    tracing::info!(
        target = "agent_dispatch::broker",
        addr = %addr,
        reply_timeout_ms = cfg.reply_timeout.as_millis() as u64,
        results_file = cfg.results_file.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
        "broker listening"
    );

    broker::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(target = "agent_dispatch::broker", "shutting down");
    })
    .await
    .context("broker server failed")?;

    // Handlers still in flight hold senders; give them the save window to drain.
    let _ = tokio::time::timeout(agent_dispatch::sink::SAVE_TIMEOUT, pump).await;
    Ok(())
}

async fn run_agent(cfg: AgentConfig) -> Result<()> {
    init_logging(&cfg.log_level)?;

    let identity = AgentIdentity::load_or_mint(&cfg.identity_path());
    let runtime = AgentRuntime::new(identity, &cfg.dispatcher_host, cfg.interval)?;

    tokio::select! {
        _ = runtime.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target = "agent_dispatch::agent", "shutting down");
        }
    }
    Ok(())
}
