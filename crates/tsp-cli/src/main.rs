//! `tsp`: send requests to a server with automatic reconnection, or run a
//! local echo server to try it against.
//!
//! Run with: `cargo run -p tsp-cli -- send hello world`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tsp_client::{Client, ClientError, CommandError, ConnectOptions, Phase, PhaseObserver};
use tsp_config::{CliArgs, Config, ConfigError};
use tsp_net::{Server, ServerConfig, TcpTransport, TcpTransportConfig, TlsError};

#[derive(Parser, Debug)]
#[command(name = "tsp", version, about = "Resilient request/reply client")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send each payload as one request and print the replies in order.
    Send {
        /// Request payloads, sent as UTF-8.
        #[arg(required = true)]
        payloads: Vec<String>,

        /// Give up waiting for replies after this many milliseconds.
        #[arg(long, default_value_t = 10_000)]
        wait_ms: u64,

        /// Payload sent first on every (re)connect.
        #[arg(long)]
        handshake: Option<String>,
    },
    /// Run an echo server on the configured port.
    Serve {
        /// Address to bind (defaults to 0.0.0.0 on the configured port).
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Maximum concurrent connections.
        #[arg(long, default_value_t = 64)]
        max_connections: usize,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Connect(#[from] ClientError),

    #[error("request {index} failed: {source}")]
    Request {
        index: usize,
        #[source]
        source: CommandError,
    },

    #[error("timed out waiting for {missing} reply(ies)")]
    ReplyTimeout { missing: usize },

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, config_dir) = match load_config(&cli.args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load config: {e}, using defaults");
            let mut config = Config::default();
            config.apply_cli_overrides(&cli.args);
            (config, None)
        }
    };

    let log_dir = config
        .log
        .dir
        .clone()
        .or_else(|| config_dir.map(|dir| dir.join("logs")));
    tsp_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    let result = match cli.command {
        Command::Send {
            payloads,
            wait_ms,
            handshake,
        } => send(&config, payloads, Duration::from_millis(wait_ms), handshake).await,
        Command::Serve {
            bind,
            max_connections,
        } => serve(&config, bind, max_connections).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &CliArgs) -> Result<(Config, Option<PathBuf>), ConfigError> {
    let config_dir = args.config_dir()?;
    let mut config = Config::load_or_create(&config_dir)?;
    config.apply_cli_overrides(args);
    Ok((config, Some(config_dir)))
}

fn log_phases() -> PhaseObserver {
    Arc::new(|host: &str, port: u16, phase: Phase| match phase {
        Phase::Failed | Phase::Dropped | Phase::Stopped => warn!("{host}:{port} {phase}"),
        _ => info!("{host}:{port} {phase}"),
    })
}

async fn send(
    config: &Config,
    payloads: Vec<String>,
    wait: Duration,
    handshake: Option<String>,
) -> Result<(), CliError> {
    let transport = TcpTransport::new(TcpTransportConfig::from(config))?;
    let client = Client::new(transport);
    client.set_handshake(handshake.map(String::into_bytes));
    client
        .connect(ConnectOptions::from(config), Some(log_phases()))
        .await?;

    let expected = payloads.len();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for (index, payload) in payloads.into_iter().enumerate() {
        let tx = tx.clone();
        client.send(payload, move |reply| {
            let _ = tx.send((index, reply));
        });
    }
    drop(tx);

    let mut outcome = Ok(());
    let mut received = 0;
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    while received < expected {
        tokio::select! {
            next = rx.recv() => match next {
                Some((_, Ok(data))) => {
                    received += 1;
                    println!("{}", String::from_utf8_lossy(&data));
                }
                Some((index, Err(source))) => {
                    received += 1;
                    if outcome.is_ok() {
                        outcome = Err(CliError::Request { index, source });
                    }
                }
                None => break,
            },
            _ = &mut deadline => {
                outcome = Err(CliError::ReplyTimeout { missing: expected - received });
                break;
            }
        }
    }

    client.shutdown().await;
    outcome
}

async fn serve(
    config: &Config,
    bind: Option<SocketAddr>,
    max_connections: usize,
) -> Result<(), CliError> {
    let bind_addr =
        bind.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.connection.port)));
    let server = Server::echo(ServerConfig {
        bind_addr,
        max_connections,
        frame: (&config.framing).into(),
        ..ServerConfig::default()
    });
    info!("Echo server starting on {bind_addr}");
    server.run().await?;
    Ok(())
}
