//! `nerve` - start and stop the orchestration daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use nerve_server::{Command, CommandType, Engine, EngineConfig};
use nerve_transport::{ServerAddr, SocketClient, SocketServer};

#[derive(Parser)]
#[command(name = "nerve", about = "Orchestration daemon for interactive AI agents")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start a server.
    Serve {
        /// Server name; also names the history directory.
        #[arg(default_value = "nerve")]
        name: String,
        /// Unix socket path (default: /tmp/nerve-<name>.sock).
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Listen on TCP instead of a Unix socket.
        #[arg(long)]
        tcp: bool,
        /// TCP host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// TCP port.
        #[arg(long, default_value_t = 7777)]
        port: u16,
        /// Disable per-node history logging.
        #[arg(long)]
        no_history: bool,
    },
    /// Stop a running server.
    Stop {
        #[arg(default_value = "nerve")]
        name: String,
        #[arg(long)]
        socket: Option<PathBuf>,
        #[arg(long)]
        tcp: bool,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 7777)]
        port: u16,
    },
}

fn default_socket(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("nerve-{name}.sock"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        CliCommand::Serve {
            name,
            socket,
            tcp,
            host,
            port,
            no_history,
        } => {
            let addr = if tcp {
                ServerAddr::Tcp(host, port)
            } else {
                ServerAddr::Unix(socket.unwrap_or_else(|| default_socket(&name)))
            };

            let server = SocketServer::new(addr);
            let engine = Engine::new(
                server.event_sink(),
                EngineConfig {
                    server_name: name,
                    history_enabled: !no_history,
                    history_base_dir: None,
                },
            );
            server.serve(engine).await.context("server failed")?;
        }
        CliCommand::Stop {
            name,
            socket,
            tcp,
            host,
            port,
        } => {
            let client = if tcp {
                SocketClient::connect_tcp(&host, port).await
            } else {
                SocketClient::connect_unix(socket.unwrap_or_else(|| default_socket(&name))).await
            }
            .context("cannot reach server")?;

            let result = client
                .send_command(Command::new(CommandType::Shutdown, json!({})))
                .await
                .context("shutdown command failed")?;
            if result.success {
                println!("server stopping");
            } else {
                anyhow::bail!("server refused shutdown: {:?}", result.error);
            }
        }
    }

    Ok(())
}
