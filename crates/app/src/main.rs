//! JetLink - terminal messaging over a broadcast hub
//!
//! `jetlink hub` hosts a hub; `jetlink chat` connects to one.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use jetlink_net::{Hub, HubConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod chat;
mod config;
mod downloads;

#[derive(Parser)]
#[command(name = "jetlink", version, about = "Real-time text and image messaging")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a hub until Ctrl-C
    Hub {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        bind: Option<IpAddr>,
    },
    /// Connect to a hub and chat from the terminal
    Chat {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Own identifier
        #[arg(long)]
        id: Option<String>,
        /// Default recipient; omit to address everyone
        #[arg(long)]
        to: Option<String>,
        /// Ring the terminal bell on incoming messages
        #[arg(long)]
        bell: bool,
    },
}

fn main() -> ExitCode {
    // Initialize logging; stdout belongs to the chat transcript
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let app_config = match config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        match cli.command {
            Command::Hub { port, bind } => {
                let mut hub_config = app_config.hub;
                if let Some(port) = port {
                    hub_config.port = port;
                }
                if let Some(bind) = bind {
                    hub_config.bind_addr = bind;
                }
                run_hub(hub_config).await
            }
            Command::Chat {
                host,
                port,
                id,
                to,
                bell,
            } => {
                let mut link = app_config.link;
                if let Some(host) = host {
                    link.host = host;
                }
                if let Some(port) = port {
                    link.port = port;
                }
                chat::run(chat::ChatOptions {
                    link,
                    user_id: config::resolve_user_id(id.or(app_config.client.user_id)),
                    peer: to.or(app_config.client.peer),
                    download_dir: config::download_dir(app_config.client.download_dir),
                    bell,
                })
                .await
            }
        }
    });

    // Stdin is read on a blocking thread that never finishes on its own
    runtime.shutdown_timeout(Duration::from_millis(200));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_hub(config: HubConfig) -> jetlink_net::Result<()> {
    let hub = Hub::new(config);
    let addr = hub.start().await?;
    tracing::info!(addr = %addr, "Hub listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    hub.stop().await;
    Ok(())
}
