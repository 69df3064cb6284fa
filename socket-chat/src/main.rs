use std::{io::IsTerminal, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use socket_chat::{
    cli::{Cli, Command, ServerArgs},
    client,
    relay::Relay,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    let mut server = Server::new(listener, Arc::new(Relay::new(args.history)));
    if let Some(limit) = args.max_connections {
        server = server.with_max_connections(limit);
    }

    let addr = server.local_addr()?;
    info!("socket-chat server listening on {}", addr);
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => {
            // A stdin read can still be parked on the blocking pool, and
            // dropping the runtime would wait for it until the user hits enter.
            let code = match client::run(args).await {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("Error: {err:?}");
                    1
                }
            };
            std::process::exit(code);
        }
    }

    Ok(())
}
