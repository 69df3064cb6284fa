use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::history::History;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8081")]
    pub listen: SocketAddr,

    /// Number of recent broadcasts replayed to every new client.
    #[arg(long, default_value_t = History::DEFAULT_CAPACITY)]
    pub history: usize,

    /// Upper bound on simultaneous connections. Unlimited when omitted.
    #[arg(long)]
    pub max_connections: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname sent as the first line after connecting.
    #[arg(long)]
    pub nickname: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:8081")]
    pub server: SocketAddr,
}
