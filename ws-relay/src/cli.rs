use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting WebSocket connections on any path.
    Serve(ServeArgs),
    /// Join a relay channel from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "WS_RELAY_LISTEN", default_value = "127.0.0.1:7927")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, env = "WS_RELAY_SERVER", default_value = "127.0.0.1:7927")]
    pub server: SocketAddr,

    /// Channel to join; every connection on the same path shares one relay.
    #[arg(long, default_value = "/")]
    pub channel: String,
}

impl ClientArgs {
    pub fn url(&self) -> String {
        let channel = self.channel.trim();
        if channel.starts_with('/') {
            format!("ws://{}{}", self.server, channel)
        } else {
            format!("ws://{}/{}", self.server, channel)
        }
    }
}
