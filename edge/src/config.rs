use clap::Parser;

/// Command-line configuration for the edge.
///
/// Unlike the agent, the edge has no file-backed configuration: everything
/// it needs fits on the command line.
#[derive(Parser, Debug)]
#[command(
    about = "Publicly reachable half of the aether reverse HTTP tunnel",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Listen address for both the public HTTP surface and the tunnel
    /// handshake.
    #[arg(long, default_value = ":8000")]
    pub addr: String,

    /// Shared secret the agent must present in its `Authorization` header.
    /// Empty disables the check.
    #[arg(long, default_value = "")]
    pub secret: String,
}

impl Cli {
    /// Normalize `:PORT` shorthand into a bindable socket address.
    pub fn socket_addr(&self) -> String {
        if let Some(port) = self.addr.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            self.addr.clone()
        }
    }
}
