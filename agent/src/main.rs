mod channel;
mod config;
mod dispatch;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::AgentConfig;
use dispatch::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "aether-agent", about = "Private-network half of the aether tunnel")]
struct Cli {
    /// Local port the proxied origin is listening on.
    #[arg(long)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    simple_logger::init_with_level(log::Level::Info)?;

    let config = Arc::new(AgentConfig::load()?);
    let dispatcher = Dispatcher::new(cli.port)?;
    let tunnel = channel::Channel::new();

    let mut driver = {
        let tunnel = tunnel.clone();
        let config = config.clone();
        tokio::spawn(async move {
            channel::run(tunnel, config, move |request, channel| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.dispatch(request, channel).await }
            })
            .await
        })
    };

    tokio::select! {
        result = &mut driver => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            tunnel.close();
            // Race the channel actually quiescing against a 1s cutoff,
            // rather than always paying the full second.
            tokio::select! {
                result = &mut driver => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => log::warn!("tunnel: {err}"),
                        Err(err) => log::warn!("tunnel task panicked: {err}"),
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    log::warn!("tunnel did not quiesce within 1s, exiting anyway");
                }
            }
        }
    }

    Ok(())
}
