use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use localtunnel::ClientConfig;

/// lt - expose your localhost to the world for easy testing and sharing
#[derive(Parser, Debug)]
#[command(name = "lt", version)]
#[command(about = "localtunnel exposes your localhost to the world for easy testing and sharing!")]
#[command(disable_help_flag = true)]
struct Cli {
    /// Internal http server port
    #[arg(short, long)]
    port: u16,

    /// Upstream server providing forwarding [default: https://localtunnel.me]
    #[arg(short = 'h', long)]
    host: Option<String>,

    /// Tunnel traffic to this host instead of localhost
    #[arg(short, long)]
    local_host: Option<String>,

    /// Request this subdomain
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Config file [default: ~/.config/localtunnel/config.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Cli {
    /// Merge CLI flags over the config file
    fn resolve(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)
                .with_context(|| format!("Failed to load config {:?}", path))?,
            None => ClientConfig::try_load_default().unwrap_or_default(),
        };

        if self.host.is_some() {
            config.endpoint = self.host.clone();
        }
        if self.local_host.is_some() {
            config.local_host = self.local_host.clone();
        }
        if self.subdomain.is_some() {
            config.subdomain = self.subdomain.clone();
        }

        if let Err(errors) = config.validate() {
            anyhow::bail!("Invalid configuration: {}", errors.join("; "));
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("localtunnel=info".parse()?),
        )
        .init();

    let config = cli.resolve()?;
    let tunnel = config
        .client()
        .new_tunnel(config.local_host(), cli.port);

    let opened = match &config.subdomain {
        Some(subdomain) => tunnel.open_as(subdomain).await,
        None => tunnel.open().await,
    };
    opened.with_context(|| format!("Failed to open tunnel via {}", config.endpoint()))?;

    println!("your url is: {}", tunnel.url());

    let closing = tunnel.closing();
    tokio::select! {
        _ = closing.wait() => {
            tracing::warn!("Tunnel closed by a connection failure");
        }
        signal = shutdown_signal() => {
            println!("{} received", signal);
            tunnel.close();
        }
    }

    closing.await;
    println!("Bye! tunnel closed");
    Ok(())
}

async fn shutdown_signal() -> &'static str {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "interrupt",
        _ = terminate => "terminated",
    }
}
