//! waylay intercepting proxy
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use waylay::{InterceptingProxy, ProxyConfig};

#[derive(Parser, Debug)]
#[command(name = "waylay", version, about = "Intercepting HTTP/HTTPS proxy")]
struct Cli {
  /// TOML configuration file
  #[arg(short, long, env = "WAYLAY_CONFIG")]
  config: Option<PathBuf>,

  /// Listen address, overrides the configuration
  #[arg(short, long, env = "WAYLAY_LISTEN")]
  listen: Option<SocketAddr>,

  /// Directory holding the root CA, overrides the configuration
  #[arg(long, env = "WAYLAY_CA_DIR")]
  ca_dir: Option<PathBuf>,

  /// Print the root CA certificate and exit
  #[arg(long)]
  print_ca: bool,
}

#[tokio::main]
async fn main() -> waylay::Result<()> {
  let cli = Cli::parse();
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("waylay=info")),
    )
    .init();

  let mut config = match &cli.config {
    Some(path) => ProxyConfig::from_toml_file(path)?,
    None => ProxyConfig::default(),
  };
  if let Some(addr) = cli.listen {
    config.listen.addr = addr;
  }
  if let Some(dir) = cli.ca_dir {
    config.ca.dir = Some(dir);
  }

  let proxy = InterceptingProxy::new(config).await?;
  if cli.print_ca {
    print!("{}", proxy.core().root_ca_pem().await?);
    return Ok(());
  }
  if proxy.config().ca.dir.is_none() {
    tracing::warn!("no CA directory configured, the root certificate changes on every start");
  }
  let running = proxy.start().await?;
  tracing::info!(addr = %running.local_addr(), "waylay started");
  tokio::signal::ctrl_c().await?;
  running.shutdown();
  Ok(())
}
