/*!
# DON Gateway

Runs the Gateway: the node server DON members dial into and the user server that accepts
JSON-RPC requests.

## Example Usage

```bash
don_gateway --config config/gateway
```

Settings can be overridden from the environment, e.g. `DON_USER_SERVER__PORT=8080`. Log
filtering follows `RUST_LOG`.
*/

use clap::{App, Arg};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use don_gateway::config::{self, GatewayConfig};
use don_gateway::gateway::factory::HandlerFactory;
use don_gateway::gateway::Gateway;
use don_gateway::time::SystemClock;

#[tokio::main]
pub async fn main() -> don_gateway::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = App::new("DON Gateway")
        .about("Runs a Gateway in front of one or more DONs")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .default_value("config/gateway")
                .takes_value(true)
                .help("config file name"),
        )
        .get_matches();
    let config_name = matches.value_of("config").unwrap_or("config/gateway");

    let gateway_config: GatewayConfig = config::load(config_name)?;
    let gateway = Gateway::new(gateway_config, &HandlerFactory::default(), Arc::new(SystemClock))?;
    let addresses = gateway.start().await?;
    info!(node = %addresses.node, user = %addresses.user, "gateway started");

    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    gateway.close().await
}
