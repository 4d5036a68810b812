/*!
# DON Node

A minimal DON member: keeps sessions open to the configured Gateways and answers the configured
methods by echoing the request payload back, signed with the node key.

```bash
don_node --config config/node
```
*/

use clap::{App, Arg};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use don_gateway::config::{self, NodeConfig};
use don_gateway::connector::echo::EchoHandler;
use don_gateway::connector::GatewayConnector;
use don_gateway::keypair::Keypair;
use don_gateway::time::SystemClock;

#[tokio::main]
pub async fn main() -> don_gateway::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = App::new("DON Node")
        .about("Connects a DON member node to its Gateways")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .default_value("config/node")
                .takes_value(true)
                .help("config file name"),
        )
        .get_matches();
    let config_name = matches.value_of("config").unwrap_or("config/node");

    let node_config: NodeConfig = config::load(config_name)?;
    let keypair = Arc::new(Keypair::from_secret_hex(&node_config.node.secret_key)?);
    info!(node_address = %keypair.address(), "loaded node key");

    let connector = Arc::new(GatewayConnector::new(
        node_config.connector,
        keypair,
        Arc::new(SystemClock),
    )?);
    let methods: Vec<&str> = node_config.node.methods.iter().map(String::as_str).collect();
    if methods.is_empty() {
        warn!("no methods configured, requests from the gateways will be dropped");
    } else {
        connector
            .add_handler(&methods, Arc::new(EchoHandler::new(&connector)))
            .await?;
    }
    connector.start().await?;

    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    connector.close().await
}
