//! CLI for meshbus
//!
//! Subcommands:
//! - `broker`: run the message broker
//! - `publish`: publish one message through a running broker (smoke test)
//! - `discover`: resolve a service name through the discovery authority

use std::sync::Arc;

use clap::Parser;
use meshbus::broker::BrokerState;
use meshbus::client::MessagePublisher;
use meshbus::config::{Settings, load_config};
use meshbus::discovery::{DiscoveryClient, RegistrationAgent};
use meshbus::transport::websocket::start_websocket_server;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "meshbus")]
enum Command {
    /// Start the message broker
    Broker,
    /// Publish one JSON payload and print the result
    Publish {
        /// Topic to publish on
        topic: String,
        /// JSON payload
        payload: String,
        /// Type identifier sent with the payload
        #[arg(long, default_value = "serde_json::Value")]
        message_type: String,
        /// Broker URL, overrides `publisher.broker_url`
        #[arg(long, env = "MESHBUS_BROKER_URL")]
        url: Option<String>,
        /// Service name to register as, overrides `publisher.service_name`
        #[arg(long)]
        service: Option<String>,
    },
    /// Resolve a service name to its endpoint
    Discover {
        service_name: String,
        /// Discovery authority URL, overrides `discovery.base_url`
        #[arg(long)]
        base_url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            meshbus::utils::logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    meshbus::utils::logging::init(&settings.logging.level);

    let outcome = match cmd {
        Command::Broker => run_broker(settings).await,
        Command::Publish {
            topic,
            payload,
            message_type,
            url,
            service,
        } => run_publish(settings, &topic, payload, &message_type, url, service).await,
        Command::Discover {
            service_name,
            base_url,
        } => run_discover(settings, &service_name, base_url).await,
    };

    if let Err(e) = outcome {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_broker(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let broker = Arc::new(BrokerState::new().with_max_connections(settings.broker.max_connections));

    let agent = if settings.discovery.registration.auto_register {
        let client = DiscoveryClient::new(&settings.discovery)?;
        Some(Arc::new(RegistrationAgent::new(client, &settings.discovery)))
    } else {
        None
    };
    let cancel = CancellationToken::new();
    if let Some(agent) = &agent {
        if agent.start().await {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(cancel).await });
        }
    }

    tokio::select! {
        result = start_websocket_server(&addr, broker.clone()) => {
            if let Err(e) = result {
                error!("WebSocket server failed: {}", e);
            } else {
                error!("WebSocket server exited unexpectedly.");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    let closed = broker.close_all();
    info!(connections = closed, "closed client connections");

    cancel.cancel();
    if let Some(agent) = agent {
        agent.stop().await;
    }
    Ok(())
}

async fn run_publish(
    mut settings: Settings,
    topic: &str,
    payload: String,
    message_type: &str,
    url: Option<String>,
    service: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    // reject payloads that are not JSON before connecting
    serde_json::from_str::<serde_json::Value>(&payload)?;

    if let Some(url) = url {
        settings.publisher.broker_url = url;
    }
    if let Some(service) = service {
        settings.publisher.service_name = service;
    }

    let publisher = MessagePublisher::new(&settings.publisher);
    let result = publisher
        .publish_raw(topic, message_type, payload, None)
        .await;
    publisher.close();

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        return Err(result
            .error
            .unwrap_or_else(|| "publish failed".to_string())
            .into());
    }
    Ok(())
}

async fn run_discover(
    mut settings: Settings,
    service_name: &str,
    base_url: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(base_url) = base_url {
        settings.discovery.base_url = base_url;
    }

    let client = DiscoveryClient::new(&settings.discovery)?;
    match client.discover(service_name).await {
        Some(endpoint) => {
            println!("{}", serde_json::to_string_pretty(&endpoint)?);
            Ok(())
        }
        None => {
            warn!(service = service_name, "service not found");
            Err(format!("service '{service_name}' not found").into())
        }
    }
}
