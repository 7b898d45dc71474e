//! Demo application: echo channels over the hosting layer.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ws_hosting::config::load_config;
use ws_hosting::{
    BinaryChannel, BoxError, ChannelEvent, ChannelSubscriber, ChannelSupplyHandler, EndpointConfig,
    HostingConfig, HostingEndpoint, TextChannel, WebSocketChannelSupplyEndpoint,
    WebSocketEndpointConfig,
};

#[derive(Parser)]
#[command(name = "ws-hosting", about = "WebSocket channel hosting demo server")]
struct Args {
    /// Path to the TOML configuration file. Without one, a demo config
    /// listening on 127.0.0.1:8080 is used.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn demo_config() -> HostingConfig {
    HostingConfig {
        server: vec![EndpointConfig::http("main", "127.0.0.1", 8080)],
        websocket: vec![
            WebSocketEndpointConfig::new("/ws", "text-echo").with_allowed_protocols(["bin-echo"]),
        ],
    }
}

/// Echoes every payload back, wrapped in a small JSON envelope for text
/// channels and verbatim for binary ones.
struct EchoHandler;

impl ChannelSupplyHandler for EchoHandler {
    fn on_open_binary_channel(&self, channel: &Arc<BinaryChannel>) -> Result<(), BoxError> {
        channel.subscribe(Arc::new(BinaryEcho {
            channel: Arc::downgrade(channel),
        }));
        Ok(())
    }

    fn on_open_text_channel(&self, channel: &Arc<TextChannel>) -> Result<(), BoxError> {
        channel.subscribe(Arc::new(TextEcho {
            channel: Arc::downgrade(channel),
        }));
        Ok(())
    }
}

struct TextEcho {
    channel: Weak<TextChannel>,
}

#[async_trait]
impl ChannelSubscriber<String> for TextEcho {
    async fn on_event(&self, event: ChannelEvent<String>) -> Result<(), BoxError> {
        match event {
            ChannelEvent::Data(payload) => {
                let Some(channel) = self.channel.upgrade() else {
                    return Ok(());
                };
                let reply = json!({
                    "subProtocol": channel.kind(),
                    "echo": payload,
                });
                channel
                    .send(reply.to_string())
                    .await
                    .map_err(|e| Box::new(e) as BoxError)
            }
            ChannelEvent::Fault(fault) => {
                tracing::debug!(fault = %fault, "text channel finished");
                Ok(())
            }
        }
    }
}

struct BinaryEcho {
    channel: Weak<BinaryChannel>,
}

#[async_trait]
impl ChannelSubscriber<bytes::Bytes> for BinaryEcho {
    async fn on_event(&self, event: ChannelEvent<bytes::Bytes>) -> Result<(), BoxError> {
        match event {
            ChannelEvent::Data(payload) => {
                let Some(channel) = self.channel.upgrade() else {
                    return Ok(());
                };
                channel
                    .send(payload)
                    .await
                    .map_err(|e| Box::new(e) as BoxError)
            }
            ChannelEvent::Fault(fault) => {
                tracing::debug!(fault = %fault, "binary channel finished");
                Ok(())
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ws_hosting=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => {
            tracing::info!("no config file given, using demo configuration");
            demo_config()
        }
    };

    let mut servers = Vec::new();
    for server_config in config.server {
        let endpoint = Arc::new(HostingEndpoint::new(server_config)?);
        endpoint.set_root_application(
            Router::new().route("/", get(|| async { "ws-hosting echo server" })),
        )?;
        servers.push(endpoint);
    }

    let handler = Arc::new(EchoHandler);
    let mut ws_endpoints = Vec::new();
    for ws_config in config.websocket {
        let bound_servers = ws_config.servers.clone();
        let ws_endpoint = WebSocketChannelSupplyEndpoint::new(ws_config, handler.clone());
        for server in &servers {
            if bound_servers.is_empty() || bound_servers.iter().any(|n| n == server.name()) {
                ws_endpoint.bind(server)?;
            }
        }
        ws_endpoints.push(ws_endpoint);
    }

    for server in &servers {
        server.init().await?;
    }

    shutdown_signal().await?;
    tracing::info!("shutdown signal received");

    // Channel endpoints first, so peers get a clean going-away close
    // while the listeners still run.
    for ws_endpoint in &ws_endpoints {
        ws_endpoint.dispose().await;
    }
    for server in &servers {
        server.dispose().await;
    }

    tracing::info!("shutdown complete");
    Ok(())
}
