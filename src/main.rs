use std::sync::Arc;
use std::time::Duration;

use relay_gateway::{Gateway, GatewayConfig, ServerConfig};
use relay_rpc::{RpcConfig, ToolClient, ToolInvoker};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting relay server");

    let gateway_config = GatewayConfig {
        max_history_size: env_usize("RELAY_MAX_HISTORY", 1000),
        retention_window: env_duration_ms("RELAY_RETENTION_MS", 86_400_000),
        ..GatewayConfig::default()
    };
    let server_config = ServerConfig {
        port: env_u16("RELAY_PORT", 3033),
        sweep_interval: env_duration_ms("RELAY_CLEANUP_INTERVAL_MS", 60_000),
    };

    let gateway = Arc::new(Gateway::new(gateway_config));

    // Optional upstream tool endpoint
    let tools: Option<Arc<dyn ToolInvoker>> = match std::env::var("RELAY_TOOL_URL") {
        Ok(url) if !url.is_empty() => {
            let config = RpcConfig {
                url,
                reconnect_interval: env_duration_ms("RELAY_RECONNECT_INTERVAL_MS", 5000),
                request_timeout: env_duration_ms("RELAY_REQUEST_TIMEOUT_MS", 30_000),
            };
            let client = Arc::new(ToolClient::new(config));

            // Bring the connection up in the background; calls reconnect on
            // demand if this first attempt fails.
            let warmup = Arc::clone(&client);
            tokio::spawn(async move {
                if let Err(error) = warmup.connect().await {
                    tracing::warn!(%error, "initial tool endpoint connect failed");
                }
            });
            Some(client)
        }
        _ => {
            tracing::info!("no tool endpoint configured (RELAY_TOOL_URL unset)");
            None
        }
    };

    let handle = relay_gateway::start(server_config, gateway, tools)
        .await
        .expect("Failed to start server");
    tracing::info!(port = handle.port, "relay ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("Shutting down");
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration_ms(name: &str, default: u64) -> Duration {
    let ms = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    Duration::from_millis(ms)
}
