use hixie::prelude::*;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct PingPong;

#[async_trait]
impl MessageHandler for PingPong {
    async fn on_message(&self, conn: &Arc<Connection>, text: String) -> bool {
        info!("Got message '{}' from {}", text, conn.id());
        if text == "CLOSEME" {
            info!("Client requested connection to close");
            return false;
        }

        match conn.write_message("pong").await {
            Ok(()) => true,
            Err(e) => {
                info!("Could not answer {}: {}", conn.id(), e);
                false
            }
        }
    }

    async fn on_open(&self, conn: &Arc<Connection>) {
        println!("✅ Client connected: {}", conn.id());
    }

    async fn on_close(&self, id: &ConnectionId) {
        println!("❌ Client disconnected: {}", id);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::default()
        .with_addr(std::env::var("HIXIE_ADDR").unwrap_or_else(|_| "127.0.0.1:8888".to_string()));

    let server = Server::new(Arc::new(PingPong)).with_config(config);
    let registry = server.registry();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Shutting down gracefully...");
            registry.shutdown().await;
        }
    });

    println!("🏓 Ping-pong server running on ws://{}", server.config().addr);
    server.run().await?;

    Ok(())
}
