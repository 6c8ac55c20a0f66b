use hixie::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    from: &'a str,
    text: &'a str,
    timestamp: u64,
}

struct ChatRoom {
    registry: Arc<ConnectionRegistry>,
}

impl ChatRoom {
    async fn announce(&self, from: &str, text: &str) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        match serde_json::to_string(&ChatMessage {
            from,
            text,
            timestamp,
        }) {
            Ok(json) => {
                let report = self.registry.broadcast(&json).await;
                if !report.failed.is_empty() {
                    println!("⚠️  Could not reach {:?}", report.failed);
                }
            }
            Err(e) => eprintln!("Failed to encode message: {}", e),
        }
    }
}

#[async_trait]
impl MessageHandler for ChatRoom {
    async fn on_message(&self, conn: &Arc<Connection>, text: String) -> bool {
        match text.as_str() {
            "/quit" => false,
            "/who" => {
                let mut online = Vec::new();
                for id in self.registry.ids().await {
                    if let Some(other) = self.registry.get(&id).await {
                        online.push(other.info().clone());
                    }
                }
                conn.write_json(&online).await.is_ok()
            }
            _ => {
                println!("💬 {} says: {}", conn.id(), text);
                self.announce(conn.id(), &text).await;
                true
            }
        }
    }

    async fn on_open(&self, conn: &Arc<Connection>) {
        println!("✅ User joined the chat: {}", conn.id());
        self.announce("System", &format!("{} joined the chat", conn.id()))
            .await;
    }

    async fn on_close(&self, id: &ConnectionId) {
        println!("❌ User left the chat: {}", id);
        self.announce("System", &format!("{} left the chat", id)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let registry = Arc::new(ConnectionRegistry::new());
    let room = Arc::new(ChatRoom {
        registry: registry.clone(),
    });

    let addr = std::env::var("HIXIE_ADDR").unwrap_or_else(|_| "127.0.0.1:9000".to_string());
    let server = Server::new(room).with_registry(registry.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            registry.shutdown().await;
        }
    });

    println!("💬 Chat server running on ws://{}", addr);
    println!("📊 Send any text to broadcast it, /who to list users, /quit to leave");

    server.listen(addr).await?;

    Ok(())
}
