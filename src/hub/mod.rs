//! Broadcast hub.
//!
//! [`ChatHub::submit`] drives one client message through its whole lifecycle: the user
//! message goes out to everyone, the gateway is asked for a reply, and the reply goes
//! out to everyone. Each submit runs as its own task, so a slow backend call only
//! delays the conversation that made it.

pub mod registry;

pub use registry::{Broadcaster, ConnectionRegistry};

use crate::error::{RelayError, Result};
use crate::gateway::{display_text, InferenceGateway};
use crate::models::{ChatMessage, ConnectionId};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sequences user messages and gateway replies onto the broadcast channel
pub struct ChatHub {
    broadcaster: Arc<dyn Broadcaster>,
    gateway: Arc<dyn InferenceGateway>,
}

impl ChatHub {
    pub fn new(broadcaster: Arc<dyn Broadcaster>, gateway: Arc<dyn InferenceGateway>) -> Self {
        Self {
            broadcaster,
            gateway,
        }
    }

    /// Relay one message from `sender` to all clients, followed by the AI reply.
    ///
    /// Never fails: anything that goes wrong outside the gateway's own error handling is
    /// reported to clients as a `System` message instead of the reply.
    pub async fn submit(&self, sender: ConnectionId, text: String) {
        info!("Message from connection {} ({} chars)", sender, text.len());

        if let Err(e) = self.relay(&text).await {
            warn!("Relay for connection {} failed: {}", sender, e);

            let notice = ChatMessage::system(format!("Error: {}", e));
            if let Err(e) = self.broadcaster.broadcast_to_all(notice).await {
                error!("Could not report failure to clients: {}", e);
            }
        }
    }

    /// Run [`submit`](Self::submit) on its own task
    pub fn spawn_submit(self: &Arc<Self>, sender: ConnectionId, text: String) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move { hub.submit(sender, text).await })
    }

    async fn relay(&self, text: &str) -> Result<()> {
        let reached = self.broadcaster.broadcast_to_all(ChatMessage::user(text)).await?;
        debug!("User message delivered to {} connections", reached);

        let result = AssertUnwindSafe(self.gateway.get_response(text))
            .catch_unwind()
            .await
            .map_err(|payload| RelayError::GatewayError(panic_message(payload)))?;

        if let Err(e) = &result {
            warn!("Inference failed ({}): {}", e.kind(), e);
        }

        let reply = ChatMessage::ai(display_text(&result));
        let reached = self.broadcaster.broadcast_to_all(reply).await?;
        debug!("AI message delivered to {} connections", reached);

        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "gateway panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{HttpInferenceGateway, InferenceError, InferenceResult};
    use crate::models::{Sender, ServerEvent};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Records every message and fails on request
    #[derive(Default)]
    struct RecordingBroadcaster {
        sent: Mutex<Vec<ChatMessage>>,
        fail_for: Vec<Sender>,
    }

    impl RecordingBroadcaster {
        fn failing_for(senders: &[Sender]) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_for: senders.to_vec(),
            }
        }

        fn sent(&self) -> Vec<(Sender, String)> {
            self.sent.lock().unwrap().iter().map(|m| (m.sender, m.text.clone())).collect()
        }
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn broadcast_to_all(&self, message: ChatMessage) -> Result<usize> {
            if self.fail_for.contains(&message.sender) {
                return Err(RelayError::BroadcastError("transport down".to_string()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(1)
        }
    }

    /// Answers from a fixed table; messages listed in `held` wait for `release`
    #[derive(Default)]
    struct ScriptedGateway {
        replies: HashMap<String, InferenceResult>,
        held: Vec<String>,
        release: Notify,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedGateway {
        fn reply(mut self, message: &str, result: InferenceResult) -> Self {
            self.replies.insert(message.to_string(), result);
            self
        }

        fn hold(mut self, message: &str) -> Self {
            self.held.push(message.to_string());
            self
        }
    }

    #[async_trait]
    impl InferenceGateway for ScriptedGateway {
        async fn get_response(&self, message: &str) -> InferenceResult {
            self.calls.lock().unwrap().push(message.to_string());
            if self.held.iter().any(|m| m == message) {
                self.release.notified().await;
            }
            self.replies.get(message).cloned().unwrap_or_else(|| Ok(format!("echo: {}", message)))
        }
    }

    struct PanickingGateway;

    #[async_trait]
    impl InferenceGateway for PanickingGateway {
        async fn get_response(&self, _message: &str) -> InferenceResult {
            panic!("model crashed");
        }
    }

    fn hub_with(
        broadcaster: Arc<RecordingBroadcaster>,
        gateway: Arc<dyn InferenceGateway>,
    ) -> Arc<ChatHub> {
        Arc::new(ChatHub::new(broadcaster, gateway))
    }

    #[tokio::test]
    async fn test_user_message_precedes_reply() {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let gateway = ScriptedGateway::default().reply("hello", Ok("Hi there!".to_string()));
        let hub = hub_with(broadcaster.clone(), Arc::new(gateway));

        hub.submit(ConnectionId::new(), "hello".to_string()).await;

        assert_eq!(
            broadcaster.sent(),
            vec![(Sender::User, "hello".to_string()), (Sender::Ai, "Hi there!".to_string())]
        );
    }

    #[tokio::test]
    async fn test_gateway_error_is_broadcast_as_ai_message() {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let gateway = ScriptedGateway::default().reply(
            "hello",
            Err(InferenceError::BackendStatus {
                status: 500,
                body: "oops".to_string(),
            }),
        );
        let hub = hub_with(broadcaster.clone(), Arc::new(gateway));

        hub.submit(ConnectionId::new(), "hello".to_string()).await;

        assert_eq!(
            broadcaster.sent()[1],
            (Sender::Ai, "Error: Python AI API failed - oops".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_reply_broadcast_becomes_system_message() {
        let broadcaster = Arc::new(RecordingBroadcaster::failing_for(&[Sender::Ai]));
        let hub = hub_with(broadcaster.clone(), Arc::new(ScriptedGateway::default()));

        hub.submit(ConnectionId::new(), "hello".to_string()).await;

        assert_eq!(
            broadcaster.sent(),
            vec![
                (Sender::User, "hello".to_string()),
                (Sender::System, "Error: Broadcast error: transport down".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_user_broadcast_skips_gateway() {
        let broadcaster = Arc::new(RecordingBroadcaster::failing_for(&[Sender::User]));
        let gateway = Arc::new(ScriptedGateway::default());
        let hub = hub_with(broadcaster.clone(), gateway.clone());

        hub.submit(ConnectionId::new(), "hello".to_string()).await;

        assert!(gateway.calls.lock().unwrap().is_empty());
        assert_eq!(
            broadcaster.sent(),
            vec![(Sender::System, "Error: Broadcast error: transport down".to_string())]
        );
    }

    #[tokio::test]
    async fn test_total_broadcast_failure_does_not_escape() {
        let broadcaster = Arc::new(RecordingBroadcaster::failing_for(&[
            Sender::User,
            Sender::Ai,
            Sender::System,
        ]));
        let hub = hub_with(broadcaster.clone(), Arc::new(ScriptedGateway::default()));

        hub.spawn_submit(ConnectionId::new(), "hello".to_string()).await.unwrap();

        assert!(broadcaster.sent().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_panic_becomes_system_message() {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let hub = hub_with(broadcaster.clone(), Arc::new(PanickingGateway));

        hub.spawn_submit(ConnectionId::new(), "hello".to_string()).await.unwrap();

        assert_eq!(
            broadcaster.sent(),
            vec![
                (Sender::User, "hello".to_string()),
                (Sender::System, "Error: Inference gateway error: model crashed".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_fast_submit_not_blocked_by_slow_one() {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let gateway = Arc::new(
            ScriptedGateway::default()
                .reply("slow", Ok("slow reply".to_string()))
                .reply("fast", Ok("fast reply".to_string()))
                .hold("slow"),
        );
        let hub = hub_with(broadcaster.clone(), gateway.clone());

        let slow = hub.spawn_submit(ConnectionId::new(), "slow".to_string());
        while gateway.calls.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let fast = hub.spawn_submit(ConnectionId::new(), "fast".to_string());
        tokio::time::timeout(Duration::from_secs(5), fast)
            .await
            .expect("fast submit waited on the slow backend call")
            .unwrap();

        assert_eq!(
            broadcaster.sent(),
            vec![
                (Sender::User, "slow".to_string()),
                (Sender::User, "fast".to_string()),
                (Sender::Ai, "fast reply".to_string()),
            ]
        );

        gateway.release.notify_one();
        slow.await.unwrap();

        assert_eq!(broadcaster.sent()[3], (Sender::Ai, "slow reply".to_string()));
    }

    #[tokio::test]
    async fn test_repeated_submits_are_independent() {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let gateway = Arc::new(ScriptedGateway::default());
        let hub = hub_with(broadcaster.clone(), gateway.clone());
        let sender = ConnectionId::new();

        hub.submit(sender, "again".to_string()).await;
        hub.submit(sender, "again".to_string()).await;

        let pair =
            vec![(Sender::User, "again".to_string()), (Sender::Ai, "echo: again".to_string())];
        assert_eq!(broadcaster.sent(), [pair.clone(), pair].concat());
        assert_eq!(gateway.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_end_to_end_through_registry() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/ai-chat")
            .with_status(200)
            .with_body("Rust is a systems language.\n")
            .create_async()
            .await;

        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(1)));
        let gateway =
            HttpInferenceGateway::with_endpoint(format!("{}/ai-chat", server.url())).unwrap();
        let hub = Arc::new(ChatHub::new(registry.clone(), Arc::new(gateway)));

        let (author, mut rx_author) = registry.register().unwrap();
        let (_watcher, mut rx_watcher) = registry.register().unwrap();

        hub.spawn_submit(author, "What is Rust?".to_string()).await.unwrap();

        for rx in [&mut rx_author, &mut rx_watcher] {
            let received: Vec<(Sender, String)> = [rx.recv().await, rx.recv().await]
                .into_iter()
                .map(|event| match event {
                    Some(ServerEvent::ReceiveMessage(m)) => (m.sender, m.text),
                    other => panic!("Expected ReceiveMessage, got {:?}", other),
                })
                .collect();

            assert_eq!(
                received,
                vec![
                    (Sender::User, "What is Rust?".to_string()),
                    (Sender::Ai, "Rust is a systems language.".to_string()),
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_still_completes_sequence() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(1)));
        let gateway =
            HttpInferenceGateway::with_endpoint(format!("http://{}/ai-chat", addr)).unwrap();
        let hub = Arc::new(ChatHub::new(registry.clone(), Arc::new(gateway)));
        let (id, mut rx) = registry.register().unwrap();

        tokio::time::timeout(Duration::from_secs(10), hub.spawn_submit(id, "ping".to_string()))
            .await
            .unwrap()
            .unwrap();

        let mut messages = Vec::new();
        while let Ok(Some(ServerEvent::ReceiveMessage(m))) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            messages.push(m);
        }

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[1].sender, Sender::Ai);
        assert!(messages[1].text.starts_with("Error: "));
    }
}
