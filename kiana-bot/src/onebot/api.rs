//! Outbound action calls over the reverse WebSocket.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{
    event::{MessageEvent, MessageType},
    message::Message,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("connection to the OneBot implementation is closed")]
    Disconnected,

    #[error("action {action} timed out")]
    Timeout { action: String },

    #[error("action {action} failed with retcode {retcode}: {message}")]
    Failed {
        action: String,
        retcode: i64,
        message: String,
    },

    #[error("failed to encode action: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
pub struct ApiRequest<'a> {
    pub action: &'a str,
    pub params: Value,
    pub echo: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(default)]
    pub retcode: i64,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub echo: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub wording: Option<String>,
}

impl ApiResponse {
    fn echo_key(&self) -> Option<String> {
        match self.echo.as_ref()? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// One node of a merged-forward message.
#[derive(Debug, Clone)]
pub struct ForwardNode {
    pub name: String,
    pub uin: String,
    pub content: Message,
}

impl ForwardNode {
    fn to_value(&self) -> Value {
        json!({
            "type": "node",
            "data": {
                "name": self.name,
                "uin": self.uin,
                "content": self.content,
            }
        })
    }
}

struct BotInner {
    self_id: i64,
    outbound: mpsc::Sender<String>,
    pending: Mutex<HashMap<String, oneshot::Sender<ApiResponse>>>,
    next_echo: AtomicU64,
    timeout: Duration,
}

/// Handle to a connected OneBot implementation. Cheap to clone.
#[derive(Clone)]
pub struct Bot {
    inner: Arc<BotInner>,
}

impl Bot {
    /// `outbound` receives serialised action frames for the socket writer.
    pub fn new(self_id: i64, outbound: mpsc::Sender<String>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BotInner {
                self_id,
                outbound,
                pending: Mutex::new(HashMap::new()),
                next_echo: AtomicU64::new(1),
                timeout,
            }),
        }
    }

    pub fn self_id(&self) -> i64 {
        self.inner.self_id
    }

    pub async fn call_api(&self, action: &str, params: Value) -> Result<Value, ApiError> {
        let echo = self.inner.next_echo.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = serde_json::to_string(&ApiRequest {
            action,
            params,
            echo: echo.clone(),
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(echo.clone(), tx);

        debug!("Calling {action} (echo {echo})");

        if self.inner.outbound.send(frame).await.is_err() {
            self.inner.pending.lock().unwrap().remove(&echo);
            return Err(ApiError::Disconnected);
        }

        let response = match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ApiError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&echo);
                return Err(ApiError::Timeout {
                    action: action.to_owned(),
                });
            }
        };

        if response.status == "ok" || response.status == "async" {
            Ok(response.data)
        } else {
            Err(ApiError::Failed {
                action: action.to_owned(),
                retcode: response.retcode,
                message: response
                    .wording
                    .or(response.message)
                    .unwrap_or_default(),
            })
        }
    }

    /// Routes a response frame to the call waiting on its echo.
    pub fn handle_response(&self, response: ApiResponse) {
        let Some(echo) = response.echo_key() else {
            warn!("Dropping API response without echo");
            return;
        };
        match self.inner.pending.lock().unwrap().remove(&echo) {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => debug!("No caller waiting for echo {echo}"),
        }
    }

    /// Fails every in-flight call; used when the socket goes away.
    pub fn fail_pending(&self) {
        self.inner.pending.lock().unwrap().clear();
    }

    /// Replies in the chat the event came from.
    pub async fn send(
        &self,
        event: &MessageEvent,
        message: impl Into<Message>,
    ) -> Result<Value, ApiError> {
        let message = message.into();
        let params = match event.message_type {
            MessageType::Group => json!({
                "message_type": "group",
                "group_id": event.chat_id(),
                "message": message,
            }),
            MessageType::Private => json!({
                "message_type": "private",
                "user_id": event.user_id,
                "message": message,
            }),
        };
        self.call_api("send_msg", params).await
    }

    pub async fn send_forward(
        &self,
        event: &MessageEvent,
        nodes: &[ForwardNode],
    ) -> Result<Value, ApiError> {
        let messages: Vec<Value> = nodes.iter().map(ForwardNode::to_value).collect();
        match event.message_type {
            MessageType::Group => {
                self.call_api(
                    "send_group_forward_msg",
                    json!({ "group_id": event.chat_id(), "messages": messages }),
                )
                .await
            }
            MessageType::Private => {
                self.call_api(
                    "send_private_forward_msg",
                    json!({ "user_id": event.user_id, "messages": messages }),
                )
                .await
            }
        }
    }

    /// A node authored by this bot.
    pub fn forward_node(&self, content: impl Into<Message>) -> ForwardNode {
        ForwardNode {
            name: String::new(),
            uin: self.self_id().to_string(),
            content: content.into(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A bot wired to an in-process responder instead of a socket.

    use std::sync::Arc;

    use serde_json::Value;
    use tokio::sync::{Mutex, mpsc};

    use super::*;

    pub struct Recorded {
        pub bot: Bot,
        pub calls: Arc<Mutex<Vec<Value>>>,
    }

    impl Recorded {
        pub async fn actions(&self) -> Vec<String> {
            self.calls
                .lock()
                .await
                .iter()
                .map(|call| call["action"].as_str().unwrap_or_default().to_owned())
                .collect()
        }

        /// Plain text of every `send_msg` call, in order.
        pub async fn sent_texts(&self) -> Vec<String> {
            self.calls
                .lock()
                .await
                .iter()
                .filter(|call| call["action"] == "send_msg")
                .map(|call| {
                    let message: Message =
                        serde_json::from_value(call["params"]["message"].clone()).unwrap();
                    message.plain_text()
                })
                .collect()
        }
    }

    /// Every call succeeds with `{"message_id": 1}` and is recorded.
    pub fn recording_bot() -> Recorded {
        let (tx, mut rx) = mpsc::channel::<String>(16);
        let bot = Bot::new(42, tx, Duration::from_secs(5));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let responder = bot.clone();
        let sink = Arc::clone(&calls);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let call: Value = serde_json::from_str(&frame).unwrap();
                let echo = call["echo"].clone();
                sink.lock().await.push(call);
                responder.handle_response(ApiResponse {
                    status: "ok".to_owned(),
                    retcode: 0,
                    data: serde_json::json!({ "message_id": 1 }),
                    echo: Some(echo),
                    message: None,
                    wording: None,
                });
            }
        });

        Recorded { bot, calls }
    }
}
