use serde::Deserialize;
use serde_json::Value;

use super::message::Message;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "post_type", rename_all = "snake_case")]
pub enum Event {
    Message(MessageEvent),
    MetaEvent(MetaEvent),
    Notice(Value),
    Request(Value),
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Private,
    Group,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub card: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub time: i64,
    pub self_id: i64,
    pub message_type: MessageType,
    #[serde(default)]
    pub sub_type: String,
    #[serde(default)]
    pub message_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub group_id: Option<i64>,
    pub message: Message,
    #[serde(default)]
    pub raw_message: String,
    #[serde(default)]
    pub sender: Sender,
}

/// Conversation scope: a member inside a group, or a private chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub group_id: Option<i64>,
    pub user_id: i64,
}

impl MessageEvent {
    pub fn is_group(&self) -> bool {
        self.message_type == MessageType::Group
    }

    pub fn session(&self) -> SessionKey {
        SessionKey {
            group_id: self.group_id,
            user_id: self.user_id,
        }
    }

    /// Where replies go: the group for group messages, the sender otherwise.
    pub fn chat_id(&self) -> i64 {
        self.group_id.unwrap_or(self.user_id)
    }

    pub fn plain_text(&self) -> String {
        self.message.plain_text()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaEvent {
    pub meta_event_type: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub interval: Option<u64>,
}

impl MetaEvent {
    pub fn is_heartbeat(&self) -> bool {
        self.meta_event_type == "heartbeat"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn group_message_event() {
        let event: Event = serde_json::from_value(json!({
            "time": 1_700_000_000,
            "self_id": 42,
            "post_type": "message",
            "message_type": "group",
            "sub_type": "normal",
            "message_id": 7,
            "group_id": 123,
            "user_id": 10001,
            "message": [{"type": "text", "data": {"text": "金价"}}],
            "raw_message": "金价",
            "font": 0,
            "sender": {"user_id": 10001, "nickname": "kiana", "role": "member"}
        }))
        .unwrap();

        let Event::Message(event) = event else {
            panic!("expected a message event");
        };
        assert!(event.is_group());
        assert_eq!(event.chat_id(), 123);
        assert_eq!(event.plain_text(), "金价");
        assert_eq!(
            event.session(),
            SessionKey {
                group_id: Some(123),
                user_id: 10001
            }
        );
    }

    #[test]
    fn private_message_replies_to_sender() {
        let event: MessageEvent = serde_json::from_value(json!({
            "self_id": 42,
            "message_type": "private",
            "user_id": 10001,
            "message": "018957"
        }))
        .unwrap();
        assert!(!event.is_group());
        assert_eq!(event.chat_id(), 10001);
        assert_eq!(event.plain_text(), "018957");
    }

    #[test]
    fn meta_and_unknown_events() {
        let heartbeat: Event = serde_json::from_value(json!({
            "post_type": "meta_event",
            "meta_event_type": "heartbeat",
            "interval": 5000,
            "status": {}
        }))
        .unwrap();
        assert!(matches!(heartbeat, Event::MetaEvent(meta) if meta.is_heartbeat()));

        let sent: Event = serde_json::from_value(json!({"post_type": "message_sent"})).unwrap();
        assert!(matches!(sent, Event::Unsupported));
    }
}
