//! Reverse WebSocket endpoint the OneBot implementation connects to.

use std::{fmt::Display, sync::Arc};

use axum::{
    Router,
    extract::{
        State,
        ws::{Message as WsMessage, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    api::{ApiResponse, Bot},
    event::Event,
};
use crate::state::AppState;

const OUTBOUND_BUFFER: usize = 64;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/onebot/v11/ws", get(websocket))
        .route("/onebot/v11/ws/", get(websocket))
}

async fn websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    match admit(&state, &headers) {
        Ok(self_id) => ws.on_upgrade(move |socket| {
            let (sink, stream) = socket.split();
            serve_connection(sink, stream, state, self_id)
        }),
        Err(rejection) => rejection.into_response(),
    }
}

/// Decides whether a connection may upgrade; yields its self id.
pub fn admit(state: &AppState, headers: &HeaderMap) -> Result<i64, (StatusCode, &'static str)> {
    authorize(headers, state.config.access_token.as_deref())?;

    let self_id = headers
        .get("x-self-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or((StatusCode::BAD_REQUEST, "Missing or invalid X-Self-ID"))?;

    if state.registry.read().unwrap().contains(self_id) {
        warn!("Refusing duplicate connection for bot {self_id}");
        return Err((StatusCode::CONFLICT, "Bot already connected"));
    }
    Ok(self_id)
}

/// Checks `Authorization: Bearer <token>` (or `Token <token>`) when an
/// access token is configured.
pub fn authorize(
    headers: &HeaderMap,
    access_token: Option<&str>,
) -> Result<(), (StatusCode, &'static str)> {
    let Some(expected) = access_token else {
        return Ok(());
    };

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("Token "))
        })
        .map(str::trim);

    match presented {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err((StatusCode::FORBIDDEN, "Invalid access token")),
        None => Err((StatusCode::UNAUTHORIZED, "Missing access token")),
    }
}

/// Runs one bot connection until its stream ends, then fails its pending
/// calls and removes it from the registry.
async fn serve_connection<Tx, Rx, E>(
    mut sink: Tx,
    mut stream: Rx,
    state: Arc<AppState>,
    self_id: i64,
) where
    Tx: Sink<WsMessage> + Unpin + Send + 'static,
    Tx::Error: Display,
    Rx: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let bot = Bot::new(self_id, tx, state.config.api_timeout);

    if !state.registry.write().unwrap().connect(bot.clone()) {
        warn!("Bot {self_id} connected twice, closing the newer socket");
        return;
    }
    info!("Bot {self_id} connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                warn!("Failed to write frame: {e}");
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => handle_frame(&state, &bot, text.as_str()),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Bot {self_id} socket error: {e}");
                break;
            }
        }
    }

    writer.abort();
    bot.fail_pending();
    state.registry.write().unwrap().disconnect(self_id);
    info!("Bot {self_id} disconnected");
}

/// Events go to the dispatcher on their own task; responses wake the
/// matching caller.
pub fn handle_frame(state: &Arc<AppState>, bot: &Bot, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Ignoring malformed frame: {e}");
            return;
        }
    };

    if value.get("post_type").is_some() {
        match serde_json::from_value::<Event>(value) {
            Ok(Event::Message(event)) => {
                debug!(
                    "Message {} from {} in {:?}: {}",
                    event.message_id, event.user_id, event.group_id, event.message
                );
                let dispatcher = Arc::clone(&state.dispatcher);
                let bot = bot.clone();
                tokio::spawn(async move { dispatcher.dispatch(bot, event).await });
            }
            Ok(Event::MetaEvent(meta)) if meta.is_heartbeat() => {
                state.registry.write().unwrap().log_heartbeat(bot.self_id());
            }
            Ok(Event::MetaEvent(meta)) => {
                debug!("Lifecycle event {:?} for bot {}", meta.sub_type, bot.self_id());
            }
            Ok(Event::Notice(_) | Event::Request(_) | Event::Unsupported) => {}
            Err(e) => warn!("Ignoring undecodable event: {e}"),
        }
    } else if value.get("echo").is_some() {
        match serde_json::from_value::<ApiResponse>(value) {
            Ok(response) => bot.handle_response(response),
            Err(e) => warn!("Ignoring undecodable API response: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, time::Duration};

    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
    use serde_json::json;
    use shared::BotConfig;

    use super::*;
    use crate::{
        dispatch::{Dispatcher, Matcher, Sessions},
        onebot::{ApiError, MessageEvent},
    };

    fn headers_with(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    fn self_id_header(self_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-self-id", HeaderValue::from_str(self_id).unwrap());
        headers
    }

    fn app_state(matchers: Vec<Arc<dyn Matcher>>) -> Arc<AppState> {
        let config = BotConfig::from_lookup(|_| None).unwrap();
        let sessions = Arc::new(Sessions::new(Duration::from_secs(1)));
        let dispatcher = Dispatcher::new(matchers, sessions, &[]);
        Arc::new(AppState::new(Arc::new(config), Arc::new(dispatcher)))
    }

    struct Connection {
        inbound: UnboundedSender<Result<WsMessage, Infallible>>,
        outbound: UnboundedReceiver<WsMessage>,
        bot: Bot,
        task: tokio::task::JoinHandle<()>,
    }

    /// Serves a connection over in-memory channels and waits for it to register.
    async fn connect(state: &Arc<AppState>, self_id: i64) -> Connection {
        let (inbound, stream) = unbounded();
        let (sink, outbound) = unbounded();
        let task = tokio::spawn(serve_connection(sink, stream, Arc::clone(state), self_id));

        let bot = loop {
            if let Some(info) = state.registry.read().unwrap().get(self_id) {
                break info.bot.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        Connection {
            inbound,
            outbound,
            bot,
            task,
        }
    }

    impl Connection {
        fn push(&self, frame: Value) {
            self.inbound
                .unbounded_send(Ok(WsMessage::Text(frame.to_string().into())))
                .unwrap();
        }

        async fn next_call(&mut self) -> Value {
            match self.outbound.next().await {
                Some(WsMessage::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("unexpected outbound frame {other:?}"),
            }
        }
    }

    struct Seen(tokio::sync::mpsc::UnboundedSender<String>);

    #[async_trait]
    impl Matcher for Seen {
        fn plugin(&self) -> &'static str {
            "seen"
        }

        fn matches(&self, _event: &MessageEvent) -> bool {
            true
        }

        async fn handle(&self, _bot: &Bot, event: &MessageEvent) -> anyhow::Result<()> {
            let _ = self.0.send(event.plain_text());
            Ok(())
        }
    }

    #[test]
    fn no_token_configured_accepts_everyone() {
        assert!(authorize(&HeaderMap::new(), None).is_ok());
    }

    #[test]
    fn token_must_match() {
        assert!(authorize(&headers_with("Bearer s3cret"), Some("s3cret")).is_ok());
        assert!(authorize(&headers_with("Token s3cret"), Some("s3cret")).is_ok());
        assert_eq!(
            authorize(&headers_with("Bearer nope"), Some("s3cret")).unwrap_err().0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            authorize(&HeaderMap::new(), Some("s3cret")).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn upgrade_needs_a_self_id_not_already_connected() {
        let state = app_state(Vec::new());
        assert_eq!(admit(&state, &HeaderMap::new()).unwrap_err().0, StatusCode::BAD_REQUEST);
        assert_eq!(admit(&state, &self_id_header("abc")).unwrap_err().0, StatusCode::BAD_REQUEST);
        assert_eq!(admit(&state, &self_id_header("42")), Ok(42));

        let (tx, _rx) = mpsc::channel(1);
        state
            .registry
            .write()
            .unwrap()
            .connect(Bot::new(42, tx, Duration::from_secs(1)));
        assert_eq!(admit(&state, &self_id_header("42")).unwrap_err().0, StatusCode::CONFLICT);
        assert_eq!(admit(&state, &self_id_header("43")), Ok(43));
    }

    #[tokio::test]
    async fn responses_reach_the_caller_by_echo() {
        let state = app_state(Vec::new());
        let mut conn = connect(&state, 42).await;

        let bot = conn.bot.clone();
        let call = tokio::spawn(async move { bot.call_api("get_login_info", json!({})).await });

        let request = conn.next_call().await;
        assert_eq!(request["action"], "get_login_info");
        conn.push(json!({
            "status": "ok",
            "retcode": 0,
            "data": {"user_id": 42, "nickname": "kiana"},
            "echo": request["echo"]
        }));

        let data = call.await.unwrap().unwrap();
        assert_eq!(data["nickname"], "kiana");
    }

    #[tokio::test]
    async fn heartbeats_refresh_the_registry() {
        let state = app_state(Vec::new());
        let conn = connect(&state, 42).await;
        let connected = state.registry.read().unwrap().get(42).unwrap().last_heartbeat;

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle_frame(
            &state,
            &conn.bot,
            &json!({"post_type": "meta_event", "meta_event_type": "heartbeat", "self_id": 42})
                .to_string(),
        );
        assert!(state.registry.read().unwrap().get(42).unwrap().last_heartbeat > connected);
    }

    #[tokio::test]
    async fn message_events_are_dispatched() {
        let (tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
        let state = app_state(vec![Arc::new(Seen(tx))]);
        let conn = connect(&state, 42).await;

        conn.push(json!({
            "post_type": "message",
            "self_id": 42,
            "message_type": "private",
            "user_id": 7,
            "message": "hello"
        }));
        // Malformed frames are skipped without closing the connection
        conn.inbound
            .unbounded_send(Ok(WsMessage::Text("not json".into())))
            .unwrap();
        conn.push(json!({
            "post_type": "message",
            "self_id": 42,
            "message_type": "private",
            "user_id": 7,
            "message": "again"
        }));

        let mut texts = vec![seen.recv().await.unwrap(), seen.recv().await.unwrap()];
        texts.sort();
        assert_eq!(texts, ["again", "hello"]);
    }

    #[tokio::test]
    async fn closing_fails_in_flight_calls_and_unregisters() {
        let state = app_state(Vec::new());
        let mut conn = connect(&state, 42).await;

        let bot = conn.bot.clone();
        let call = tokio::spawn(async move { bot.call_api("get_status", json!({})).await });
        conn.next_call().await;

        drop(conn.inbound);
        conn.task.await.unwrap();

        assert!(matches!(call.await.unwrap(), Err(ApiError::Disconnected)));
        assert!(!state.registry.read().unwrap().contains(42));
    }
}
