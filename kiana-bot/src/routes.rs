use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::{AppState, ONLINE_GRACE_PERIOD};

#[derive(Serialize)]
pub struct BotStatus {
    self_id: i64,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    online: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    environment: String,
    started_at: String,
    uptime_secs: i64,
    matchers: usize,
    bots: Vec<BotStatus>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/status", get(status))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let registry = state.registry.read().unwrap();
    let bots = registry
        .bots()
        .into_iter()
        .map(|info| BotStatus {
            self_id: info.self_id,
            connected_at: info.connected_at,
            last_heartbeat: info.last_heartbeat,
            online: registry.is_online(info.self_id, ONLINE_GRACE_PERIOD),
        })
        .collect();

    Json(StatusResponse {
        environment: state.config.environment.clone(),
        started_at: state.started_at.to_rfc3339(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        matchers: state.dispatcher.matcher_count(),
        bots,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shared::BotConfig;
    use tokio::sync::mpsc;

    use super::*;
    use crate::dispatch::{Dispatcher, Sessions};
    use crate::onebot::Bot;

    #[tokio::test]
    async fn status_lists_connected_bots() {
        let config = BotConfig::from_lookup(|key| (key == "ENVIRONMENT").then(|| "dev".to_owned())).unwrap();
        let dispatcher = Dispatcher::new(Vec::new(), Arc::new(Sessions::new(Duration::from_secs(1))), &[]);
        let state = Arc::new(AppState::new(Arc::new(config), Arc::new(dispatcher)));

        let (tx, _rx) = mpsc::channel(1);
        state
            .registry
            .write()
            .unwrap()
            .connect(Bot::new(42, tx, Duration::from_secs(1)));

        let Json(response) = status(State(Arc::clone(&state))).await;
        assert_eq!(response.environment, "dev");
        assert_eq!(response.bots.len(), 1);
        assert_eq!(response.bots[0].self_id, 42);
        assert!(response.bots[0].online);
    }
}
