use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::api::Bot;

#[derive(Clone, Serialize)]
pub struct BotInfo {
    pub self_id: i64,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip)]
    pub bot: Bot,
}

/// Bots currently connected over the reverse WebSocket.
#[derive(Default)]
pub struct BotRegistry {
    bots: HashMap<i64, BotInfo>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a bot with the same id is already connected.
    pub fn connect(&mut self, bot: Bot) -> bool {
        let self_id = bot.self_id();
        if self.bots.contains_key(&self_id) {
            return false;
        }
        let now = Utc::now();
        self.bots.insert(
            self_id,
            BotInfo {
                self_id,
                connected_at: now,
                last_heartbeat: now,
                bot,
            },
        );
        true
    }

    pub fn disconnect(&mut self, self_id: i64) -> Option<BotInfo> {
        self.bots.remove(&self_id)
    }

    pub fn contains(&self, self_id: i64) -> bool {
        self.bots.contains_key(&self_id)
    }

    pub fn log_heartbeat(&mut self, self_id: i64) {
        if let Some(info) = self.bots.get_mut(&self_id) {
            info.last_heartbeat = Utc::now();
        }
    }

    pub fn bots(&self) -> Vec<&BotInfo> {
        let mut bots: Vec<&BotInfo> = self.bots.values().collect();
        bots.sort_by_key(|info| info.self_id);
        bots
    }

    pub fn get(&self, self_id: i64) -> Option<&BotInfo> {
        self.bots.get(&self_id)
    }

    pub fn is_online(&self, self_id: i64, grace_period: Duration) -> bool {
        self.bots
            .get(&self_id)
            .is_some_and(|info| Utc::now() - info.last_heartbeat < grace_period)
    }
}
