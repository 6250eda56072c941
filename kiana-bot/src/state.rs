use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use shared::BotConfig;

use crate::dispatch::Dispatcher;
use crate::onebot::BotRegistry;

/// A bot without a heartbeat for this long is reported offline.
pub const ONLINE_GRACE_PERIOD: Duration = Duration::minutes(5);

pub struct AppState {
    pub config: Arc<BotConfig>,
    pub registry: RwLock<BotRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Arc<BotConfig>, dispatcher: Arc<Dispatcher>) -> Self {
        AppState {
            config,
            registry: RwLock::new(BotRegistry::new()),
            dispatcher,
            started_at: Utc::now(),
        }
    }
}
