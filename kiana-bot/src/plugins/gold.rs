//! `金价`: the bank's current gold buying price.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc, Weekday};
use chrono_tz::Tz;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::{PluginContext, header_map};
use crate::{
    dispatch::Matcher,
    onebot::{Bot, MessageEvent},
    settings::GoldSettings,
};

const PLUGIN: &str = "gold";
const CLOSED_SUFFIX: &str = "（当前非交易时间，返回最后交易价格）";

#[derive(Debug, Error)]
pub enum GoldError {
    #[error("获取金价失败")]
    Request(#[from] reqwest::Error),
    #[error("获取金价失败")]
    Rejected,
    #[error("解析金价数据失败")]
    Parse(#[from] serde_json::Error),
    #[error("金价数据格式错误")]
    Format,
}

/// Gold trading is closed on weekends.
pub fn is_market_closed(now: DateTime<Tz>) -> bool {
    matches!(now.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Pulls `data.FQAMBPRCZ1.zBuyPrc` out of a market-center response.
pub fn extract_price(body: &str) -> Result<String, GoldError> {
    let json: Value = serde_json::from_str(body)?;
    if !json["success"].as_bool().unwrap_or(false) {
        return Err(GoldError::Rejected);
    }

    match json
        .get("data")
        .and_then(|data| data.get("FQAMBPRCZ1"))
        .and_then(|product| product.get("zBuyPrc"))
    {
        Some(Value::String(price)) => Ok(price.clone()),
        Some(Value::Number(price)) => Ok(price.to_string()),
        _ => Err(GoldError::Format),
    }
}

pub struct GoldPrice {
    http: Client,
    settings: GoldSettings,
    timezone: Tz,
    cooldowns: Mutex<HashMap<i64, Instant>>,
    last_price: Mutex<Option<String>>,
}

impl GoldPrice {
    pub fn new(http: Client, settings: GoldSettings, timezone: Tz) -> Self {
        Self {
            http,
            settings,
            timezone,
            cooldowns: Mutex::new(HashMap::new()),
            last_price: Mutex::new(None),
        }
    }

    pub async fn fetch_price(&self) -> Result<String, GoldError> {
        let body = self
            .http
            .post(&self.settings.api_url)
            .headers(header_map(&self.settings.api_headers))
            .body(self.settings.api_payload.clone())
            .send()
            .await?
            .text()
            .await?;
        extract_price(&body)
    }

    /// Seconds left before `chat_id` may ask again, at least 1.
    fn cooldown_remaining(&self, chat_id: i64, now: Instant) -> Option<u64> {
        let cooldown = Duration::from_secs(self.settings.cooldown_secs);
        let last = *self.cooldowns.lock().unwrap().get(&chat_id)?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < cooldown).then(|| (cooldown - elapsed).as_secs().max(1))
    }

    /// The text to answer a `金价` request with.
    pub async fn reply(&self, chat_id: i64, now: DateTime<Utc>) -> String {
        if let Some(wait) = self.cooldown_remaining(chat_id, Instant::now()) {
            return format!("冷却中，请等待 {wait} 秒后再试");
        }

        let closed = is_market_closed(now.with_timezone(&self.timezone));
        if closed {
            if let Some(price) = self.last_price.lock().unwrap().clone() {
                debug!("Market closed, answering with cached price");
                return format!("{price}{CLOSED_SUFFIX}");
            }
        }

        match self.fetch_price().await {
            Ok(price) => {
                self.cooldowns.lock().unwrap().insert(chat_id, Instant::now());
                *self.last_price.lock().unwrap() = Some(price.clone());
                if closed {
                    format!("{price}{CLOSED_SUFFIX}")
                } else {
                    price
                }
            }
            Err(e) => {
                warn!("Gold price lookup failed: {e:?}");
                e.to_string()
            }
        }
    }
}

#[async_trait]
impl Matcher for GoldPrice {
    fn plugin(&self) -> &'static str {
        PLUGIN
    }

    fn block(&self) -> bool {
        true
    }

    fn matches(&self, event: &MessageEvent) -> bool {
        event.plain_text().trim() == "金价"
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        let reply = self.reply(event.chat_id(), Utc::now()).await;
        bot.send(event, reply).await?;
        Ok(())
    }
}

pub fn matcher(ctx: &PluginContext) -> GoldPrice {
    GoldPrice::new(ctx.http.clone(), ctx.settings.gold.clone(), ctx.config.timezone)
}
