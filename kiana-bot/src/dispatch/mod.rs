//! Routes message events to plugin matchers by priority.

pub mod command;
mod session;

use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tracing::{error, info};

pub use session::Sessions;

use crate::onebot::{Bot, MessageEvent};

/// A rule plus a handler. Matchers with a lower priority run first; a
/// blocking matcher that fires stops lower-priority matchers from running.
#[async_trait]
pub trait Matcher: Send + Sync {
    /// Plugin this matcher belongs to, used for disabling and logs.
    fn plugin(&self) -> &'static str;

    fn priority(&self) -> u8 {
        1
    }

    fn block(&self) -> bool {
        false
    }

    fn matches(&self, event: &MessageEvent) -> bool;

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()>;
}

pub struct Dispatcher {
    matchers: Vec<Arc<dyn Matcher>>,
    sessions: Arc<Sessions>,
}

impl Dispatcher {
    pub fn new(
        matchers: Vec<Arc<dyn Matcher>>,
        sessions: Arc<Sessions>,
        disabled_plugins: &[String],
    ) -> Self {
        let disabled: HashSet<&str> = disabled_plugins.iter().map(String::as_str).collect();
        let mut matchers: Vec<Arc<dyn Matcher>> = matchers
            .into_iter()
            .filter(|matcher| {
                let enabled = !disabled.contains(matcher.plugin());
                if !enabled {
                    info!("Plugin {} is disabled", matcher.plugin());
                }
                enabled
            })
            .collect();
        matchers.sort_by_key(|matcher| matcher.priority());

        Self { matchers, sessions }
    }

    pub fn matcher_count(&self) -> usize {
        self.matchers.len()
    }

    pub async fn dispatch(&self, bot: Bot, event: MessageEvent) {
        if event.user_id == bot.self_id() {
            return;
        }
        let Some(event) = self.sessions.resume(event) else {
            return;
        };

        for tier in self
            .matchers
            .chunk_by(|a, b| a.priority() == b.priority())
        {
            let fired: Vec<&Arc<dyn Matcher>> =
                tier.iter().filter(|matcher| matcher.matches(&event)).collect();
            if fired.is_empty() {
                continue;
            }

            let results = join_all(fired.iter().map(|matcher| matcher.handle(&bot, &event))).await;
            for (matcher, result) in fired.iter().zip(results) {
                if let Err(e) = result {
                    error!("Plugin {} failed on message {}: {e:#}", matcher.plugin(), event.message_id);
                }
            }

            if fired.iter().any(|matcher| matcher.block()) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::Duration,
    };

    use serde_json::json;

    use super::*;
    use crate::onebot::api::testing::recording_bot;

    struct Recorder {
        plugin: &'static str,
        priority: u8,
        block: bool,
        trigger: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Matcher for Recorder {
        fn plugin(&self) -> &'static str {
            self.plugin
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        fn block(&self) -> bool {
            self.block
        }

        fn matches(&self, event: &MessageEvent) -> bool {
            event.plain_text().contains(self.trigger)
        }

        async fn handle(&self, _bot: &Bot, _event: &MessageEvent) -> Result<()> {
            self.log.lock().unwrap().push(self.plugin);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        plugin: &'static str,
        priority: u8,
        block: bool,
        trigger: &'static str,
    ) -> Arc<dyn Matcher> {
        Arc::new(Recorder {
            plugin,
            priority,
            block,
            trigger,
            log: Arc::clone(log),
            fail: false,
        })
    }

    fn event(user_id: i64, text: &str) -> MessageEvent {
        serde_json::from_value(json!({
            "self_id": 42,
            "message_type": "group",
            "group_id": 123,
            "user_id": user_id,
            "message": text
        }))
        .unwrap()
    }

    fn sessions() -> Arc<Sessions> {
        Arc::new(Sessions::new(Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn blocking_matcher_stops_lower_priorities() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(
            vec![
                recorder(&log, "late", 10, false, "hi"),
                recorder(&log, "early", 5, true, "hi"),
                recorder(&log, "sibling", 5, false, "hi"),
            ],
            sessions(),
            &[],
        );

        dispatcher.dispatch(recording_bot().bot, event(1, "hi")).await;

        let mut ran = log.lock().unwrap().clone();
        ran.sort();
        assert_eq!(ran, vec!["early", "sibling"]);
    }

    #[tokio::test]
    async fn non_matching_blockers_do_not_block() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(
            vec![
                recorder(&log, "blocker", 1, true, "金价"),
                recorder(&log, "replace", 10, false, "at"),
            ],
            sessions(),
            &[],
        );

        dispatcher.dispatch(recording_bot().bot, event(1, "at 小明")).await;
        assert_eq!(*log.lock().unwrap(), vec!["replace"]);
    }

    #[tokio::test]
    async fn disabled_plugins_and_own_messages_are_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(
            vec![recorder(&log, "gold", 1, true, "金价"), recorder(&log, "fund", 1, true, "金价")],
            sessions(),
            &["gold".to_owned()],
        );
        assert_eq!(dispatcher.matcher_count(), 1);

        dispatcher.dispatch(recording_bot().bot, event(42, "金价")).await;
        assert!(log.lock().unwrap().is_empty());

        dispatcher.dispatch(recording_bot().bot, event(1, "金价")).await;
        assert_eq!(*log.lock().unwrap(), vec!["fund"]);
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing: Arc<dyn Matcher> = Arc::new(Recorder {
            plugin: "failing",
            priority: 1,
            block: false,
            trigger: "x",
            log: Arc::clone(&log),
            fail: true,
        });
        let dispatcher = Dispatcher::new(
            vec![failing, recorder(&log, "next", 2, false, "x")],
            sessions(),
            &[],
        );

        dispatcher.dispatch(recording_bot().bot, event(1, "x")).await;
        assert_eq!(*log.lock().unwrap(), vec!["failing", "next"]);
    }

    #[tokio::test]
    async fn waiting_session_consumes_the_message() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sessions = sessions();
        let dispatcher = Dispatcher::new(
            vec![recorder(&log, "any", 1, false, "")],
            Arc::clone(&sessions),
            &[],
        );

        let rx = sessions.register(event(1, "").session());
        dispatcher.dispatch(recording_bot().bot, event(1, "picture")).await;

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(rx.await.unwrap().plain_text(), "picture");
    }
}
