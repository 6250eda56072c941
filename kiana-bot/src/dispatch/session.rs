use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::sync::oneshot;
use tracing::debug;

use crate::onebot::{ApiError, Bot, MessageEvent, SessionKey};

struct Waiter {
    /// Distinguishes a waiter from the one that replaced it
    token: u64,
    tx: oneshot::Sender<MessageEvent>,
}

#[derive(Default)]
struct Waiters {
    next_token: u64,
    by_session: HashMap<SessionKey, Waiter>,
}

/// Handlers waiting for the next message of a session.
/// Lets a handler ask a follow-up question and receive the answer.
pub struct Sessions {
    waiters: Mutex<Waiters>,
    timeout: Duration,
}

impl Sessions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            waiters: Mutex::new(Waiters::default()),
            timeout,
        }
    }

    fn register_waiter(&self, key: SessionKey) -> (u64, oneshot::Receiver<MessageEvent>) {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap();
        waiters.next_token += 1;
        let token = waiters.next_token;
        if waiters.by_session.insert(key, Waiter { token, tx }).is_some() {
            debug!("Session {key:?} prompted again, dropping the older waiter");
        }
        (token, rx)
    }

    /// Register interest in the next message of `key`, replacing any
    /// previous waiter for the same session.
    pub fn register(&self, key: SessionKey) -> oneshot::Receiver<MessageEvent> {
        self.register_waiter(key).1
    }

    /// Deliver `event` to a waiting handler. Gives the event back when
    /// nobody is waiting for its session.
    pub fn resume(&self, event: MessageEvent) -> Option<MessageEvent> {
        let waiter = self.waiters.lock().unwrap().by_session.remove(&event.session());
        match waiter {
            Some(waiter) => waiter.tx.send(event).err(),
            None => Some(event),
        }
    }

    /// Removes the waiter for `key` only if it is still the one holding `token`.
    fn release(&self, key: SessionKey, token: u64) {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.by_session.get(&key).is_some_and(|waiter| waiter.token == token) {
            waiters.by_session.remove(&key);
        }
    }

    pub fn is_waiting(&self, key: SessionKey) -> bool {
        self.waiters.lock().unwrap().by_session.contains_key(&key)
    }

    /// Sends `prompt` and waits for the sender's next message in the same
    /// session. `None` when they don't answer in time or a newer prompt
    /// for the session took over.
    pub async fn prompt(
        &self,
        bot: &Bot,
        event: &MessageEvent,
        prompt: &str,
    ) -> Result<Option<MessageEvent>, ApiError> {
        let key = event.session();
        let (token, rx) = self.register_waiter(key);
        if let Err(e) = bot.send(event, prompt).await {
            self.release(key, token);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(answer)) => Ok(Some(answer)),
            Ok(Err(_)) => {
                debug!("Session {key:?} was taken over by a newer prompt");
                Ok(None)
            }
            Err(_) => {
                debug!("Session {key:?} did not answer");
                self.release(key, token);
                Ok(None)
            }
        }
    }
}
