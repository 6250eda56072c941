//! Group member nicknames: bind them with `@member 昵称 xxx`, then write
//! `at xxx` to mention that member.

mod store;

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use shared::BotConfig;
use tracing::{debug, info};

pub use store::{AddOutcome, NicknameStore};

use super::PluginContext;
use crate::{
    dispatch::Matcher,
    onebot::{Bot, Message, MessageEvent, Segment},
};

const PLUGIN: &str = "nickname";
const LEGACY_FILE: &str = "nicknames.json";

static VALID_NICKNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\x{4e00}-\x{9fa5}a-zA-Z0-9]+$").unwrap());
static AT_NICKNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bat\s*([\x{4e00}-\x{9fa5}a-zA-Z0-9]+)").unwrap());
static DELETE_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(删除昵称|移除昵称)\s+(.+)$").unwrap());
static AT_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@\d+").unwrap());

struct Nicknames {
    store: NicknameStore,
    max_length: usize,
}

pub async fn matchers(ctx: &PluginContext) -> Result<Vec<Arc<dyn Matcher>>> {
    let store = NicknameStore::new(ctx.db.clone()).await?;
    let legacy = ctx.store.config_file(PLUGIN, LEGACY_FILE)?;
    store.import_legacy(&legacy).await?;

    let shared = Arc::new(Nicknames {
        store,
        max_length: ctx.settings.nickname.max_nickname_length,
    });

    Ok(vec![
        Arc::new(AddNickname(Arc::clone(&shared))),
        Arc::new(QueryNickname(Arc::clone(&shared))),
        Arc::new(DeleteNickname(Arc::clone(&shared))),
        Arc::new(ClearNickname {
            nicknames: Arc::clone(&shared),
            config: Arc::clone(&ctx.config),
        }),
        Arc::new(ReplaceNickname(shared)),
    ])
}

fn has_at(event: &MessageEvent) -> bool {
    event.message.at_count() > 0
}

fn trimmed_text(event: &MessageEvent) -> String {
    event.plain_text().trim().to_owned()
}

fn group_key(event: &MessageEvent) -> Option<String> {
    event.group_id.map(|id| id.to_string())
}

/// The first mentioned member and whatever follows `昵称` in the text.
pub fn extract_target_and_nickname(message: &Message) -> Option<(String, Option<String>)> {
    let target = message.first_at()?.to_owned();
    let text = message.plain_text();
    let nickname = text
        .trim()
        .split_once("昵称")
        .map(|(_, rest)| rest.trim())
        .filter(|rest| !rest.is_empty())
        .map(str::to_owned);
    Some((target, nickname))
}

/// Returns the complaint to send back, if any.
pub fn validate_nickname(nickname: &str, max_length: usize) -> Option<String> {
    if nickname.is_empty() {
        return Some("昵称不能为空！".to_owned());
    }
    if nickname.chars().count() > max_length {
        return Some(format!("昵称过长（最多{max_length}字符）"));
    }
    if !VALID_NICKNAME.is_match(nickname) {
        return Some("昵称只能包含汉字、字母和数字！".to_owned());
    }
    None
}

/// Nicknames named by `删除昵称 a b c`, with inline `@123` mentions removed.
pub fn parse_delete_command(text: &str) -> Option<Vec<String>> {
    let caps = DELETE_COMMAND.captures(text)?;
    let names = AT_DIGITS.replace_all(caps[2].trim(), "");
    let names: Vec<String> = names.split_whitespace().map(str::to_owned).collect();
    (!names.is_empty()).then_some(names)
}

pub fn build_delete_reply(removed: &[String], not_found: &[String]) -> String {
    let mut lines = Vec::new();
    if !removed.is_empty() {
        lines.push(format!("成功删除昵称：{}", removed.join(" ")));
    }
    if !not_found.is_empty() {
        lines.push(format!("以下昵称不存在：{}", not_found.join(" ")));
    }
    if lines.is_empty() {
        "未删除任何昵称".to_owned()
    } else {
        lines.join("\n")
    }
}

/// Rewrites `at<nickname>` in text segments into mentions. Returns `None`
/// when no bound nickname was found.
pub fn replace_at_nicknames(message: &Message, bindings: &HashMap<String, String>) -> Option<Message> {
    let mut rebuilt = Message::new();
    let mut replaced = false;

    for segment in message {
        let Segment::Text(text) = segment else {
            rebuilt.push(segment.clone());
            continue;
        };

        let mut last = 0;
        let mut search = 0;
        while let Some(caps) = AT_NICKNAME.captures_at(text, search) {
            let (Some(whole), Some(nickname)) = (caps.get(0), caps.get(1)) else {
                break;
            };

            // The nickname must end at whitespace or the end of the segment
            let ends_cleanly = text[whole.end()..]
                .chars()
                .next()
                .is_none_or(char::is_whitespace);
            if !ends_cleanly {
                search = whole.start() + 1;
                continue;
            }

            if whole.start() > last {
                rebuilt.push(Segment::text(&text[last..whole.start()]));
            }
            match bindings.get(nickname.as_str()) {
                Some(user_id) => {
                    rebuilt.push(Segment::at(user_id.as_str()));
                    replaced = true;
                }
                None => rebuilt.push(Segment::text(whole.as_str())),
            }
            last = whole.end();
            search = whole.end();
        }

        if last < text.len() {
            rebuilt.push(Segment::text(&text[last..]));
        }
    }

    replaced.then_some(rebuilt)
}

struct AddNickname(Arc<Nicknames>);

#[async_trait]
impl Matcher for AddNickname {
    fn plugin(&self) -> &'static str {
        PLUGIN
    }

    fn priority(&self) -> u8 {
        5
    }

    fn block(&self) -> bool {
        true
    }

    fn matches(&self, event: &MessageEvent) -> bool {
        let text = trimmed_text(event);
        // A bare `昵称` is a query
        event.is_group() && has_at(event) && text.starts_with("昵称") && text != "昵称"
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        let Some(group_id) = group_key(event) else {
            return Ok(());
        };
        let Some((target, Some(nickname))) = extract_target_and_nickname(&event.message) else {
            return Ok(());
        };

        if let Some(complaint) = validate_nickname(&nickname, self.0.max_length) {
            bot.send(event, complaint).await?;
            return Ok(());
        }

        let reply = match self.0.store.add(&group_id, &target, &nickname).await? {
            AddOutcome::Added => {
                info!("Bound nickname {nickname} to {target} in group {group_id}");
                format!("昵称'{nickname}'成功绑定到用户！")
            }
            AddOutcome::AlreadyOwned => format!("用户已有昵称'{nickname}'！"),
            AddOutcome::Occupied => format!("昵称'{nickname}'已被其他用户占用！"),
        };
        bot.send(event, reply).await?;
        Ok(())
    }
}

struct QueryNickname(Arc<Nicknames>);

#[async_trait]
impl Matcher for QueryNickname {
    fn plugin(&self) -> &'static str {
        PLUGIN
    }

    fn priority(&self) -> u8 {
        5
    }

    fn block(&self) -> bool {
        true
    }

    fn matches(&self, event: &MessageEvent) -> bool {
        event.is_group() && event.message.at_count() == 1 && trimmed_text(event) == "昵称"
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        let (Some(group_id), Some(target)) = (group_key(event), event.message.first_at()) else {
            return Ok(());
        };

        let nicknames = self.0.store.nicknames_of(&group_id, target).await?;
        let reply = if nicknames.is_empty() {
            "该用户尚未设置任何昵称".to_owned()
        } else {
            format!("当前用户的昵称：{}", nicknames.join(", "))
        };
        bot.send(event, reply).await?;
        Ok(())
    }
}

struct DeleteNickname(Arc<Nicknames>);

#[async_trait]
impl Matcher for DeleteNickname {
    fn plugin(&self) -> &'static str {
        PLUGIN
    }

    fn priority(&self) -> u8 {
        5
    }

    fn block(&self) -> bool {
        true
    }

    fn matches(&self, event: &MessageEvent) -> bool {
        let text = trimmed_text(event);
        event.is_group() && has_at(event) && (text.starts_with("删除昵称") || text.starts_with("移除昵称"))
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        let (Some(group_id), Some(target)) = (group_key(event), event.message.first_at()) else {
            return Ok(());
        };

        let Some(nicknames) = parse_delete_command(&trimmed_text(event)) else {
            bot.send(event, "请指定要删除的昵称").await?;
            return Ok(());
        };

        if self.0.store.nicknames_of(&group_id, target).await?.is_empty() {
            bot.send(event, "该用户没有任何昵称").await?;
            return Ok(());
        }

        let (removed, not_found) = self.0.store.remove(&group_id, target, &nicknames).await?;
        debug!("Removed {removed:?} from {target} in group {group_id}");
        bot.send(event, build_delete_reply(&removed, &not_found)).await?;
        Ok(())
    }
}

struct ClearNickname {
    nicknames: Arc<Nicknames>,
    config: Arc<BotConfig>,
}

#[async_trait]
impl Matcher for ClearNickname {
    fn plugin(&self) -> &'static str {
        PLUGIN
    }

    fn priority(&self) -> u8 {
        5
    }

    fn block(&self) -> bool {
        true
    }

    fn matches(&self, event: &MessageEvent) -> bool {
        let text = trimmed_text(event);
        event.is_group()
            && has_at(event)
            && (text.starts_with("清空昵称") || text.starts_with("清除昵称"))
            && self.config.is_superuser(&event.user_id.to_string())
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        let (Some(group_id), Some(target)) = (group_key(event), event.message.first_at()) else {
            return Ok(());
        };

        let cleared = self.nicknames.store.clear(&group_id, target).await?;
        let reply = if cleared.is_empty() {
            "该用户没有任何昵称".to_owned()
        } else {
            info!("Cleared nicknames of {target} in group {group_id}");
            format!("已清空该用户的所有昵称：{}", cleared.join(", "))
        };
        bot.send(event, reply).await?;
        Ok(())
    }
}

struct ReplaceNickname(Arc<Nicknames>);

#[async_trait]
impl Matcher for ReplaceNickname {
    fn plugin(&self) -> &'static str {
        PLUGIN
    }

    fn priority(&self) -> u8 {
        10
    }

    fn matches(&self, event: &MessageEvent) -> bool {
        event.is_group()
            && event
                .message
                .iter()
                .any(|segment| matches!(segment, Segment::Text(text) if text.contains("at")))
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        let Some(group_id) = group_key(event) else {
            return Ok(());
        };

        let bindings = self.0.store.bindings(&group_id).await?;
        if bindings.is_empty() {
            return Ok(());
        }
        if let Some(rebuilt) = replace_at_nicknames(&event.message, &bindings) {
            bot.send(event, rebuilt).await?;
        }
        Ok(())
    }
}
