use std::{sync::LazyLock, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use reqwest::{
    Client,
    header::{COOKIE, HeaderMap, HeaderName, HeaderValue},
};
use serde_json::Value;
use tracing::{error, warn};
use url::Url;

use super::{PLUGIN, ResolveError, follow_redirects};
use crate::{
    dispatch::Matcher,
    onebot::{Bot, Message, MessageEvent, Segment},
};

const PAGE_TIMEOUT: Duration = Duration::from_secs(30);
const FAILED_REPLY: &str = "获取笔记信息失败，请稍后再试！";

const BROWSER_HEADERS: &[(&str, &str)] = &[
    (
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9",
    ),
    ("accept-language", "zh-CN,zh;q=0.9,en;q=0.8"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
    ("sec-ch-ua", r#""Not_A Brand";v="8", "Chromium";v="120", "Google Chrome";v="120""#),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", r#""macOS""#),
    ("sec-fetch-dest", "document"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-site", "none"),
    ("sec-fetch-user", "?1"),
    ("upgrade-insecure-requests", "1"),
    (
        "user-agent",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    ),
];

static NOTE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"https?://(?:(?:www\.)?xiaohongshu\.com/(?:explore|discovery/item)/[A-Za-z\d._?%&+\-=/#]*|xhslink\.com/[A-Za-z\d._?%&+\-=/#]*)",
    )
    .unwrap()
});
static NOTE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:/explore/|/discovery/item/|source=note&noteId=)(\w+)").unwrap()
});
static INITIAL_STATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)window\.__INITIAL_STATE__=(.*?)</script>").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteMedia {
    Images(Vec<String>),
    Video(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub title: String,
    pub author: String,
    pub media: NoteMedia,
}

pub fn find_note_link(text: &str) -> Option<&str> {
    NOTE_LINK.find(text).map(|link| link.as_str())
}

pub fn note_id(url: &str) -> Option<&str> {
    NOTE_ID.captures(url)?.get(1).map(|id| id.as_str())
}

/// The explore page for a note, carrying over the share's xsec parameters.
pub fn page_url(share_url: &str, note_id: &str) -> Result<Url, ResolveError> {
    let share = Url::parse(share_url).map_err(|e| ResolveError::Unparsable(e.to_string()))?;
    let param = |key: &str| {
        share
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    };

    let mut params = vec![(
        "xsec_source",
        param("xsec_source").unwrap_or_else(|| "pc_feed".to_owned()),
    )];
    if let Some(token) = param("xsec_token").filter(|token| !token.is_empty()) {
        params.push(("xsec_token", token));
    }

    Url::parse_with_params(&format!("https://www.xiaohongshu.com/explore/{note_id}"), params)
        .map_err(|e| ResolveError::Unparsable(e.to_string()))
}

/// Parses `window.__INITIAL_STATE__`, which is JSON apart from bare
/// `undefined` values.
pub fn parse_initial_state(html: &str) -> Result<Value, ResolveError> {
    let raw = INITIAL_STATE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| ResolveError::Unparsable("页面中未找到初始状态数据".to_owned()))?;
    Ok(serde_json::from_str(&raw.as_str().replace("undefined", "null"))?)
}

pub fn note_from_state(state: &Value, note_id: &str) -> Result<Note, ResolveError> {
    let note = &state["note"]["noteDetailMap"][note_id]["note"];
    if !note.is_object() {
        return Err(ResolveError::Unparsable("笔记数据不存在或结构异常".to_owned()));
    }

    let title = note["title"].as_str().unwrap_or_default();
    let desc = note["desc"].as_str().unwrap_or_default();
    let title = match (title.is_empty(), desc.is_empty()) {
        (false, false) => format!("{title}\n{desc}"),
        (false, true) => title.to_owned(),
        _ => desc.to_owned(),
    };

    let media = match note["type"].as_str() {
        Some("normal") => NoteMedia::Images(
            note["imageList"]
                .as_array()
                .map(|images| {
                    images
                        .iter()
                        .filter_map(|image| image["urlDefault"].as_str())
                        .filter(|url| !url.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
        ),
        Some("video") => {
            let stream = &note["video"]["media"]["stream"];
            let url = ["h264", "h265", "av1"]
                .iter()
                .filter_map(|codec| stream[*codec][0]["masterUrl"].as_str())
                .find(|url| !url.is_empty())
                .ok_or_else(|| ResolveError::Unparsable("无法获取视频播放地址".to_owned()))?;
            NoteMedia::Video(url.to_owned())
        }
        other => {
            return Err(ResolveError::Unparsable(format!(
                "不支持的内容类型: {}",
                other.unwrap_or("unknown")
            )));
        }
    };

    Ok(Note {
        title,
        author: note["user"]["nickname"].as_str().unwrap_or_default().to_owned(),
        media,
    })
}

#[derive(Clone)]
pub struct XiaohongshuClient {
    http: Client,
    headers: HeaderMap,
}

impl XiaohongshuClient {
    pub fn new(http: Client, cookie: Option<String>) -> Self {
        let mut headers: HeaderMap = BROWSER_HEADERS
            .iter()
            .map(|(name, value)| {
                (
                    HeaderName::from_static(name),
                    HeaderValue::from_static(value),
                )
            })
            .collect();
        if let Some(cookie) = cookie {
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    headers.insert(COOKIE, value);
                }
                Err(_) => warn!("Ignoring invalid xiaohongshu cookie"),
            }
        }
        Self { http, headers }
    }

    pub async fn parse_url(&self, url: &str) -> Result<Note, ResolveError> {
        let url = if url.contains("xhslink") {
            follow_redirects(&self.http, url, self.headers.clone()).await?
        } else {
            url.to_owned()
        };
        let id = note_id(&url)
            .ok_or_else(|| ResolveError::Unparsable("无法从URL中提取笔记ID".to_owned()))?;

        let html = self
            .http
            .get(page_url(&url, id)?)
            .headers(self.headers.clone())
            .timeout(PAGE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        note_from_state(&parse_initial_state(&html)?, id)
    }
}

pub struct XiaohongshuResolver {
    client: XiaohongshuClient,
}

impl XiaohongshuResolver {
    pub fn new(client: XiaohongshuClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Matcher for XiaohongshuResolver {
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
        find_note_link(&event.plain_text()).is_some()
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        let text = event.plain_text();
        let Some(link) = find_note_link(&text) else {
            return Ok(());
        };

        let note = match self.client.parse_url(link).await {
            Ok(note) => note,
            Err(e) => {
                error!("Failed to resolve xiaohongshu link {link}: {e}");
                bot.send(event, FAILED_REPLY).await?;
                return Ok(());
            }
        };

        bot.send(event, format!("标题: {}", note.title)).await?;
        let media: Message = match note.media {
            NoteMedia::Images(urls) => urls.into_iter().map(Segment::image_url).collect(),
            NoteMedia::Video(url) => Segment::video_url(url).into(),
        };
        if !media.is_empty() {
            bot.send(event, media).await?;
        }
        Ok(())
    }
}
