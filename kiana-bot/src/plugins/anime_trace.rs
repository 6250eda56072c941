//! `搜番`: finds the anime and scene an image comes from via trace.moe.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, header::USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use shared::BotConfig;
use tracing::{error, info};

use super::{
    PluginContext,
    image::{PROMPT, TraceError, download_image, image_form, image_or_prompt},
};
use crate::{
    dispatch::{Matcher, Sessions, command},
    onebot::{Bot, MessageEvent, Segment},
    settings::AnimeTraceSettings,
};

const PLUGIN: &str = "anime_trace";
const NAMES: &[&str] = &["搜番", "以图搜番"];

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub result: Vec<SearchResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    pub anilist: Anilist,
    #[serde(default)]
    pub episode: Value,
    /// Scene start, seconds into the episode
    #[serde(default)]
    pub from: f64,
    pub similarity: f64,
    #[serde(default)]
    pub video: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Anilist {
    #[serde(rename = "isAdult", default)]
    pub is_adult: bool,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub title: AnilistTitle,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnilistTitle {
    pub native: Option<String>,
}

/// Text to send, then the preview clip if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceReply {
    pub text: String,
    pub video_url: Option<String>,
}

pub fn format_time(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    if seconds < 60 {
        format!("{seconds} 秒")
    } else {
        format!("{} 分 {} 秒", seconds / 60, seconds % 60)
    }
}

fn is_kana_or_hangul(c: char) -> bool {
    matches!(c, '\u{3040}'..='\u{30ff}' | '\u{31f0}'..='\u{31ff}' | '\u{1100}'..='\u{11ff}' | '\u{ac00}'..='\u{d7af}')
}

/// Synonyms written in Chinese: some CJK ideographs, no kana or hangul.
pub fn chinese_synonyms(synonyms: &[String]) -> Vec<&str> {
    synonyms
        .iter()
        .map(String::as_str)
        .filter(|synonym| {
            synonym.chars().any(|c| matches!(c, '\u{4e00}'..='\u{9fff}'))
                && !synonym.chars().any(is_kana_or_hangul)
        })
        .collect()
}

fn episode_label(episode: &Value) -> String {
    match episode {
        Value::Number(n) => n.to_string(),
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(episode_label)
            .collect::<Vec<_>>()
            .join("|"),
        _ => "未知".to_owned(),
    }
}

pub fn format_result(result: &SearchResult) -> TraceReply {
    if result.anilist.is_adult {
        return TraceReply {
            text: "抱歉，该内容不适合展示".to_owned(),
            video_url: None,
        };
    }

    let chinese = chinese_synonyms(&result.anilist.synonyms);
    let name = if chinese.is_empty() {
        result
            .anilist
            .title
            .native
            .clone()
            .unwrap_or_else(|| "未知番名".to_owned())
    } else {
        chinese.join("、")
    };

    let text = [
        "识别结果：".to_owned(),
        format!("番名：{name}"),
        format!(
            "第 {} 集 {}",
            episode_label(&result.episode),
            format_time(result.from)
        ),
        format!("置信度：{:.2}%", result.similarity * 100.0),
    ]
    .join("\n");

    TraceReply {
        text,
        video_url: result.video.clone().filter(|url| !url.is_empty()),
    }
}

#[derive(Clone)]
pub struct AnimeTraceClient {
    http: Client,
    settings: AnimeTraceSettings,
}

impl AnimeTraceClient {
    pub fn new(http: Client, settings: AnimeTraceSettings) -> Self {
        Self { http, settings }
    }

    pub async fn search(&self, image: Vec<u8>) -> Result<SearchResponse, TraceError> {
        info!("Uploading image to {}", self.settings.api_url);
        let response = self
            .http
            .post(&self.settings.api_url)
            .header(USER_AGENT, "okhttp/4.9.3")
            .multipart(image_form(image)?)
            .timeout(Duration::from_secs(self.settings.timeout_secs))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Downloads the image at `image_url` and describes its best match.
    pub async fn trace(&self, image_url: &str) -> Result<TraceReply, TraceError> {
        let image = download_image(&self.http, image_url).await?;
        let response = self.search(image).await?;
        if !response.error.is_empty() {
            info!("trace.moe reported: {}", response.error);
        }
        let first = response.result.first().ok_or(TraceError::NoResult)?;
        Ok(format_result(first))
    }
}

pub struct AnimeTrace {
    client: AnimeTraceClient,
    sessions: Arc<Sessions>,
    config: Arc<BotConfig>,
}

impl AnimeTrace {
    pub fn new(client: AnimeTraceClient, sessions: Arc<Sessions>, config: Arc<BotConfig>) -> Self {
        Self {
            client,
            sessions,
            config,
        }
    }
}

#[async_trait]
impl Matcher for AnimeTrace {
    fn plugin(&self) -> &'static str {
        PLUGIN
    }

    fn priority(&self) -> u8 {
        10
    }

    fn block(&self) -> bool {
        true
    }

    fn matches(&self, event: &MessageEvent) -> bool {
        command::parse(&event.message, NAMES, &self.config.command_start).is_some()
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        let Some(args) = command::parse(&event.message, NAMES, &self.config.command_start) else {
            return Ok(());
        };
        let Some(image_url) = image_or_prompt(&self.sessions, bot, event, &args).await? else {
            bot.send(event, PROMPT).await?;
            return Ok(());
        };

        match self.client.trace(&image_url).await {
            Ok(reply) => {
                bot.send(event, reply.text).await?;
                if let Some(video) = reply.video_url {
                    info!("Sending preview {video}");
                    bot.send(event, Segment::video_url(video)).await?;
                }
            }
            Err(e) => {
                error!("Anime trace failed: {e:?}");
                bot.send(event, format!("处理图片时发生错误: {e}")).await?;
            }
        }
        Ok(())
    }
}

pub fn matcher(ctx: &PluginContext) -> AnimeTrace {
    AnimeTrace::new(
        AnimeTraceClient::new(ctx.http.clone(), ctx.settings.anime_trace.clone()),
        Arc::clone(&ctx.sessions),
        Arc::clone(&ctx.config),
    )
}
