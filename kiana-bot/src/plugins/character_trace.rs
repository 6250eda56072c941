//! `识图`: recognises anime and galgame characters via the animedb service.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use shared::BotConfig;
use tracing::{error, info};

use super::{
    PluginContext,
    image::{PROMPT, TraceError, download_image, image_form, image_or_prompt},
};
use crate::{
    dispatch::{Matcher, Sessions, command},
    onebot::{Bot, MessageEvent},
    settings::CharacterTraceSettings,
};

const PLUGIN: &str = "character_trace";
const NAMES: &[&str] = &["识图", "识别", "搜图"];
const SUCCESS: i64 = 17720;
const LOW_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Deserialize)]
pub struct DetectResponse {
    pub new_code: i64,
    #[serde(default)]
    pub data: Vec<Character>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Character {
    pub name: String,
    pub cartoonname: String,
    /// 0.0 to 1.0
    pub acc_percent: f64,
}

/// Description and HTTP-style status for the service's result codes.
pub fn status_description(code: i64) -> (&'static str, u16) {
    match code {
        17701 => ("图片大小过大", 413),
        17702 => ("服务器繁忙，请重试", 503),
        17703 => ("请求参数不正确", 400),
        17704 => ("API 维护中", 503),
        17705 => ("图片格式不支持", 415),
        17706 => ("识别无法完成（内部错误，请重试）", 500),
        17707 => ("内部错误", 500),
        17708 => ("图片中的人物数量超过限制", 400),
        17709 => ("无法加载统计数量", 500),
        17710 => ("图片验证码错误", 400),
        17711 => ("无法完成识别前准备工作（请重试）", 500),
        17712 => ("需要图片名称", 400),
        17713 => ("图片名称不合法", 400),
        17714 => ("请求过于频繁，请稍后再试", 429),
        17715 => ("今日识别次数已用完", 429),
        17716 => ("图片下载超时", 504),
        17717 => ("图片无法访问", 400),
        17718 => ("账号未授权", 401),
        17719 => ("访问被拒绝", 403),
        17720 => ("识别成功", 200),
        17721 => ("服务器正常运行中", 200),
        17722 => ("图片下载失败", 400),
        17723 => ("未指定 Content-Length", 411),
        17724 => ("不是图片文件或未指定", 415),
        17725 => ("未指定图片", 400),
        17726 => ("JSON 不接受包含文件", 400),
        17727 => ("Base64 格式错误", 400),
        17728 => ("已达到本次使用上限", 429),
        17729 => ("未找到选择的模型", 404),
        17730 => ("检测 AI 图片失败", 500),
        17731 => ("服务利用人数过多，请重新尝试", 503),
        17732 => ("已过期", 410),
        17733 => ("反馈成功", 200),
        17734 => ("反馈失败", 500),
        17735 => ("反馈识别效果成功", 200),
        17736 => ("验证码错误", 400),
        _ => ("未知错误", 500),
    }
}

pub fn format_detection(response: &DetectResponse) -> String {
    let best = response.data.first().filter(|_| response.new_code == SUCCESS);
    let Some(character) = best else {
        let (description, status) = status_description(response.new_code);
        return format!("{description}(HTTP 状态码: {status})");
    };

    let mut lines = vec![
        "识别结果：".to_owned(),
        format!("角色：{}", character.name),
        format!("出自：{}", character.cartoonname),
        format!("置信度：{:.2}%", character.acc_percent * 100.0),
    ];
    if character.acc_percent < LOW_CONFIDENCE {
        lines.push(String::new());
        lines.push("注意：置信度过低，识别结果仅供参考，请自行判断是否正确".to_owned());
    }
    lines.join("\n")
}

#[derive(Clone)]
pub struct CharacterTraceClient {
    http: Client,
    settings: CharacterTraceSettings,
}

impl CharacterTraceClient {
    pub fn new(http: Client, settings: CharacterTraceSettings) -> Self {
        Self { http, settings }
    }

    /// `gal` in the command text picks the galgame model.
    pub fn model_for(&self, text: &str) -> &str {
        if text.contains("gal") {
            &self.settings.high_gal
        } else {
            &self.settings.high_anime1
        }
    }

    pub async fn detect(&self, image: Vec<u8>, model: &str) -> Result<DetectResponse, TraceError> {
        info!("Detecting characters with model {model}");
        let form = image_form(image)?.text("model", model.to_owned());
        let response = self
            .http
            .post(&self.settings.api)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn trace(&self, image_url: &str, text: &str) -> Result<String, TraceError> {
        let image = download_image(&self.http, image_url).await?;
        let response = self.detect(image, self.model_for(text)).await?;
        Ok(format_detection(&response))
    }
}

fn failure_reply(e: &TraceError) -> String {
    match e {
        TraceError::Download(_) => "获取图片失败".to_owned(),
        TraceError::Status(status) => format!("API 请求失败: {status}"),
        other => format!("处理过程中发生错误: {other}"),
    }
}

pub struct CharacterTrace {
    client: CharacterTraceClient,
    sessions: Arc<Sessions>,
    config: Arc<BotConfig>,
}

impl CharacterTrace {
    pub fn new(client: CharacterTraceClient, sessions: Arc<Sessions>, config: Arc<BotConfig>) -> Self {
        Self {
            client,
            sessions,
            config,
        }
    }
}

#[async_trait]
impl Matcher for CharacterTrace {
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

        let reply = match self.client.trace(&image_url, &args.plain_text()).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Character trace failed: {e:?}");
                failure_reply(&e)
            }
        };
        bot.send(event, reply).await?;
        Ok(())
    }
}

pub fn matcher(ctx: &PluginContext) -> CharacterTrace {
    CharacterTrace::new(
        CharacterTraceClient::new(ctx.http.clone(), ctx.settings.character_trace.clone()),
        Arc::clone(&ctx.sessions),
        Arc::clone(&ctx.config),
    )
}
