//! Shared plumbing for the image search commands.

use reqwest::{
    Client,
    multipart::{Form, Part},
};
use thiserror::Error;
use tracing::info;

use crate::{
    dispatch::Sessions,
    onebot::{ApiError, Bot, Message, MessageEvent},
};

pub const PROMPT: &str = "请跟随消息发送图片";

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("获取图片失败")]
    Download(#[source] reqwest::Error),
    #[error("API请求失败 (HTTP {0})")]
    Status(u16),
    #[error("网络请求失败，请检查网络连接")]
    Network(#[source] reqwest::Error),
    #[error("API返回的数据格式不正确")]
    Decode(#[source] reqwest::Error),
    #[error("API返回结果中没有找到 'result' 字段")]
    NoResult,
}

impl From<reqwest::Error> for TraceError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => TraceError::Status(status.as_u16()),
            None if e.is_decode() => TraceError::Decode(e),
            None => TraceError::Network(e),
        }
    }
}

/// The image in the command arguments, or in the sender's answer to a
/// prompt when there is none. `None` when no image turns up.
pub async fn image_or_prompt(
    sessions: &Sessions,
    bot: &Bot,
    event: &MessageEvent,
    args: &Message,
) -> Result<Option<String>, ApiError> {
    if let Some(url) = args.first_image() {
        return Ok(Some(url.to_owned()));
    }

    let answer = sessions.prompt(bot, event, PROMPT).await?;
    Ok(answer.and_then(|answer| answer.message.first_image().map(str::to_owned)))
}

pub async fn download_image(http: &Client, url: &str) -> Result<Vec<u8>, TraceError> {
    info!("Downloading image {url}");
    let response = http
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(TraceError::Download)?;
    let bytes = response.bytes().await.map_err(TraceError::Download)?;
    Ok(bytes.to_vec())
}

/// A multipart form carrying the image as `image.png`.
pub fn image_form(image: Vec<u8>) -> Result<Form, TraceError> {
    let part = Part::bytes(image)
        .file_name("image.png")
        .mime_str("image/png")?;
    Ok(Form::new().part("image", part))
}
