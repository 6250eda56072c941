//! Share-link resolution: turns bilibili, douyin and xiaohongshu links
//! posted in chat into the media they point at.

pub mod bilibili;
pub mod douyin;
pub mod xiaohongshu;

use std::sync::Arc;

use anyhow::Result;
use reqwest::{Client, header::HeaderMap};
use thiserror::Error;
use tracing::info;

use super::PluginContext;
use crate::{dispatch::Matcher, media::MediaDownloader};

pub const PLUGIN: &str = "resolver";

pub(crate) const FAILED_REPLY: &str = "获取视频失败，请稍后再试！";

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Explains to the sender why nothing is coming; sent verbatim
    #[error("{0}")]
    Refused(String),
    #[error("unexpected page or response: {0}")]
    Unparsable(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("download failed: {0:#}")]
    Download(anyhow::Error),
}

/// The final URL after following redirects from `url`.
pub async fn follow_redirects(http: &Client, url: &str, headers: HeaderMap) -> Result<String, ResolveError> {
    let response = http.get(url).headers(headers).send().await?;
    Ok(response.url().to_string())
}

pub fn matchers(ctx: &PluginContext) -> Result<Vec<Arc<dyn Matcher>>> {
    let settings = &ctx.settings.resolver;
    let downloader = MediaDownloader::new(
        ctx.http.clone(),
        ctx.store.plugin_cache_dir(PLUGIN)?,
        settings.max_video_size_bytes,
    );
    let enabled = |name: &str| {
        let on = !settings.disabled.iter().any(|disabled| disabled == name);
        if !on {
            info!("Resolver {name} is disabled");
        }
        on
    };

    let mut matchers: Vec<Arc<dyn Matcher>> = Vec::new();
    if enabled("bilibili") {
        matchers.push(Arc::new(bilibili::BilibiliResolver::new(
            bilibili::BilibiliClient::new(ctx.http.clone(), settings.clone()),
            downloader.clone(),
        )));
    }
    if enabled("douyin") {
        matchers.push(Arc::new(douyin::DouyinResolver::new(
            douyin::DouyinClient::new(ctx.http.clone()),
            downloader.clone(),
        )));
    }
    if enabled("xiaohongshu") {
        matchers.push(Arc::new(xiaohongshu::XiaohongshuResolver::new(
            xiaohongshu::XiaohongshuClient::new(ctx.http.clone(), settings.xiaohongshu_cookie.clone()),
        )));
    }
    Ok(matchers)
}
