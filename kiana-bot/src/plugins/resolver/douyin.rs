use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use reqwest::{
    Client,
    header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT},
};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{FAILED_REPLY, PLUGIN, ResolveError, follow_redirects};
use crate::{
    dispatch::Matcher,
    media::MediaDownloader,
    onebot::{Bot, Message, MessageEvent, Segment},
};

const IOS_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1";

static SHARE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"https?://(?:v\.douyin\.com/[A-Za-z\d_-]+|(?:www\.|m\.)?(?:ies)?douyin\.com/(?:share/)?(?:video|note|slides)/\d+)",
    )
    .unwrap()
});
static SHARE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(slides|video|note)/(\d+)").unwrap());
static ROUTER_DATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)window\._ROUTER_DATA\s*=\s*(.*?)</script>").unwrap());

/// A parsed douyin post: a video or a set of images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DouyinPost {
    pub id: String,
    pub title: String,
    pub author: String,
    pub video_url: Option<String>,
    pub image_urls: Vec<String>,
}

pub fn find_share_link(text: &str) -> Option<&str> {
    SHARE_LINK.find(text).map(|link| link.as_str())
}

/// Extracts the first item of the share page's `window._ROUTER_DATA`.
pub fn parse_router_data(html: &str) -> Result<Value, ResolveError> {
    let raw = ROUTER_DATA
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|raw| raw.as_str().trim())
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| ResolveError::Unparsable("无法从页面提取视频信息".to_owned()))?;
    let data: Value = serde_json::from_str(raw)?;

    let loader = &data["loaderData"];
    let info = ["video_(id)/page", "note_(id)/page"]
        .iter()
        .map(|key| &loader[*key]["videoInfoRes"])
        .find(|info| !info.is_null())
        .ok_or_else(|| ResolveError::Unparsable("无法解析视频信息".to_owned()))?;

    match info["item_list"].as_array().and_then(|items| items.first()) {
        Some(item) => Ok(item.clone()),
        None => {
            let filter = &info["filter_list"][0];
            let reason = [&filter["detail_msg"], &filter["filter_reason"]]
                .into_iter()
                .filter_map(Value::as_str)
                .find(|reason| !reason.is_empty())
                .unwrap_or("无法获取视频信息");
            Err(ResolveError::Refused(reason.to_owned()))
        }
    }
}

fn first_url(value: &Value) -> Option<&str> {
    value["url_list"][0].as_str()
}

/// Reads title, author and media out of a router-data item. Video play
/// URLs are rewritten to their watermark-free form.
pub fn post_from_item(id: &str, item: &Value) -> Result<DouyinPost, ResolveError> {
    let image_urls: Vec<String> = item["images"]
        .as_array()
        .map(|images| images.iter().filter_map(first_url).map(str::to_owned).collect())
        .unwrap_or_default();
    let video_url = first_url(&item["video"]["play_addr"]).map(|url| url.replace("playwm", "play"));

    if image_urls.is_empty() && video_url.is_none() {
        return Err(ResolveError::Unparsable("post has neither video nor images".to_owned()));
    }

    Ok(DouyinPost {
        id: id.to_owned(),
        title: item["desc"].as_str().unwrap_or_default().to_owned(),
        author: item["author"]["nickname"].as_str().unwrap_or_default().to_owned(),
        // Image posts carry a placeholder video
        video_url: if image_urls.is_empty() { video_url } else { None },
        image_urls,
    })
}

#[derive(Clone)]
pub struct DouyinClient {
    http: Client,
}

impl DouyinClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(USER_AGENT, HeaderValue::from_static(IOS_USER_AGENT));
        headers
    }

    fn m_douyin_url(kind: &str, id: &str) -> String {
        format!("https://m.douyin.com/share/{kind}/{id}")
    }

    fn iesdouyin_url(kind: &str, id: &str) -> String {
        format!("https://www.iesdouyin.com/share/{kind}/{id}")
    }

    async fn parse_page(&self, url: &str, id: &str) -> Result<DouyinPost, ResolveError> {
        let html = self
            .http
            .get(url)
            .headers(Self::headers())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        post_from_item(id, &parse_router_data(&html)?)
    }

    /// Resolves a share link, trying the mobile page, the link itself and
    /// the iesdouyin page in turn.
    pub async fn parse_share_url(&self, share_url: &str) -> Result<DouyinPost, ResolveError> {
        let target = if SHARE_ID.is_match(share_url) {
            share_url.to_owned()
        } else {
            follow_redirects(&self.http, share_url, Self::headers()).await?
        };
        let caps = SHARE_ID
            .captures(&target)
            .ok_or_else(|| ResolveError::Unparsable(format!("无法从 {share_url} 中解析出 ID")))?;
        let (kind, id) = (caps[1].to_owned(), caps[2].to_owned());
        debug!("Douyin share {share_url} is {kind} {id}");

        if kind == "slides" {
            return self.parse_page(&Self::m_douyin_url("video", &id), &id).await;
        }

        for url in [
            Self::m_douyin_url(&kind, &id),
            share_url.to_owned(),
            Self::iesdouyin_url(&kind, &id),
        ] {
            match self.parse_page(&url, &id).await {
                Ok(post) => return Ok(post),
                Err(e) => warn!("Failed to parse {url}: {e}"),
            }
        }

        Err(ResolveError::Refused(
            "作品已删除，或资源直链获取失败, 请稍后再试".to_owned(),
        ))
    }
}

pub struct DouyinResolver {
    client: DouyinClient,
    downloader: MediaDownloader,
}

impl DouyinResolver {
    pub fn new(client: DouyinClient, downloader: MediaDownloader) -> Self {
        Self { client, downloader }
    }

    async fn media(&self, post: &DouyinPost) -> Result<Message, ResolveError> {
        if let Some(url) = &post.video_url {
            let bytes = self
                .downloader
                .fetch_bytes(url, DouyinClient::headers(), &format!("douyin_{}.mp4", post.id))
                .await
                .map_err(ResolveError::Download)?;
            return Ok(Segment::video_bytes(&bytes).into());
        }
        Ok(post.image_urls.iter().map(Segment::image_url).collect())
    }

    /// The title then the media, once the media is ready to send.
    pub async fn replies(&self, post: &DouyinPost) -> Result<Vec<Message>, ResolveError> {
        let media = self.media(post).await?;
        Ok(vec![format!("标题: {}", post.title).into(), media])
    }
}

#[async_trait]
impl Matcher for DouyinResolver {
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
        event.plain_text().contains("douyin.com")
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        let text = event.plain_text();
        let Some(link) = find_share_link(&text) else {
            return Ok(());
        };

        let result = match self.client.parse_share_url(link).await {
            Ok(post) => self.replies(&post).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(replies) => {
                for reply in replies {
                    bot.send(event, reply).await?;
                }
            }
            Err(e) => {
                error!("Failed to resolve douyin link {link}: {e}");
                bot.send(event, FAILED_REPLY).await?;
            }
        }
        Ok(())
    }
}
