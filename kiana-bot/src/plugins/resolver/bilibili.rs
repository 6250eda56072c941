use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, header::HeaderMap};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use super::{FAILED_REPLY, PLUGIN, ResolveError, follow_redirects};
use crate::{
    dispatch::Matcher,
    media::MediaDownloader,
    onebot::{Bot, Message, MessageEvent, Segment},
    plugins::header_map,
    settings::ResolverSettings,
};

const LINK_CHARS: &str = r"[A-Za-z\d._?%&+\-=/#]+";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    Bv,
    Av,
    Short,
    VideoPage,
}

/// Checked in order; the first that yields something wins.
static PATTERNS: LazyLock<Vec<(LinkKind, Regex)>> = LazyLock::new(|| {
    [
        (LinkKind::Bv, r"(BV[1-9a-zA-Z]{10})".to_owned()),
        (LinkKind::Av, r"av(\d{6,})".to_owned()),
        (LinkKind::Bv, r"/(BV[1-9a-zA-Z]{10})".to_owned()),
        (LinkKind::Av, r"/av(\d{6,})".to_owned()),
        (LinkKind::Short, format!(r"https?://b23\.tv/{LINK_CHARS}")),
        (LinkKind::Short, format!(r"https?://bili2233\.cn/{LINK_CHARS}")),
        (
            LinkKind::VideoPage,
            format!(r"https?://(?:www|m)?\.?bilibili\.com/video/{LINK_CHARS}"),
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(&pattern).unwrap()))
    .collect()
});
static BV_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"BV[1-9a-zA-Z]{10}").unwrap());
static AV_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"av(\d+)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoId {
    Bv(String),
    Av(u64),
}

impl VideoId {
    fn query(&self) -> (&'static str, String) {
        match self {
            VideoId::Bv(bvid) => ("bvid", bvid.clone()),
            VideoId::Av(aid) => ("aid", aid.to_string()),
        }
    }
}

/// Something in a message that leads to a video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    Id(VideoId),
    /// A short link that has to be followed first
    Short(String),
}

fn id_in(text: &str) -> Option<VideoId> {
    if let Some(bv) = BV_ID.find(text) {
        return Some(VideoId::Bv(bv.as_str().to_owned()));
    }
    let aid = AV_ID.captures(text)?[1].parse().ok()?;
    Some(VideoId::Av(aid))
}

pub fn find_link(text: &str) -> Option<Link> {
    PATTERNS.iter().find_map(|(kind, pattern)| {
        let caps = pattern.captures(text)?;
        match kind {
            LinkKind::Bv => Some(Link::Id(VideoId::Bv(caps[1].to_owned()))),
            LinkKind::Av => Some(Link::Id(VideoId::Av(caps[1].parse().ok()?))),
            LinkKind::Short => Some(Link::Short(caps[0].to_owned())),
            LinkKind::VideoPage => id_in(&caps[0]).map(Link::Id),
        }
    })
}

/// The `qqdocurl` of a QQ mini-program share card.
pub fn mini_program_url(payload: &str) -> Option<String> {
    let card: Value = serde_json::from_str(payload).ok()?;
    card["meta"]["detail_1"]["qqdocurl"].as_str().map(str::to_owned)
}

fn is_bilibili_url(url: &str) -> bool {
    ["b23.tv", "bili2233.cn", "bilibili.com"]
        .iter()
        .any(|host| url.contains(host))
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, ResolveError> {
        if self.code != 0 {
            let message = if self.message.is_empty() {
                "未知错误".to_owned()
            } else {
                self.message
            };
            return Err(ResolveError::Refused(format!("获取视频信息失败：{message}")));
        }
        self.data
            .ok_or_else(|| ResolveError::Unparsable("response has no data".to_owned()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoInfo {
    pub bvid: String,
    pub cid: Option<u64>,
    /// Seconds
    pub duration: u64,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct PlayUrl {
    #[serde(default)]
    durl: Vec<Durl>,
}

#[derive(Debug, Deserialize)]
struct Durl {
    url: String,
    size: u64,
}

/// A downloadable video stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoStream {
    pub bvid: String,
    pub url: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct BilibiliClient {
    http: Client,
    settings: ResolverSettings,
}

impl BilibiliClient {
    pub fn new(http: Client, settings: ResolverSettings) -> Self {
        Self { http, settings }
    }

    pub fn headers(&self) -> HeaderMap {
        header_map(&self.settings.bilibili_headers)
    }

    async fn resolve_short(&self, url: &str) -> Result<Option<VideoId>, ResolveError> {
        let target = follow_redirects(&self.http, url, self.headers()).await?;
        debug!("{url} redirects to {target}");
        Ok(match find_link(&target) {
            Some(Link::Id(id)) => Some(id),
            _ => None,
        })
    }

    /// Looks through share cards first, then the text.
    pub async fn extract_video_id(&self, message: &Message) -> Result<Option<VideoId>, ResolveError> {
        for url in message.json_payloads().filter_map(mini_program_url) {
            if url.contains("b23.tv") {
                if let Some(id) = self.resolve_short(&url).await? {
                    return Ok(Some(id));
                }
            } else if let Some(id) = id_in(&url) {
                return Ok(Some(id));
            }
        }

        match find_link(message.plain_text().trim()) {
            Some(Link::Id(id)) => Ok(Some(id)),
            Some(Link::Short(url)) => self.resolve_short(&url).await,
            None => Ok(None),
        }
    }

    pub async fn video_info(&self, id: &VideoId) -> Result<VideoInfo, ResolveError> {
        let envelope: Envelope<VideoInfo> = self
            .http
            .get(&self.settings.bilibili_view_api)
            .headers(self.headers())
            .query(&[id.query()])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let info = envelope.into_data()?;

        let max = self.settings.max_video_duration_secs;
        if info.duration > max {
            return Err(ResolveError::Refused(format!(
                "视频时长超过{:.1}分钟，无法下载",
                max as f64 / 60.0
            )));
        }
        Ok(info)
    }

    pub async fn video_stream(&self, id: &VideoId) -> Result<VideoStream, ResolveError> {
        let info = self.video_info(id).await?;
        let Some(cid) = info.cid else {
            return Err(ResolveError::Refused("未能获取视频的 cid！".to_owned()));
        };

        let envelope: Envelope<PlayUrl> = self
            .http
            .get(&self.settings.bilibili_playurl_api)
            .headers(self.headers())
            .query(&[
                ("bvid", info.bvid.clone()),
                ("cid", cid.to_string()),
                ("qn", self.settings.video_quality.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let Some(durl) = envelope.into_data()?.durl.into_iter().next() else {
            return Err(ResolveError::Unparsable("play url has no streams".to_owned()));
        };

        let max = self.settings.max_video_size_bytes;
        if durl.size > max {
            return Err(ResolveError::Refused(format!(
                "视频大小超过{:.1}MB，无法下载",
                max as f64 / 1024.0 / 1024.0
            )));
        }

        Ok(VideoStream {
            bvid: info.bvid,
            url: durl.url,
            size: durl.size,
        })
    }
}

pub struct BilibiliResolver {
    client: BilibiliClient,
    downloader: MediaDownloader,
}

impl BilibiliResolver {
    pub fn new(client: BilibiliClient, downloader: MediaDownloader) -> Self {
        Self { client, downloader }
    }

    /// What to send back for `message`; `None` when it holds no video.
    pub async fn resolve(&self, message: &Message) -> Option<Message> {
        let id = match self.client.extract_video_id(message).await {
            Ok(Some(id)) => id,
            Ok(None) => return None,
            Err(e) => {
                error!("Failed to extract bilibili video id: {e}");
                return Some(FAILED_REPLY.into());
            }
        };

        match self.fetch_video(&id).await {
            Ok(video) => Some(video.into()),
            Err(ResolveError::Refused(reason)) => Some(reason.into()),
            Err(e) => {
                error!("Failed to fetch bilibili video {id:?}: {e}");
                Some(FAILED_REPLY.into())
            }
        }
    }

    async fn fetch_video(&self, id: &VideoId) -> Result<Segment, ResolveError> {
        let stream = self.client.video_stream(id).await?;
        info!("Downloading {} ({} bytes)", stream.bvid, stream.size);
        let bytes = self
            .downloader
            .fetch_bytes(&stream.url, self.client.headers(), &format!("{}.mp4", stream.bvid))
            .await
            .map_err(ResolveError::Download)?;
        Ok(Segment::video_bytes(&bytes))
    }
}

#[async_trait]
impl Matcher for BilibiliResolver {
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
        find_link(event.plain_text().trim()).is_some()
            || event
                .message
                .json_payloads()
                .filter_map(mini_program_url)
                .any(|url| is_bilibili_url(&url))
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        if let Some(reply) = self.resolve(&event.message).await {
            bot.send(event, reply).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn finds_ids_and_short_links() {
        assert_eq!(
            find_link("看看这个 BV1xx411c7mD 好看"),
            Some(Link::Id(VideoId::Bv("BV1xx411c7mD".to_owned())))
        );
        assert_eq!(find_link("av170001"), Some(Link::Id(VideoId::Av(170001))));
        assert_eq!(
            find_link("https://www.bilibili.com/video/BV1GJ411x7h7?p=2"),
            Some(Link::Id(VideoId::Bv("BV1GJ411x7h7".to_owned())))
        );
        assert_eq!(
            find_link("【视频】 https://b23.tv/abc123 分享"),
            Some(Link::Short("https://b23.tv/abc123".to_owned()))
        );
        assert_eq!(find_link("av12 不够长"), None);
        assert_eq!(find_link("nothing here"), None);
    }

    #[test]
    fn reads_mini_program_cards() {
        let card = json!({
            "app": "com.tencent.miniapp_01",
            "meta": {"detail_1": {"title": "哔哩哔哩", "qqdocurl": "https://b23.tv/xyz?share_medium=android"}}
        })
        .to_string();
        assert_eq!(
            mini_program_url(&card).as_deref(),
            Some("https://b23.tv/xyz?share_medium=android")
        );
        assert_eq!(mini_program_url("{\"meta\":{}}"), None);
        assert_eq!(mini_program_url("not json"), None);
    }

    #[test]
    fn api_errors_become_refusals() {
        let envelope: Envelope<VideoInfo> =
            serde_json::from_value(json!({"code": -404, "message": "啥都木有"})).unwrap();
        match envelope.into_data() {
            Err(ResolveError::Refused(reason)) => assert_eq!(reason, "获取视频信息失败：啥都木有"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn card_with_direct_url_needs_no_request() {
        let client = BilibiliClient::new(Client::new(), ResolverSettings::default());
        let card = json!({"meta": {"detail_1": {"qqdocurl": "https://www.bilibili.com/video/BV1GJ411x7h7"}}});
        let message: Message = vec![Segment::Json(card.to_string())].into();

        assert_eq!(
            client.extract_video_id(&message).await.unwrap(),
            Some(VideoId::Bv("BV1GJ411x7h7".to_owned()))
        );
    }
}
