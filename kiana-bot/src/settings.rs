//! Plugin settings persisted in `kiana.toml`. Every key has a default.

use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub disabled_plugins: Vec<String>,
    /// How long a prompt waits for the sender's follow-up message
    pub session_timeout_secs: u64,
    pub nickname: NicknameSettings,
    pub gold: GoldSettings,
    pub fund: FundSettings,
    pub resolver: ResolverSettings,
    pub anime_trace: AnimeTraceSettings,
    pub character_trace: CharacterTraceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            disabled_plugins: Vec::new(),
            session_timeout_secs: 60,
            nickname: NicknameSettings::default(),
            gold: GoldSettings::default(),
            fund: FundSettings::default(),
            resolver: ResolverSettings::default(),
            anime_trace: AnimeTraceSettings::default(),
            character_trace: CharacterTraceSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NicknameSettings {
    pub max_nickname_length: usize,
}

impl Default for NicknameSettings {
    fn default() -> Self {
        Self {
            max_nickname_length: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoldSettings {
    pub cooldown_secs: u64,
    pub api_url: String,
    pub api_headers: BTreeMap<String, String>,
    pub api_payload: String,
}

impl Default for GoldSettings {
    fn default() -> Self {
        let headers = [
            ("Accept", "application/json, text/plain, */*"),
            ("Accept-Language", "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7"),
            ("Content-Type", "application/x-www-form-urlencoded"),
            ("Origin", "https://mbmodulecdn.cmbimg.com"),
            ("Referer", "https://mbmodulecdn.cmbimg.com/"),
            ("Sec-Fetch-Dest", "empty"),
            ("Sec-Fetch-Mode", "cors"),
            ("Sec-Fetch-Site", "cross-site"),
            (
                "User-Agent",
                "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:34.0) Gecko/20100101 Firefox/34.0",
            ),
            ("X-Requested-With", "cmb.pb"),
        ];

        Self {
            cooldown_secs: 1,
            api_url: "https://mbmodule-openapi.paas.cmbchina.com/product/v1/func/market-center"
                .to_owned(),
            api_headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            api_payload: r#"params=[{"prdType":"H","prdCode":""}]"#.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FundSettings {
    /// Host serving `pingzhongdata/<code>.js`
    pub data_base_url: String,
    /// Host serving the holdings archive
    pub archive_base_url: String,
    pub recent_days: usize,
}

impl Default for FundSettings {
    fn default() -> Self {
        Self {
            data_base_url: "https://fund.eastmoney.com".to_owned(),
            archive_base_url: "https://fundf10.eastmoney.com".to_owned(),
            recent_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Resolvers to switch off: `bilibili`, `douyin`, `xiaohongshu`
    pub disabled: Vec<String>,
    pub bilibili_view_api: String,
    pub bilibili_playurl_api: String,
    pub video_quality: u32,
    pub max_video_duration_secs: u64,
    pub max_video_size_bytes: u64,
    pub bilibili_headers: BTreeMap<String, String>,
    pub xiaohongshu_cookie: Option<String>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        let headers = [
            (
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
            ),
            ("Referer", "https://www.bilibili.com/"),
        ];

        Self {
            disabled: Vec::new(),
            bilibili_view_api: "https://api.bilibili.com/x/web-interface/view".to_owned(),
            bilibili_playurl_api: "https://api.bilibili.com/x/player/playurl".to_owned(),
            video_quality: 64,
            max_video_duration_secs: 600,
            max_video_size_bytes: 100 * 1024 * 1024,
            bilibili_headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            xiaohongshu_cookie: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnimeTraceSettings {
    pub api_url: String,
    pub timeout_secs: u64,
}

impl Default for AnimeTraceSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.trace.moe/search?anilistInfo&cutBorders".to_owned(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CharacterTraceSettings {
    pub api: String,
    pub high_anime1: String,
    pub high_gal: String,
}

impl Default for CharacterTraceSettings {
    fn default() -> Self {
        Self {
            api: "https://aiapiv2.animedb.cn/ai/api/detect?&is_multi=0&ai_detect=2".to_owned(),
            high_anime1: "anime_model_lovelive".to_owned(),
            high_gal: "game_model_kirakira".to_owned(),
        }
    }
}
