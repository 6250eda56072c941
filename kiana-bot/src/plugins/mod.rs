//! Chat features, each contributing one or more matchers.

pub mod anime_trace;
pub mod character_trace;
pub mod fund;
pub mod gold;
pub mod image;
pub mod nickname;
pub mod resolver;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use shared::{BotConfig, Database, LocalStore};
use tracing::{info, warn};

use crate::{
    dispatch::{Matcher, Sessions},
    settings::Settings,
};

/// Everything a plugin may need while building its matchers.
pub struct PluginContext {
    pub config: Arc<BotConfig>,
    pub settings: Settings,
    pub http: reqwest::Client,
    pub db: Database,
    pub store: LocalStore,
    pub sessions: Arc<Sessions>,
}

/// Turns configured header pairs into a [`HeaderMap`], skipping invalid ones.
pub(crate) fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!("Ignoring invalid header {name}"),
        }
    }
    map
}

pub async fn build(ctx: &PluginContext) -> Result<Vec<Arc<dyn Matcher>>> {
    let mut matchers = nickname::matchers(ctx).await?;
    matchers.push(Arc::new(gold::matcher(ctx)));
    matchers.push(fund::matcher(ctx));
    matchers.extend(resolver::matchers(ctx)?);
    matchers.push(Arc::new(anime_trace::matcher(ctx)));
    matchers.push(Arc::new(character_trace::matcher(ctx)));

    info!("Loaded {} matchers", matchers.len());
    Ok(matchers)
}

/// Directories holding downloaded media, purged daily.
pub fn cache_dirs(store: &LocalStore) -> Result<Vec<PathBuf>> {
    Ok(vec![store.plugin_cache_dir(resolver::PLUGIN)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_headers_are_skipped() {
        let headers: BTreeMap<String, String> = [
            ("Referer", "https://www.bilibili.com/"),
            ("bad header", "x"),
            ("X-Ok", "line\nbreak"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

        let map = header_map(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map["referer"], "https://www.bilibili.com/");
    }
}
