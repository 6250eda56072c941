use std::{
    collections::HashSet,
    env, fs, io,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use chrono_tz::Tz;
use serde::de::DeserializeOwned;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_ENVIRONMENT: &str = "prod";
const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";
const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SETTINGS_FILE: &str = "kiana.toml";

pub struct BotConfig {
    /// Address the reverse WebSocket server binds to
    pub host: IpAddr,
    pub port: u16,
    /// Deployment tag, also selects the `.env.{environment}` overlay
    pub environment: String,
    pub timezone: Tz,
    /// Keep data/cache/config under the working directory instead of the platform dirs
    pub localstore_use_cwd: bool,
    pub superusers: HashSet<String>,
    /// Shared secret the OneBot implementation must present, if set
    pub access_token: Option<String>,
    pub command_start: Vec<String>,
    pub api_timeout: Duration,
    /// Persisted plugin settings loaded at startup
    pub settings_file: PathBuf,
}

impl BotConfig {
    pub fn load(manifest_dir: &Path) -> Result<Self> {
        #[cfg(debug_assertions)]
        {
            let path = manifest_dir.join(".env");
            unless_missing(dotenvy::from_path(&path), &path)?;
        }
        #[cfg(not(debug_assertions))]
        let _ = manifest_dir;

        unless_missing(dotenvy::dotenv(), Path::new(".env"))?;
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_owned());
        let overlay = PathBuf::from(format!(".env.{environment}"));
        if overlay.exists() {
            dotenvy::from_path_override(&overlay)
                .with_context(|| format!("Failed to read {}", overlay.display()))?;
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = lookup("HOST")
            .unwrap_or_else(|| DEFAULT_HOST.to_owned())
            .parse()
            .context("Expected HOST to be an IP address")?;

        let port = match lookup("PORT") {
            Some(port) => port.parse().context("Expected PORT to be a port number")?,
            None => DEFAULT_PORT,
        };

        let timezone = lookup("TZ")
            .unwrap_or_else(|| DEFAULT_TIMEZONE.to_owned())
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Expected TZ to be an IANA timezone: {e}"))?;

        let localstore_use_cwd = match lookup("LOCALSTORE_USE_CWD") {
            Some(flag) => parse_bool(&flag).context("Expected LOCALSTORE_USE_CWD to be a boolean")?,
            None => false,
        };

        let api_timeout = match lookup("API_TIMEOUT") {
            Some(secs) => Duration::from_secs(
                secs.parse()
                    .context("Expected API_TIMEOUT to be a number of seconds")?,
            ),
            None => Duration::from_secs(DEFAULT_API_TIMEOUT_SECS),
        };

        let command_start = match lookup("COMMAND_START") {
            Some(raw) => parse_list(&raw).context("Invalid COMMAND_START")?,
            None => vec!["/".to_owned(), String::new()],
        };

        let superusers = match lookup("SUPERUSERS") {
            Some(raw) => parse_list(&raw)
                .context("Invalid SUPERUSERS")?
                .into_iter()
                .filter(|id| !id.is_empty())
                .collect(),
            None => HashSet::new(),
        };

        Ok(Self {
            host,
            port,
            environment: lookup("ENVIRONMENT").unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_owned()),
            timezone,
            localstore_use_cwd,
            superusers,
            access_token: lookup("ACCESS_TOKEN").filter(|token| !token.is_empty()),
            command_start,
            api_timeout,
            settings_file: lookup("KIANA_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE)),
        })
    }

    pub fn is_superuser(&self, user_id: &str) -> bool {
        self.superusers.contains(user_id)
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("not a boolean: {other:?}"),
    }
}

/// Accepts either a JSON array (`["1", 2]`) or a comma-separated list.
fn parse_list(raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        let values: Vec<serde_json::Value> = serde_json::from_str(raw)?;
        return Ok(values
            .into_iter()
            .map(|value| match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect());
    }
    Ok(raw.split(',').map(|item| item.trim().to_owned()).collect())
}

/// Loads a TOML file. Returns `T::default()` if the file doesn't exist;
/// propagates other I/O and parse errors.
pub fn load_toml_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read_to_string(path) {
        Ok(content) => {
            toml::from_str(&content).with_context(|| format!("Invalid TOML in {}", path.display()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// A missing `.env` file is fine; one that fails to parse is not.
fn unless_missing<T>(result: dotenvy::Result<T>, path: &Path) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Load bot config using the calling crate's manifest directory.
#[macro_export]
macro_rules! load_bot_config {
    () => {
        $crate::config::BotConfig::load(std::path::Path::new(env!("CARGO_MANIFEST_DIR")))
    };
}
