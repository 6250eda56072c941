//! Data, cache and config directory resolution for plugins.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

const APP_NAME: &str = "kiana";

#[derive(Debug, Clone)]
pub struct LocalStore {
    data_dir: PathBuf,
    cache_dir: PathBuf,
    config_dir: PathBuf,
}

impl LocalStore {
    /// Resolve the store roots. With `use_cwd` everything lives under `cwd`,
    /// otherwise under the platform's per-user directories.
    pub fn resolve(use_cwd: bool, cwd: &Path) -> Result<Self> {
        if use_cwd {
            return Ok(Self::rooted_at(cwd));
        }

        let platform = |dir: Option<PathBuf>, kind: &str| {
            dir.map(|d| d.join(APP_NAME))
                .with_context(|| format!("No platform {kind} directory available"))
        };

        Ok(Self {
            data_dir: platform(dirs::data_dir(), "data")?,
            cache_dir: platform(dirs::cache_dir(), "cache")?,
            config_dir: platform(dirs::config_dir(), "config")?,
        })
    }

    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
            config_dir: root.join("config"),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn plugin_data_dir(&self, plugin: &str) -> Result<PathBuf> {
        ensure_dir(self.data_dir.join(plugin))
    }

    pub fn plugin_cache_dir(&self, plugin: &str) -> Result<PathBuf> {
        ensure_dir(self.cache_dir.join(plugin))
    }

    pub fn plugin_config_dir(&self, plugin: &str) -> Result<PathBuf> {
        ensure_dir(self.config_dir.join(plugin))
    }

    pub fn data_file(&self, plugin: &str, name: &str) -> Result<PathBuf> {
        Ok(self.plugin_data_dir(plugin)?.join(name))
    }

    pub fn config_file(&self, plugin: &str, name: &str) -> Result<PathBuf> {
        Ok(self.plugin_config_dir(plugin)?.join(name))
    }
}

fn ensure_dir(dir: PathBuf) -> Result<PathBuf> {
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir)
}
