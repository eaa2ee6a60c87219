#![forbid(unsafe_code)]
//! TOML configuration for the page cache and the operation log.
//!
//! ```toml
//! page_size = 8192
//!
//! [cache]
//! strategy = "lru"
//! lru_capacity = 256
//! lru_eviction_batch = 16
//!
//! [log]
//! salt = 7
//! sync_on_append = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::{LruPageCache, PageCache, PageSource, PassthroughPageCache, TinyPageCache};
use crate::page::{DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::primitives::wal::OpLogOptions;
use crate::types::Lsn;

/// Largest accepted page size. Page layouts store offsets as `u32`.
pub const MAX_PAGE_SIZE: usize = u32::MAX as usize;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The config text is not valid TOML for [`Config`].
    #[error("failed to parse config {origin}: {source}")]
    Parse {
        /// File path, or `<inline>` for strings.
        origin: String,
        /// Parser error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which page cache implementation to build.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// Forward everything to the page source.
    Passthrough,
    /// A handful of slots ranked by hit count.
    Tiny,
    /// Recency-ordered cache with batched eviction.
    #[default]
    Lru,
}

/// `[cache]` table.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PageCacheConfig {
    /// Strategy to build.
    pub strategy: CacheStrategy,
    /// Slot count for the tiny strategy.
    pub tiny_slots: usize,
    /// Soft capacity for the LRU strategy.
    pub lru_capacity: usize,
    /// Pages evicted per LRU eviction pass.
    pub lru_eviction_batch: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::Lru,
            tiny_slots: 4,
            lru_capacity: 256,
            lru_eviction_batch: 16,
        }
    }
}

impl PageCacheConfig {
    /// Rejects sizes the selected strategy cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.strategy {
            CacheStrategy::Passthrough => Ok(()),
            CacheStrategy::Tiny if self.tiny_slots == 0 => {
                Err(ConfigError::Invalid("cache.tiny_slots must be positive".into()))
            }
            CacheStrategy::Tiny => Ok(()),
            CacheStrategy::Lru if self.lru_capacity == 0 => {
                Err(ConfigError::Invalid("cache.lru_capacity must be positive".into()))
            }
            CacheStrategy::Lru if self.lru_eviction_batch == 0 => Err(ConfigError::Invalid(
                "cache.lru_eviction_batch must be positive".into(),
            )),
            CacheStrategy::Lru => Ok(()),
        }
    }

    /// Builds the configured cache in front of `source`.
    pub fn build(
        &self,
        source: Arc<dyn PageSource>,
    ) -> Result<Box<dyn PageCache + Send>, ConfigError> {
        self.validate()?;
        Ok(match self.strategy {
            CacheStrategy::Passthrough => Box::new(PassthroughPageCache::new(source)),
            CacheStrategy::Tiny => Box::new(TinyPageCache::new(source, self.tiny_slots)),
            CacheStrategy::Lru => Box::new(LruPageCache::new(
                source,
                self.lru_capacity,
                self.lru_eviction_batch,
            )),
        })
    }
}

/// `[log]` table.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OpLogConfig {
    /// Salt written into new logs and checked on reopen.
    pub salt: u64,
    /// Fsync after every append.
    pub sync_on_append: bool,
}

impl OpLogConfig {
    /// Log options for a fresh log starting at `start_lsn`.
    pub fn options(&self, start_lsn: Lsn) -> OpLogOptions {
        OpLogOptions {
            salt: self.salt,
            start_lsn,
            sync_on_append: self.sync_on_append,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Page size in bytes.
    pub page_size: usize,
    /// Page cache settings.
    pub cache: PageCacheConfig,
    /// Operation log settings.
    pub log: OpLogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache: PageCacheConfig::default(),
            log: OpLogConfig::default(),
        }
    }
}

impl Config {
    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, "<inline>".into())
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path.display().to_string())
    }

    fn parse(text: &str, origin: String) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(text).map_err(|source| ConfigError::Parse { origin, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(ConfigError::Invalid(format!(
                "page_size {} outside {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        self.cache.validate()
    }
}
