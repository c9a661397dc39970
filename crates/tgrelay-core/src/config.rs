use std::{collections::HashMap, env, fs, path::Path, time::Duration};

use crate::{errors::Error, retry::RetryPolicy, Result};

/// Capacity/TTL pair for one logical cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    pub capacity: usize,
    pub ttl: Duration,
}

impl CacheSettings {
    pub const fn new(capacity: usize, ttl_secs: u64) -> Self {
        Self {
            capacity,
            ttl: Duration::from_secs(ttl_secs),
        }
    }
}

/// Typed configuration for the retrieval layer.
///
/// Per-pair filter settings live in [`crate::filter::FilterConfig`]; this struct only
/// covers the shared caches, retry behaviour and bookkeeping limits.
#[derive(Clone, Debug)]
pub struct Config {
    // Caches
    pub cache_enabled: bool,
    pub message_cache: CacheSettings,
    pub channel_cache: CacheSettings,
    pub permission_cache: CacheSettings,
    pub resolve_cache: CacheSettings,

    // Retry
    pub retry: RetryPolicy,

    // Bookkeeping
    pub error_history_limit: usize,
    pub media_group_min_fragments: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            message_cache: CacheSettings::new(1000, 300),
            channel_cache: CacheSettings::new(500, 3600),
            permission_cache: CacheSettings::new(500, 300),
            resolve_cache: CacheSettings::new(1000, 3600),
            retry: RetryPolicy::default(),
            error_history_limit: 1000,
            media_group_min_fragments: 2,
        }
    }
}

impl Config {
    /// Load from `.env` (if present) and the process environment.
    /// Process variables win over the file.
    pub fn load() -> Result<Self> {
        let file = fs::read_to_string(Path::new(".env"))
            .map(|contents| parse_dotenv(&contents))
            .unwrap_or_default();
        Self::load_from(|key| env::var(key).ok().or_else(|| file.get(key).cloned()))
    }

    /// Load using an arbitrary key lookup. Unset or unparsable values keep their defaults.
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Lookup(&lookup);
        let defaults = Self::default();

        let cache_enabled = vars.bool("TGRELAY_CACHE_ENABLED").unwrap_or(defaults.cache_enabled);
        let message_cache = vars.cache("MESSAGE_CACHE", defaults.message_cache)?;
        let channel_cache = vars.cache("CHANNEL_CACHE", defaults.channel_cache)?;
        let permission_cache = vars.cache("PERMISSION_CACHE", defaults.permission_cache)?;
        let resolve_cache = vars.cache("RESOLVE_CACHE", defaults.resolve_cache)?;

        let base = defaults.retry;
        let retry = RetryPolicy {
            max_retries: vars.u32("RETRY_MAX").unwrap_or(base.max_retries),
            base_delay: vars
                .u64("RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.base_delay),
            max_delay: vars
                .u64("RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.max_delay),
            // 0 means "wait however long the server asks".
            max_flood_wait: match vars.u64("MAX_FLOOD_WAIT") {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => base.max_flood_wait,
            },
        };
        if retry.base_delay > retry.max_delay {
            return Err(Error::Config(
                "RETRY_BASE_DELAY_MS must not exceed RETRY_MAX_DELAY_MS".to_string(),
            ));
        }

        let error_history_limit = vars
            .usize("ERROR_HISTORY_LIMIT")
            .unwrap_or(defaults.error_history_limit);
        if error_history_limit == 0 {
            return Err(Error::Config(
                "ERROR_HISTORY_LIMIT must be greater than zero".to_string(),
            ));
        }

        let media_group_min_fragments = vars
            .usize("MEDIA_GROUP_MIN_FRAGMENTS")
            .unwrap_or(defaults.media_group_min_fragments);

        Ok(Self {
            cache_enabled,
            message_cache,
            channel_cache,
            permission_cache,
            resolve_cache,
            retry,
            error_history_limit,
            media_group_min_fragments,
        })
    }
}

struct Lookup<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn str(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.str(key).map(|s| {
            matches!(
                s.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }

    fn u64(&self, key: &str) -> Option<u64> {
        self.str(key).and_then(|s| s.trim().parse::<u64>().ok())
    }

    fn u32(&self, key: &str) -> Option<u32> {
        self.str(key).and_then(|s| s.trim().parse::<u32>().ok())
    }

    fn usize(&self, key: &str) -> Option<usize> {
        self.str(key).and_then(|s| s.trim().parse::<usize>().ok())
    }

    /// `<PREFIX>_SIZE` (entries) and `<PREFIX>_TTL` (seconds).
    fn cache(&self, prefix: &str, default: CacheSettings) -> Result<CacheSettings> {
        let capacity = self
            .usize(&format!("{prefix}_SIZE"))
            .unwrap_or(default.capacity);
        if capacity == 0 {
            return Err(Error::Config(format!(
                "{prefix}_SIZE must be greater than zero"
            )));
        }
        let ttl = self
            .u64(&format!("{prefix}_TTL"))
            .map(Duration::from_secs)
            .unwrap_or(default.ttl);
        Ok(CacheSettings { capacity, ttl })
    }
}

/// `KEY=value` pairs from a dotenv file. Comments, blank lines and lines without `=`
/// are skipped; one pair of matching quotes around the value is removed.
fn parse_dotenv(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), unquote(v.trim())))
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn unquote(v: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|q| v.strip_prefix(q).and_then(|rest| rest.strip_suffix(q)))
        .unwrap_or(v)
}
