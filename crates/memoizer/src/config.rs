use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level, used unless `RUST_LOG` is set.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "memoizer".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Which entry gets removed once a bounded cache is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Never evict. `max_size` is ignored.
    None,
    /// Evict the least recently accessed entry.
    #[default]
    Lru,
    /// Evict the entry that was written the longest time ago, regardless of reads.
    LruUpdated,
}

/// Configuration of a single [`CacheEngine`](crate::caching::CacheEngine).
///
/// This is immutable once the engine has been created.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the cache, used to tag metrics and logs.
    pub name: String,

    /// How long a computed value is served before it is considered stale.
    ///
    /// Defaults to `30m`.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// An optional soft refresh point, which must be shorter than `ttl`.
    ///
    /// Once an entry is older than this, it is still served, but a deduplicated refresh is
    /// started in the background. Defaults to not refreshing in the background.
    #[serde(with = "humantime_serde")]
    pub refresh_after: Option<Duration>,

    /// Maximum number of entries. Defaults to unbounded.
    pub max_size: Option<NonZeroUsize>,

    /// The policy used to pick an entry to evict once `max_size` is reached.
    pub eviction: EvictionPolicy,

    /// Maximum duration a single producer invocation may take.
    ///
    /// Defaults to `2m`. A value of `null` disables the timeout.
    #[serde(with = "humantime_serde")]
    pub producer_timeout: Option<Duration>,

    /// Whether running producers are dropped on shutdown instead of being allowed to finish.
    pub cancel_on_shutdown: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            ttl: Duration::from_secs(30 * 60),
            refresh_after: None,
            max_size: None,
            eviction: EvictionPolicy::Lru,
            producer_timeout: Some(Duration::from_secs(2 * 60)),
            cancel_on_shutdown: false,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with the given `ttl` and default values otherwise.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    /// The effective size bound, taking the eviction policy into account.
    pub fn capacity(&self) -> Option<usize> {
        match self.eviction {
            EvictionPolicy::None => None,
            EvictionPolicy::Lru | EvictionPolicy::LruUpdated => self.max_size.map(NonZeroUsize::get),
        }
    }

    /// Checks the values for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            anyhow::bail!("cache `{}`: ttl must not be zero", self.name);
        }
        if let Some(refresh_after) = self.refresh_after {
            if refresh_after >= self.ttl {
                anyhow::bail!(
                    "cache `{}`: refresh_after ({refresh_after:?}) must be shorter than ttl ({:?})",
                    self.name,
                    self.ttl
                );
            }
        }
        if self.max_size.is_some() && self.eviction == EvictionPolicy::None {
            tracing::warn!(cache = %self.name, "max_size is ignored without an eviction policy");
        }
        Ok(())
    }
}

/// The configuration file of a cache, see [`Config::get`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration of the cache itself.
    pub cache: CacheConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.cache.validate()?;
        Ok(config)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
