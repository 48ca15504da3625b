//! Tracker configuration loaded from environment variables.

use std::time::Duration;

use sitetrack_client::channel::ChannelConfig;
use sitetrack_client::poller::PollConfig;
use sitetrack_client::reconnect::ReconnectConfig;

/// Default period of the list reconciliation loop.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// How a tracked job receives updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Streaming channel only.
    Stream,
    /// Status polling only.
    Poll,
    /// Streaming channel and polling side by side.
    Both,
    /// Streaming first; polling takes over if the channel gives up.
    StreamWithPollFallback,
}

impl UpdateMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stream" => Some(Self::Stream),
            "poll" => Some(Self::Poll),
            "both" => Some(Self::Both),
            "stream_with_poll_fallback" => Some(Self::StreamWithPollFallback),
            _ => None,
        }
    }

    pub fn uses_stream(self) -> bool {
        !matches!(self, Self::Poll)
    }

    /// Whether polling starts together with tracking.
    pub fn polls_eagerly(self) -> bool {
        matches!(self, Self::Poll | Self::Both)
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// REST base URL.
    pub api_url: String,
    /// Streaming base URL.
    pub ws_url: String,
    pub update_mode: UpdateMode,
    /// Keepalive period and reconnect policy of each streaming channel.
    pub channel: ChannelConfig,
    /// Interval, attempt budget and error threshold of each poll loop.
    pub poll: PollConfig,
    /// Period of the list-reconciliation loop.
    pub reconcile_interval: Duration,
    /// `limit` sent with each reconciliation list fetch.
    pub reconcile_page_size: u32,
    /// How long a cached result stays valid.
    pub cache_ttl: Duration,
    /// Maximum number of cached results.
    pub cache_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl TrackerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default                     |
    /// |------------------------------------|-----------------------------|
    /// | `SITETRACK_API_URL`                | `http://localhost:8000`     |
    /// | `SITETRACK_WS_URL`                 | `ws://localhost:8000`       |
    /// | `SITETRACK_UPDATE_MODE`            | `stream_with_poll_fallback` |
    /// | `SITETRACK_KEEPALIVE_SECS`         | `30`                        |
    /// | `SITETRACK_RECONNECT_BASE_MS`      | `1000`                      |
    /// | `SITETRACK_RECONNECT_MAX_ATTEMPTS` | `5`                         |
    /// | `SITETRACK_POLL_INTERVAL_MS`       | `2000`                      |
    /// | `SITETRACK_POLL_MAX_ATTEMPTS`      | `300`                       |
    /// | `SITETRACK_POLL_ERROR_THRESHOLD`   | `5`                         |
    /// | `SITETRACK_RECONCILE_INTERVAL_SECS`| `5`                         |
    /// | `SITETRACK_RECONCILE_PAGE_SIZE`    | `50`                        |
    /// | `SITETRACK_CACHE_TTL_SECS`         | `1800`                      |
    /// | `SITETRACK_CACHE_CAPACITY`         | `100`                       |
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api_url = lookup("SITETRACK_API_URL").unwrap_or_else(|| "http://localhost:8000".into());
        let ws_url = lookup("SITETRACK_WS_URL").unwrap_or_else(|| "ws://localhost:8000".into());

        let update_mode = match lookup("SITETRACK_UPDATE_MODE") {
            None => UpdateMode::StreamWithPollFallback,
            Some(raw) => UpdateMode::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "Invalid SITETRACK_UPDATE_MODE, using default");
                UpdateMode::StreamWithPollFallback
            }),
        };

        let number = |key: &str, default: u64| -> u64 {
            match lookup(key) {
                None => default,
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    tracing::warn!(key, value = %raw, default, "Invalid numeric setting, using default");
                    default
                }),
            }
        };

        // Timer periods must be non-zero.
        let period = |key: &str, default: u64| -> u64 {
            match number(key, default) {
                0 => {
                    tracing::warn!(key, default, "Zero period is not allowed, using default");
                    default
                }
                value => value,
            }
        };

        let channel = ChannelConfig {
            keepalive_interval: Duration::from_secs(period("SITETRACK_KEEPALIVE_SECS", 30)),
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(number("SITETRACK_RECONNECT_BASE_MS", 1000)),
                max_attempts: clamp_u32(number("SITETRACK_RECONNECT_MAX_ATTEMPTS", 5)),
            },
        };

        let poll = PollConfig {
            interval: Duration::from_millis(period("SITETRACK_POLL_INTERVAL_MS", 2000)),
            max_attempts: clamp_u32(number("SITETRACK_POLL_MAX_ATTEMPTS", 300)),
            error_threshold: clamp_u32(number("SITETRACK_POLL_ERROR_THRESHOLD", 5)),
        };

        Self {
            api_url,
            ws_url,
            update_mode,
            channel,
            poll,
            reconcile_interval: Duration::from_secs(period(
                "SITETRACK_RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL.as_secs(),
            )),
            reconcile_page_size: clamp_u32(number("SITETRACK_RECONCILE_PAGE_SIZE", 50)),
            cache_ttl: Duration::from_secs(number("SITETRACK_CACHE_TTL_SECS", 1800)),
            cache_capacity: usize::try_from(number("SITETRACK_CACHE_CAPACITY", 100))
                .unwrap_or(usize::MAX),
        }
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
