//! Configuration types.
//!
//! Everything is read from environment variables. Required addressing and
//! credentials missing at startup are fatal before any I/O happens.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use secrecy::SecretString;

use crate::error::ConfigError;

/// Default Telegram Bot API base URL.
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Default per-channel seen-key capacity.
pub const DEFAULT_SEEN_CAP: usize = 5000;

/// Default attachment size limit: 50 MiB.
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 50 * 1024 * 1024;

/// Default maximum rendered length of one text unit.
pub const DEFAULT_MAX_TEXT_LEN: usize = 3500;

/// Default maximum length of a single-photo caption.
pub const DEFAULT_MAX_CAPTION_LEN: usize = 1000;

/// Telegram's upload limit for `sendPhoto`; larger images go as documents.
pub const DEFAULT_MAX_PHOTO_BYTES: u64 = 10 * 1024 * 1024;

/// Default target time zone for rendered time labels.
pub const DEFAULT_TIMEZONE: &str = "Europe/Helsinki";

/// Telegram sink settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
    pub api_base: String,
}

/// Limits applied when packing a channel's new items into delivery units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum rendered length (in chars) of one text unit.
    pub max_text_len: usize,
    /// Maximum caption length (in chars) of a media unit.
    pub max_caption_len: usize,
    /// Maximum number of photos in one grouped unit.
    pub max_group_size: usize,
    /// Images above this size are delivered as documents.
    pub max_photo_bytes: u64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_text_len: DEFAULT_MAX_TEXT_LEN,
            max_caption_len: DEFAULT_MAX_CAPTION_LEN,
            max_group_size: 10,
            max_photo_bytes: DEFAULT_MAX_PHOTO_BYTES,
        }
    }
}

/// Attachment fetch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentLimits {
    pub max_bytes: u64,
    pub timeout: Duration,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Poll loop pacing and per-cycle caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleConfig {
    /// Seen keys kept per channel.
    pub seen_cap: usize,
    /// Channels visited per cycle.
    pub max_channels: usize,
    /// Most recent items fetched per channel per cycle.
    pub max_items_per_channel: usize,
    /// Pause between channels.
    pub channel_pause: Duration,
    /// Pause between delivery units.
    pub unit_pause: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            seen_cap: DEFAULT_SEEN_CAP,
            max_channels: 80,
            max_items_per_channel: 20,
            channel_pause: Duration::from_millis(400),
            unit_pause: Duration::from_millis(150),
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub telegram: TelegramConfig,
    /// Base URL of the scraper sidecar.
    pub source_url: String,
    pub state_path: PathBuf,
    pub session_path: PathBuf,
    pub poll_interval: Duration,
    pub run_once: bool,
    pub cycle: CycleConfig,
    pub batch: BatchLimits,
    pub attachments: AttachmentLimits,
    pub timezone: Tz,
    /// Directory for the daily-rolling log file, if any.
    pub log_dir: Option<PathBuf>,
}

impl RelayConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required =
            |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let bot_token = required("TELEGRAM_BOT_TOKEN")?;
        let chat_id = required("TELEGRAM_CHAT_ID")?;
        let source_url = required("RELAY_SOURCE_URL")?;
        match url::Url::parse(&source_url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            Ok(u) => {
                return Err(ConfigError::InvalidValue {
                    key: "RELAY_SOURCE_URL".into(),
                    message: format!("unsupported scheme {}", u.scheme()),
                });
            }
            Err(e) => {
                return Err(ConfigError::InvalidValue {
                    key: "RELAY_SOURCE_URL".into(),
                    message: e.to_string(),
                });
            }
        }

        let timezone = match get("RELAY_TIMEZONE") {
            Some(name) => name.parse::<Tz>().map_err(|e| ConfigError::InvalidValue {
                key: "RELAY_TIMEZONE".into(),
                message: e.to_string(),
            })?,
            None => chrono_tz::Europe::Helsinki,
        };

        let cycle = CycleConfig {
            seen_cap: parse_or(&get, "RELAY_SEEN_CAP", DEFAULT_SEEN_CAP)?,
            max_channels: parse_or(&get, "RELAY_MAX_CHANNELS", 80)?,
            max_items_per_channel: parse_or(&get, "RELAY_MAX_ITEMS_PER_CHANNEL", 20)?,
            channel_pause: Duration::from_millis(parse_or(&get, "RELAY_CHANNEL_PAUSE_MS", 400)?),
            unit_pause: Duration::from_millis(parse_or(&get, "RELAY_UNIT_PAUSE_MS", 150)?),
        };
        if cycle.seen_cap == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_SEEN_CAP".into(),
                message: "must be at least 1".into(),
            });
        }

        let poll_secs: u64 = parse_or(&get, "RELAY_POLL_INTERVAL_SECS", 300)?;
        if poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_POLL_INTERVAL_SECS".into(),
                message: "must be at least 1".into(),
            });
        }

        let batch = BatchLimits {
            max_text_len: parse_or(&get, "RELAY_MAX_TEXT_LEN", DEFAULT_MAX_TEXT_LEN)?,
            max_caption_len: parse_or(&get, "RELAY_MAX_CAPTION_LEN", DEFAULT_MAX_CAPTION_LEN)?,
            ..BatchLimits::default()
        };

        let attachments = AttachmentLimits {
            max_bytes: parse_or(&get, "RELAY_MAX_ATTACHMENT_BYTES", DEFAULT_MAX_ATTACHMENT_BYTES)?,
            timeout: Duration::from_secs(parse_or(&get, "RELAY_ATTACHMENT_TIMEOUT_SECS", 30)?),
        };

        Ok(Self {
            telegram: TelegramConfig {
                bot_token: SecretString::from(bot_token),
                chat_id,
                api_base: get("TELEGRAM_API_BASE")
                    .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
            },
            source_url,
            state_path: get("RELAY_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("last_seen.json")),
            session_path: get("RELAY_SESSION_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("storageState.json")),
            poll_interval: Duration::from_secs(poll_secs),
            run_once: get("RELAY_RUN_ONCE")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            cycle,
            batch,
            attachments,
            timezone,
            log_dir: get("RELAY_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("TELEGRAM_BOT_TOKEN", "123:ABC"),
        ("TELEGRAM_CHAT_ID", "-100200"),
        ("RELAY_SOURCE_URL", "http://127.0.0.1:9000"),
    ];

    #[test]
    fn defaults_applied() {
        let cfg = RelayConfig::from_lookup(lookup(REQUIRED)).unwrap();
        assert_eq!(cfg.telegram.bot_token.expose_secret(), "123:ABC");
        assert_eq!(cfg.telegram.chat_id, "-100200");
        assert_eq!(cfg.telegram.api_base, DEFAULT_TELEGRAM_API_BASE);
        assert_eq!(cfg.cycle, CycleConfig::default());
        assert_eq!(cfg.batch, BatchLimits::default());
        assert_eq!(cfg.attachments.max_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.timezone, chrono_tz::Europe::Helsinki);
        assert_eq!(cfg.state_path, PathBuf::from("last_seen.json"));
        assert!(!cfg.run_once);
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn missing_token_is_fatal() {
        let err = RelayConfig::from_lookup(lookup(&[
            ("TELEGRAM_CHAT_ID", "1"),
            ("RELAY_SOURCE_URL", "http://x"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "TELEGRAM_BOT_TOKEN"));
    }

    #[test]
    fn blank_value_counts_as_missing() {
        let err = RelayConfig::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_CHAT_ID", "   "),
            ("RELAY_SOURCE_URL", "http://x"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "TELEGRAM_CHAT_ID"));
    }

    #[test]
    fn overrides_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend_from_slice(&[
            ("RELAY_SEEN_CAP", "10"),
            ("RELAY_MAX_TEXT_LEN", "200"),
            ("RELAY_TIMEZONE", "UTC"),
            ("RELAY_RUN_ONCE", "true"),
            ("RELAY_UNIT_PAUSE_MS", "0"),
        ]);
        let cfg = RelayConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.cycle.seen_cap, 10);
        assert_eq!(cfg.batch.max_text_len, 200);
        assert_eq!(cfg.timezone, chrono_tz::UTC);
        assert!(cfg.run_once);
        assert_eq!(cfg.cycle.unit_pause, Duration::ZERO);
    }

    #[test]
    fn invalid_number_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RELAY_SEEN_CAP", "lots"));
        let err = RelayConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RELAY_SEEN_CAP"));
    }

    #[test]
    fn zero_cap_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RELAY_SEEN_CAP", "0"));
        assert!(RelayConfig::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RELAY_POLL_INTERVAL_SECS", "0"));
        let err = RelayConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RELAY_POLL_INTERVAL_SECS")
        );
    }

    #[test]
    fn source_url_must_be_http() {
        let err = RelayConfig::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_CHAT_ID", "1"),
            ("RELAY_SOURCE_URL", "file:///tmp/x"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RELAY_SOURCE_URL"));
    }

    #[test]
    fn unknown_timezone_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RELAY_TIMEZONE", "Mars/Olympus"));
        let err = RelayConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RELAY_TIMEZONE"));
    }
}
