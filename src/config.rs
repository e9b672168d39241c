//! Environment-driven configuration.
//!
//! All knobs come from the environment so the server can run unchanged in a
//! container, behind a supervisor, or from the CLI:
//!
//! | Variable | Default | Effect |
//! |---|---|---|
//! | `ZIM_DIR` | `/zims` | Directory scanned for `*.zim` |
//! | `ZIMI_DATA_DIR` | `<ZIM_DIR>/.zimi` | Indexes, caches, state |
//! | `ZIMI_MANAGE` | `1` | Enables `/manage/*` |
//! | `ZIMI_MANAGE_PASSWORD` | unset | Management password (hashed on read) |
//! | `ZIMI_AUTO_UPDATE` | `0` | Enables the auto-update scheduler |
//! | `ZIMI_UPDATE_FREQ` | `weekly` | `daily` / `weekly` / `monthly` |
//! | `ZIMI_RATE_LIMIT` | `60` | Requests/min/IP; `0` disables |
//! | `ZIMI_PORT` | `8899` | HTTP listen port |

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Auto-update cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFreq {
    Daily,
    Weekly,
    Monthly,
}

impl UpdateFreq {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(UpdateFreq::Daily),
            "weekly" => Some(UpdateFreq::Weekly),
            "monthly" => Some(UpdateFreq::Monthly),
            _ => None,
        }
    }

    pub fn interval(self) -> Duration {
        match self {
            UpdateFreq::Daily => Duration::from_secs(86_400),
            UpdateFreq::Weekly => Duration::from_secs(604_800),
            UpdateFreq::Monthly => Duration::from_secs(2_592_000),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateFreq::Daily => "daily",
            UpdateFreq::Weekly => "weekly",
            UpdateFreq::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing `*.zim` archives.
    pub archive_dir: PathBuf,
    /// Directory for indexes, caches, and persistent state.
    pub data_dir: PathBuf,
    /// Whether `/manage/*` routes are served.
    pub manage_enabled: bool,
    /// Plaintext management password from the environment, if set.
    /// Takes precedence over the on-disk hash.
    pub manage_password: Option<String>,
    pub auto_update: bool,
    pub auto_update_freq: UpdateFreq,
    /// Requests per minute per IP; 0 disables rate limiting.
    pub rate_limit: u32,
    pub port: u16,
}

impl Config {
    /// Build a config from the environment, validating every field the way
    /// a config file would be validated.
    pub fn from_env() -> Result<Self> {
        let archive_dir =
            PathBuf::from(std::env::var("ZIM_DIR").unwrap_or_else(|_| "/zims".to_string()));
        let data_dir = match std::env::var("ZIMI_DATA_DIR") {
            Ok(d) => PathBuf::from(d),
            Err(_) => archive_dir.join(".zimi"),
        };

        let manage_enabled = env_flag("ZIMI_MANAGE", true);
        let manage_password = std::env::var("ZIMI_MANAGE_PASSWORD")
            .ok()
            .filter(|p| !p.is_empty());
        let auto_update = env_flag("ZIMI_AUTO_UPDATE", false);

        let freq_str = std::env::var("ZIMI_UPDATE_FREQ").unwrap_or_else(|_| "weekly".to_string());
        let auto_update_freq = match UpdateFreq::parse(&freq_str) {
            Some(f) => f,
            None => bail!(
                "ZIMI_UPDATE_FREQ must be daily, weekly, or monthly (got '{}')",
                freq_str
            ),
        };

        let rate_limit = match std::env::var("ZIMI_RATE_LIMIT") {
            Ok(v) => v
                .parse::<u32>()
                .map_err(|_| anyhow::anyhow!("ZIMI_RATE_LIMIT must be an integer"))?,
            Err(_) => 60,
        };

        let port = match std::env::var("ZIMI_PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("ZIMI_PORT must be a port number"))?,
            Err(_) => 8899,
        };

        Ok(Config {
            archive_dir,
            data_dir,
            manage_enabled,
            manage_password,
            auto_update,
            auto_update_freq,
            rate_limit,
            port,
        })
    }

    /// Config rooted at an explicit directory pair, with defaults for
    /// everything else. Used by the test harnesses.
    pub fn with_dirs(archive_dir: PathBuf, data_dir: PathBuf) -> Self {
        Config {
            archive_dir,
            data_dir,
            manage_enabled: true,
            manage_password: None,
            auto_update: false,
            auto_update_freq: UpdateFreq::Weekly,
            rate_limit: 60,
            port: 8899,
        }
    }

    pub fn titles_dir(&self) -> PathBuf {
        self.data_dir.join("titles")
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freq_parse_roundtrip() {
        for s in ["daily", "weekly", "monthly"] {
            assert_eq!(UpdateFreq::parse(s).unwrap().as_str(), s);
        }
        assert!(UpdateFreq::parse("hourly").is_none());
    }

    #[test]
    fn freq_intervals_ordered() {
        assert!(UpdateFreq::Daily.interval() < UpdateFreq::Weekly.interval());
        assert!(UpdateFreq::Weekly.interval() < UpdateFreq::Monthly.interval());
    }

    #[test]
    fn with_dirs_defaults() {
        let cfg = Config::with_dirs(PathBuf::from("/tmp/z"), PathBuf::from("/tmp/d"));
        assert!(cfg.manage_enabled);
        assert_eq!(cfg.rate_limit, 60);
        assert_eq!(cfg.titles_dir(), PathBuf::from("/tmp/d/titles"));
    }
}
