//! Process configuration, from environment variables
use crate::event_log;
use crate::service::timer::TimerSettings;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Without it, everything is kept in memory and lost on exit
    pub database_url: Option<String>,
    pub timer: TimerSettings,
    /// Create a demo room in the in-memory store
    pub seed_demo: bool,
    /// Events kept for `/events` readers; older ones are dropped
    pub event_log_capacity: usize,
}

fn parse_var<T>(var: impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {v:?}")),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = TimerSettings::default();

        let listen_addr = parse_var(
            &var,
            "AUCTION_LISTEN_ADDR",
            SocketAddr::from_str(DEFAULT_LISTEN_ADDR)?,
        )?;
        let database_url = var("DATABASE_URL").filter(|url| !url.trim().is_empty());
        let timer = TimerSettings {
            bid_window: Duration::from_secs(parse_var(
                &var,
                "AUCTION_BID_WINDOW_SECS",
                defaults.bid_window.as_secs(),
            )?),
            anti_snipe_threshold: Duration::from_secs(parse_var(
                &var,
                "AUCTION_ANTI_SNIPE_THRESHOLD_SECS",
                defaults.anti_snipe_threshold.as_secs(),
            )?),
            anti_snipe_extension: Duration::from_secs(parse_var(
                &var,
                "AUCTION_ANTI_SNIPE_EXTENSION_SECS",
                defaults.anti_snipe_extension.as_secs(),
            )?),
            tick_interval: Duration::from_millis(parse_var(
                &var,
                "AUCTION_TICK_MILLIS",
                defaults.tick_interval.as_millis() as u64,
            )?),
        };
        let seed_demo = parse_var(&var, "AUCTION_SEED_DEMO", false)?;
        let event_log_capacity = parse_var(
            &var,
            "AUCTION_EVENT_LOG_CAPACITY",
            event_log::DEFAULT_CAPACITY,
        )?;

        if timer.bid_window.is_zero() {
            bail!("AUCTION_BID_WINDOW_SECS must be positive");
        }
        if timer.anti_snipe_extension.is_zero() {
            bail!("AUCTION_ANTI_SNIPE_EXTENSION_SECS must be positive");
        }
        if timer.tick_interval.is_zero() {
            bail!("AUCTION_TICK_MILLIS must be positive");
        }
        if event_log_capacity == 0 {
            bail!("AUCTION_EVENT_LOG_CAPACITY must be positive");
        }
        if timer.bid_window < timer.anti_snipe_threshold {
            bail!("anti-snipe threshold can't exceed the bid window");
        }

        Ok(Self {
            listen_addr,
            database_url,
            timer,
            seed_demo,
            event_log_capacity,
        })
    }
}
