//! Environment configuration for the reminder server.
//!
//! - REMINDERS_DATABASE_URL: PostgreSQL connection string (optional; without it
//!   runs are kept in memory and subscriptions come from REMINDERS_SUBSCRIPTIONS_FILE)
//! - REMINDERS_HTTP_ADDR: HTTP bind address (default: 127.0.0.1:24120)
//! - REMINDER_OFFSETS_DAYS: comma-separated days before renewal (default: 7,5,2,1)
//! - REMINDERS_MISSED_POLICY: `fire` or `skip` (default: fire)
//! - REMINDERS_POLL_INTERVAL_MS: runner poll interval (default: 1000)
//! - REMINDERS_BATCH_SIZE: runs claimed per tick (default: 50)
//! - REMINDERS_LEASE_SECONDS: claim lease (default: 300)
//! - REMINDERS_MAX_RUN_ATTEMPTS: attempts for retryable failures (default: 5)
//! - REMINDERS_RETRY_BASE_DELAY_MS: first retry delay (default: 1000)
//! - REMINDERS_SUBSCRIPTIONS_FILE: JSON fixture for the in-memory lookup
//! - REMINDERS_MAIL_FROM: sender address (default: reminders@localhost)

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::dispatch::DEFAULT_MAIL_FROM;
use crate::engine::{RunRetryPolicy, RunnerConfig};
use crate::schedule::{MissedReminderPolicy, ReminderOffsets};
use crate::workflow::ReminderSettings;

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:24120";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub http_addr: SocketAddr,
    pub offsets: ReminderOffsets,
    pub missed_policy: MissedReminderPolicy,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub lease: Duration,
    pub max_run_attempts: u32,
    pub retry_base_delay: Duration,
    pub subscriptions_file: Option<PathBuf>,
    pub mail_from: String,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let database_url = vars.string("REMINDERS_DATABASE_URL");

        let http_addr = vars
            .string("REMINDERS_HTTP_ADDR")
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string())
            .parse()
            .context("invalid REMINDERS_HTTP_ADDR")?;

        let offsets = match vars.string("REMINDER_OFFSETS_DAYS") {
            Some(raw) => raw
                .parse::<ReminderOffsets>()
                .context("invalid REMINDER_OFFSETS_DAYS")?,
            None => ReminderOffsets::default(),
        };

        let missed_policy = match vars.string("REMINDERS_MISSED_POLICY") {
            Some(raw) => MissedReminderPolicy::parse(&raw)
                .ok_or_else(|| anyhow!("invalid REMINDERS_MISSED_POLICY: {raw}"))?,
            None => MissedReminderPolicy::default(),
        };

        let poll_interval =
            Duration::from_millis(vars.u64("REMINDERS_POLL_INTERVAL_MS").unwrap_or(1000));
        let batch_size = vars.usize("REMINDERS_BATCH_SIZE").unwrap_or(50).max(1);
        let lease = Duration::from_secs(vars.u64("REMINDERS_LEASE_SECONDS").unwrap_or(300));
        let max_run_attempts = vars
            .u64("REMINDERS_MAX_RUN_ATTEMPTS")
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(5)
            .max(1);
        let retry_base_delay =
            Duration::from_millis(vars.u64("REMINDERS_RETRY_BASE_DELAY_MS").unwrap_or(1000));

        let subscriptions_file = vars.string("REMINDERS_SUBSCRIPTIONS_FILE").map(PathBuf::from);
        let mail_from = vars
            .string("REMINDERS_MAIL_FROM")
            .unwrap_or_else(|| DEFAULT_MAIL_FROM.to_string());

        Ok(Self {
            database_url,
            http_addr,
            offsets,
            missed_policy,
            poll_interval,
            batch_size,
            lease,
            max_run_attempts,
            retry_base_delay,
            subscriptions_file,
            mail_from,
        })
    }

    pub fn reminder_settings(&self) -> ReminderSettings {
        ReminderSettings {
            offsets: self.offsets.clone(),
            missed_policy: self.missed_policy,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            lease: self.lease,
        }
    }

    pub fn retry_policy(&self) -> RunRetryPolicy {
        RunRetryPolicy {
            max_attempts: self.max_run_attempts,
            base_delay: self.retry_base_delay,
            ..RunRetryPolicy::default()
        }
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// Trimmed value, with blank treated as unset.
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn u64(&self, var: &str) -> Option<u64> {
        self.string(var).and_then(|value| value.parse::<u64>().ok())
    }

    fn usize(&self, var: &str) -> Option<usize> {
        self.string(var).and_then(|value| value.parse::<usize>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<EngineConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.http_addr, DEFAULT_HTTP_ADDR.parse().unwrap());
        assert_eq!(config.offsets, ReminderOffsets::default());
        assert_eq!(config.missed_policy, MissedReminderPolicy::FireImmediately);
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.lease, Duration::from_secs(300));
        assert_eq!(config.max_run_attempts, 5);
        assert_eq!(config.mail_from, DEFAULT_MAIL_FROM);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("REMINDERS_DATABASE_URL", "postgres://localhost/reminders"),
            ("REMINDER_OFFSETS_DAYS", "3, 14"),
            ("REMINDERS_MISSED_POLICY", "skip"),
            ("REMINDERS_BATCH_SIZE", "5"),
            ("REMINDERS_MAX_RUN_ATTEMPTS", "2"),
            ("REMINDERS_SUBSCRIPTIONS_FILE", "fixtures/subs.json"),
        ])
        .unwrap();

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/reminders")
        );
        assert_eq!(config.offsets.days(), &[14, 3]);
        assert_eq!(config.missed_policy, MissedReminderPolicy::Skip);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.retry_policy().max_attempts, 2);
        assert_eq!(
            config.subscriptions_file,
            Some(PathBuf::from("fixtures/subs.json"))
        );
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config = config(&[("REMINDERS_DATABASE_URL", "  "), ("REMINDERS_BATCH_SIZE", "")])
            .unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn test_invalid_offsets_and_policy_are_errors() {
        assert!(config(&[("REMINDER_OFFSETS_DAYS", "7,0")]).is_err());
        assert!(config(&[("REMINDER_OFFSETS_DAYS", "7,7")]).is_err());
        assert!(config(&[("REMINDER_OFFSETS_DAYS", "100000000")]).is_err());
        assert!(config(&[("REMINDERS_MISSED_POLICY", "later")]).is_err());
        assert!(config(&[("REMINDERS_HTTP_ADDR", "not an addr")]).is_err());
    }
}
