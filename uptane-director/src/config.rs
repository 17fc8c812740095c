//! Configuration management for the director service
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uptane_core::{Repo, Role, Ttl};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Expiry ttl of each role in each repository
    pub ttls: BTreeMap<(Repo, Role), Ttl>,

    /// Documents expiring within this window are re-signed
    pub expiry_window: Ttl,

    /// Advertised in root metadata
    pub consistent_snapshot: bool,

    /// RSA modulus size for generated keys
    pub key_bits: usize,

    /// Base of the image URIs written into director targets
    pub gateway_origin: String,

    pub resign_interval_secs: u64,
    pub rollout_interval_secs: u64,
    pub purge_interval_secs: u64,

    /// Certificate download attempts before giving up
    pub cert_poll_attempts: u32,

    /// Initial delay between certificate downloads, doubled each attempt
    pub cert_poll_backoff_ms: u64,

    /// Deliveries of one event before it is dead-lettered
    pub max_delivery_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        let mut ttls = BTreeMap::new();
        ttls.insert((Repo::Image, Role::Root), Ttl::days(365));
        ttls.insert((Repo::Image, Role::Targets), Ttl::days(365));
        ttls.insert((Repo::Image, Role::Snapshot), Ttl::days(1));
        ttls.insert((Repo::Image, Role::Timestamp), Ttl::days(1));
        ttls.insert((Repo::Director, Role::Root), Ttl::days(365));
        ttls.insert((Repo::Director, Role::Targets), Ttl::days(7));
        ttls.insert((Repo::Director, Role::Snapshot), Ttl::days(7));
        ttls.insert((Repo::Director, Role::Timestamp), Ttl::days(1));

        Self {
            ttls,
            expiry_window: Ttl::hours(12),
            consistent_snapshot: false,
            key_bits: uptane_core::crypto::DEFAULT_KEY_BITS,
            gateway_origin: "https://gateway.localhost".to_string(),
            resign_interval_secs: 3600,
            rollout_interval_secs: 30,
            purge_interval_secs: 3600,
            cert_poll_attempts: 6,
            cert_poll_backoff_ms: 250,
            max_delivery_attempts: 5,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let mut ttls = BTreeMap::new();
        for repo in Repo::ALL {
            for role in Role::ALL {
                let name = format!(
                    "TUF_TTL_{}_{}",
                    repo.to_string().to_uppercase(),
                    role.as_str().to_uppercase()
                );
                let ttl = parse_or(&lookup, &name, defaults.ttl(repo, role))?;
                ttls.insert((repo, role), ttl);
            }
        }

        let config = Config {
            ttls,
            expiry_window: parse_or(&lookup, "TUF_EXPIRY_WINDOW", defaults.expiry_window)?,
            consistent_snapshot: parse_or(
                &lookup,
                "TUF_CONSISTENT_SNAPSHOT",
                defaults.consistent_snapshot,
            )?,
            key_bits: parse_or(&lookup, "TUF_KEY_BITS", defaults.key_bits)?,
            gateway_origin: lookup("ROBOT_GATEWAY_ORIGIN").unwrap_or(defaults.gateway_origin),
            resign_interval_secs: parse_or(
                &lookup,
                "WORKER_RESIGN_INTERVAL_SECS",
                defaults.resign_interval_secs,
            )?,
            rollout_interval_secs: parse_or(
                &lookup,
                "WORKER_ROLLOUT_INTERVAL_SECS",
                defaults.rollout_interval_secs,
            )?,
            purge_interval_secs: parse_or(
                &lookup,
                "WORKER_PURGE_INTERVAL_SECS",
                defaults.purge_interval_secs,
            )?,
            cert_poll_attempts: parse_or(&lookup, "CERT_POLL_ATTEMPTS", defaults.cert_poll_attempts)?,
            cert_poll_backoff_ms: parse_or(
                &lookup,
                "CERT_POLL_BACKOFF_MS",
                defaults.cert_poll_backoff_ms,
            )?,
            max_delivery_attempts: parse_or(
                &lookup,
                "EVENT_MAX_DELIVERY_ATTEMPTS",
                defaults.max_delivery_attempts,
            )?,
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.resign_interval_secs == 0
            || self.rollout_interval_secs == 0
            || self.purge_interval_secs == 0
        {
            anyhow::bail!("Worker intervals must be greater than 0");
        }

        if self.cert_poll_attempts == 0 {
            anyhow::bail!("CERT_POLL_ATTEMPTS must be greater than 0");
        }

        if self.max_delivery_attempts == 0 {
            anyhow::bail!("EVENT_MAX_DELIVERY_ATTEMPTS must be greater than 0");
        }

        if self.key_bits < 1024 {
            anyhow::bail!("TUF_KEY_BITS must be at least 1024");
        }

        // a window as long as a ttl would re-sign that role on every tick
        let window = self.expiry_window.approx_duration();
        if let Some((repo, role, ttl)) = self.shortest_online_ttl() {
            if window >= ttl.approx_duration() {
                anyhow::bail!(
                    "TUF_EXPIRY_WINDOW ({}) must be shorter than the {} {} ttl ({})",
                    self.expiry_window,
                    repo,
                    role,
                    ttl
                );
            }
        }

        Ok(())
    }

    /// Ttl of `role` in `repo`.
    pub fn ttl(&self, repo: Repo, role: Role) -> Ttl {
        self.ttls
            .get(&(repo, role))
            .copied()
            .unwrap_or(Ttl::days(1))
    }

    /// Shortest ttl among roles other than root.
    fn shortest_online_ttl(&self) -> Option<(Repo, Role, Ttl)> {
        self.ttls
            .iter()
            .filter(|((_, role), _)| *role != Role::Root)
            .map(|((repo, role), ttl)| (*repo, *role, *ttl))
            .min_by_key(|(_, _, ttl)| ttl.approx_duration())
    }

    pub fn cert_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.cert_poll_backoff_ms)
    }

    /// URI robots download an image from.
    pub fn image_uri(&self, image_id: &str) -> String {
        format!(
            "{}/api/v0/robot/repo/images/{}",
            self.gateway_origin.trim_end_matches('/'),
            image_id
        )
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {}", name, raw)),
        None => Ok(default),
    }
}
