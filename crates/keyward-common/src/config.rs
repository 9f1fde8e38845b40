//! Configuration management for Keyward
//!
//! Settings are read through the `config` crate from an optional file plus
//! `keyward`-prefixed environment variables. Missing keys fall back to the
//! defaults in [`crate::constants`].

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use config::{Config, ConfigError, Environment, File};

use crate::constants::{
    DEFAULT_IDS_RETRY_COUNT, DEFAULT_IDS_WAIT_TIME_MS, DEFAULT_LOCAL_LOCK_MEDIATOR_PREFIX,
    DEFAULT_LOCK_EXPIRE_MS, DEFAULT_LOCK_RETRY_COUNT, DEFAULT_LOCK_WAIT_MS, ENV_PREFIX,
    IDS_RETRY_COUNT_KEY, IDS_WAIT_MS_KEY, INSTANCE_ID_KEY, LOCAL_LOCK_MEDIATOR_PREFIX_KEY,
    LOCK_EXPIRE_MS_KEY, LOCK_RETRY_COUNT_KEY, LOCK_WAIT_MS_KEY,
};
use crate::retry::RetryPolicy;

/// Settings shared by the locking layer and the ID authority
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeywardConfig {
    /// Lease duration of a lock claim in milliseconds
    pub lock_expire_ms: u64,

    /// How long a fresh claim waits for racing claims to land before it is
    /// verified, in milliseconds
    pub lock_wait_ms: u64,

    /// Attempts at writing a claim record
    pub lock_retry_count: u32,

    /// Namespace of the local lock mediator this process joins
    pub local_lock_mediator_prefix: String,

    /// Attempts at allocating or reading an ID block
    pub ids_retry_count: u32,

    /// Pause between two ID allocation attempts in milliseconds
    pub ids_wait_ms: u64,

    /// Identity of this process, used to tell lock claimants apart
    pub instance_id: String,
}

impl Default for KeywardConfig {
    fn default() -> Self {
        Self {
            lock_expire_ms: DEFAULT_LOCK_EXPIRE_MS,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            lock_retry_count: DEFAULT_LOCK_RETRY_COUNT,
            local_lock_mediator_prefix: DEFAULT_LOCAL_LOCK_MEDIATOR_PREFIX.to_string(),
            ids_retry_count: DEFAULT_IDS_RETRY_COUNT,
            ids_wait_ms: DEFAULT_IDS_WAIT_TIME_MS,
            instance_id: default_instance_id(),
        }
    }
}

impl KeywardConfig {
    /// Load from an optional configuration file and the environment
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(".")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .context("failed to build keyward configuration")?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            lock_expire_ms: get_u64(config, LOCK_EXPIRE_MS_KEY, defaults.lock_expire_ms)?,
            lock_wait_ms: get_u64(config, LOCK_WAIT_MS_KEY, defaults.lock_wait_ms)?,
            lock_retry_count: get_u32(config, LOCK_RETRY_COUNT_KEY, defaults.lock_retry_count)?,
            local_lock_mediator_prefix: get_string(
                config,
                LOCAL_LOCK_MEDIATOR_PREFIX_KEY,
                defaults.local_lock_mediator_prefix,
            )?,
            ids_retry_count: get_u32(config, IDS_RETRY_COUNT_KEY, defaults.ids_retry_count)?,
            ids_wait_ms: get_u64(config, IDS_WAIT_MS_KEY, defaults.ids_wait_ms)?,
            instance_id: get_string(config, INSTANCE_ID_KEY, defaults.instance_id)?,
        })
    }

    pub fn lock_expire(&self) -> Duration {
        Duration::from_millis(self.lock_expire_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn ids_wait(&self) -> Duration {
        Duration::from_millis(self.ids_wait_ms)
    }

    /// Retry policy of the ID authority's allocation loop
    pub fn id_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.ids_retry_count, self.ids_wait())
    }
}

fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

fn get_u64(config: &Config, key: &str, default: u64) -> anyhow::Result<u64> {
    match config.get_int(key) {
        Ok(v) if v >= 0 => Ok(v as u64),
        Ok(v) => bail!("'{}' must not be negative, got {}", key, v),
        Err(ConfigError::NotFound(_)) => Ok(default),
        Err(e) => Err(e).with_context(|| format!("invalid value for '{}'", key)),
    }
}

fn get_u32(config: &Config, key: &str, default: u32) -> anyhow::Result<u32> {
    let value = get_u64(config, key, default as u64)?;
    u32::try_from(value).with_context(|| format!("'{}' out of range: {}", key, value))
}

fn get_string(config: &Config, key: &str, default: String) -> anyhow::Result<String> {
    match config.get_string(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        Ok(_) | Err(ConfigError::NotFound(_)) => Ok(default),
        Err(e) => Err(e).with_context(|| format!("invalid value for '{}'", key)),
    }
}
