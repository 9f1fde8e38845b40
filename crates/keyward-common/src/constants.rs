// Configuration keys and defaults

pub const LOCK_EXPIRE_MS_KEY: &str = "keyward.lock.expiry-time-ms";
pub const LOCK_WAIT_MS_KEY: &str = "keyward.lock.wait-time-ms";
pub const LOCK_RETRY_COUNT_KEY: &str = "keyward.lock.retry-count";
pub const LOCAL_LOCK_MEDIATOR_PREFIX_KEY: &str = "keyward.lock.local-mediator-prefix";
pub const IDS_RETRY_COUNT_KEY: &str = "keyward.ids.retry-count";
pub const IDS_WAIT_MS_KEY: &str = "keyward.ids.wait-time-ms";
pub const INSTANCE_ID_KEY: &str = "keyward.instance.id";

pub const DEFAULT_LOCK_EXPIRE_MS: u64 = 300 * 1000;
pub const DEFAULT_LOCK_WAIT_MS: u64 = 100;
pub const DEFAULT_LOCK_RETRY_COUNT: u32 = 3;
pub const DEFAULT_LOCAL_LOCK_MEDIATOR_PREFIX: &str = "default";
pub const DEFAULT_IDS_RETRY_COUNT: u32 = 20;
pub const DEFAULT_IDS_WAIT_TIME_MS: u64 = 100;

/// Prefix of environment variables overriding configuration keys.
pub const ENV_PREFIX: &str = "keyward";

/// Suffix appended to a database name to form its lock-claims database.
pub const LOCK_STORE_SUFFIX: &str = "_lock_";

/// Database holding the ID counters.
pub const ID_STORE_NAME: &str = "ids";
