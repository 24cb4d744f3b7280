//! Tracker configuration loaded from environment variables.
//!
//! Every knob has a documented fallback except the secrets and the
//! database url, which commands that need them ask for explicitly.

use std::time::Duration;

use anyhow::Context;

/// Tracker configuration.
#[derive(Clone)]
pub struct TrackerConfig {
    /// Env: `DATABASE_URL` (required)
    pub database_url: String,

    /// Env: `DB_MAX_CONNECTIONS`
    /// Default: `5`
    pub db_max_connections: u32,

    /// Hex-encoded AES-256 key for stored passwords.
    /// Env: `ENCRYPTION_KEY`
    pub encryption_key: Option<String>,

    /// Env: `PORTAL_LOGIN_URL`
    /// Default: `https://bars.mpei.ru/bars_web/`
    pub portal_login_url: String,

    /// Env: `PORTAL_GRADES_URL`
    /// Default: `https://bars.mpei.ru/bars_web/?sod=1`
    pub portal_grades_url: String,

    /// Env: `TELEGRAM_BOT_TOKEN`
    pub telegram_bot_token: Option<String>,

    /// Env: `SCAN_INTERVAL_SECS`
    /// Default: `600`
    pub scan_interval: Duration,

    /// Env: `WORKER_POOL_SIZE`
    /// Default: `4`
    pub worker_pool_size: usize,

    /// Delay each worker sleeps between two users.
    /// Env: `PACING_DELAY_MS`
    /// Default: `500`
    pub pacing_delay: Duration,

    /// Env: `USER_DEADLINE_SECS`
    /// Default: `15`
    pub user_deadline: Duration,

    /// Env: `RETRY_THRESHOLD`
    /// Default: `3`
    pub retry_threshold: u32,

    /// Env: `RETRY_TTL_SECS`
    /// Default: `3600`
    pub retry_ttl: Duration,

    /// Env: `OUTBOX_INTERVAL_SECS`
    /// Default: `30`
    pub outbox_interval: Duration,

    /// Env: `OUTBOX_BATCH_SIZE`
    /// Default: `50`
    pub outbox_batch_size: i64,

    /// Env: `OUTBOX_LEASE_SECS`
    /// Default: `120`
    pub outbox_lease: Duration,

    /// Env: `HTTP_TIMEOUT_SECS`
    /// Default: `10`
    pub http_timeout: Duration,
}

impl std::fmt::Debug for TrackerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerConfig")
            .field("db_max_connections", &self.db_max_connections)
            .field("portal_login_url", &self.portal_login_url)
            .field("portal_grades_url", &self.portal_grades_url)
            .field("scan_interval", &self.scan_interval)
            .field("worker_pool_size", &self.worker_pool_size)
            .field("pacing_delay", &self.pacing_delay)
            .field("user_deadline", &self.user_deadline)
            .field("retry_threshold", &self.retry_threshold)
            .field("retry_ttl", &self.retry_ttl)
            .field("outbox_interval", &self.outbox_interval)
            .field("outbox_batch_size", &self.outbox_batch_size)
            .field("outbox_lease", &self.outbox_lease)
            .field("http_timeout", &self.http_timeout)
            .finish_non_exhaustive()
    }
}

impl TrackerConfig {
    fn with_database_url(database_url: String) -> Self {
        Self {
            database_url,
            db_max_connections: 5,
            encryption_key: None,
            portal_login_url: "https://bars.mpei.ru/bars_web/".to_string(),
            portal_grades_url: "https://bars.mpei.ru/bars_web/?sod=1".to_string(),
            telegram_bot_token: None,
            scan_interval: Duration::from_secs(600),
            worker_pool_size: 4,
            pacing_delay: Duration::from_millis(500),
            user_deadline: Duration::from_secs(15),
            retry_threshold: 3,
            retry_ttl: Duration::from_secs(3600),
            outbox_interval: Duration::from_secs(30),
            outbox_batch_size: 50,
            outbox_lease: Duration::from_secs(120),
            http_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = lookup("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;
        let mut config = Self::with_database_url(database_url);

        if let Some(value) = parse_var(&lookup, "DB_MAX_CONNECTIONS") {
            config.db_max_connections = value;
        }
        config.encryption_key = lookup("ENCRYPTION_KEY").filter(|key| !key.is_empty());
        if let Some(url) = lookup("PORTAL_LOGIN_URL") {
            config.portal_login_url = url;
        }
        if let Some(url) = lookup("PORTAL_GRADES_URL") {
            config.portal_grades_url = url;
        }
        config.telegram_bot_token = lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.is_empty());

        if let Some(secs) = parse_var(&lookup, "SCAN_INTERVAL_SECS") {
            config.scan_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<usize>(&lookup, "WORKER_POOL_SIZE") {
            config.worker_pool_size = size.max(1);
        }
        if let Some(ms) = parse_var(&lookup, "PACING_DELAY_MS") {
            config.pacing_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "USER_DEADLINE_SECS") {
            config.user_deadline = Duration::from_secs(secs);
        }
        if let Some(threshold) = parse_var::<u32>(&lookup, "RETRY_THRESHOLD") {
            config.retry_threshold = threshold.max(1);
        }
        if let Some(secs) = parse_var(&lookup, "RETRY_TTL_SECS") {
            config.retry_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "OUTBOX_INTERVAL_SECS") {
            config.outbox_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<i64>(&lookup, "OUTBOX_BATCH_SIZE") {
            config.outbox_batch_size = size.max(1);
        }
        if let Some(secs) = parse_var(&lookup, "OUTBOX_LEASE_SECS") {
            config.outbox_lease = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "HTTP_TIMEOUT_SECS") {
            config.http_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn require_encryption_key(&self) -> anyhow::Result<&str> {
        self.encryption_key
            .as_deref()
            .context("ENCRYPTION_KEY must be set to decrypt stored passwords")
    }

    pub fn require_bot_token(&self) -> anyhow::Result<&str> {
        self.telegram_bot_token
            .as_deref()
            .context("TELEGRAM_BOT_TOKEN must be set to deliver notifications")
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
