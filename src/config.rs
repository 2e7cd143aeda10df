use std::time::Duration;

/// Engine configuration. Defaults are deliberately conservative; every
/// knob can be overridden through `AUTHZ_*` environment variables.
#[derive(Debug, Clone)]
pub struct AuthzConfig {
    /// Maximum role hierarchy depth (root = depth 0).
    pub max_role_depth: u32,
    /// TTL for cached decisions; also the bounded staleness window after
    /// a role or assignment mutation.
    pub cache_ttl: Duration,
    /// Upper bound on cached decisions before eviction kicks in.
    pub cache_max_entries: usize,
    /// Hard bound on one permission resolution; exceeding it yields a
    /// Deny decision with reason "resolution timeout".
    pub resolution_timeout: Duration,
    /// Audit events buffered in memory before oldest-first dropping.
    pub audit_buffer_capacity: usize,
    /// How often the audit writer drains the buffer.
    pub audit_flush_interval: Duration,
    /// Initial backoff after a failed audit storage write.
    pub audit_retry_base: Duration,
    /// Backoff ceiling under sustained audit backend outage.
    pub audit_retry_max: Duration,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            max_role_depth: 10,
            cache_ttl: Duration::from_secs(5),
            cache_max_entries: 10_000,
            resolution_timeout: Duration::from_millis(250),
            audit_buffer_capacity: 10_000,
            audit_flush_interval: Duration::from_millis(500),
            audit_retry_base: Duration::from_millis(100),
            audit_retry_max: Duration::from_secs(30),
        }
    }
}

impl AuthzConfig {
    /// Build a configuration from the environment, falling back to the
    /// defaults above. Invalid values are logged and ignored rather than
    /// failing startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_u32("AUTHZ_MAX_ROLE_DEPTH") {
            cfg.max_role_depth = v;
        }
        if let Some(v) = env_u64("AUTHZ_CACHE_TTL_SECS") {
            cfg.cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("AUTHZ_CACHE_MAX_ENTRIES") {
            cfg.cache_max_entries = v as usize;
        }
        if let Some(v) = env_u64("AUTHZ_RESOLUTION_TIMEOUT_MS") {
            cfg.resolution_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("AUTHZ_AUDIT_BUFFER_CAPACITY") {
            cfg.audit_buffer_capacity = v as usize;
        }
        if let Some(v) = env_u64("AUTHZ_AUDIT_FLUSH_INTERVAL_MS") {
            cfg.audit_flush_interval = Duration::from_millis(v);
        }

        tracing::info!(
            max_role_depth = cfg.max_role_depth,
            cache_ttl_secs = cfg.cache_ttl.as_secs(),
            resolution_timeout_ms = cfg.resolution_timeout.as_millis() as u64,
            "authorization engine configuration loaded"
        );
        cfg
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Invalid {} value '{}': {}", name, raw, e);
            None
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    env_u64(name).map(|v| v as u32)
}
