//! Typed core configuration, built once at startup.
//!
//! Every value can be overridden from the environment after
//! `env_config::load_and_apply` has overlaid `.env` and the XDG
//! `config.toml`. Components receive the config by `Arc`; nothing reads the
//! environment after startup.

use std::time::Duration;

/// All tunables of the orchestration core.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Quality-loop iteration cap.
    pub max_review_iter: u32,
    /// Minimum acceptable review score (1..=10).
    pub min_quality: u8,
    /// Deployment retry cap.
    pub max_build_retries: u32,
    /// Keep released agents for reuse.
    pub agent_caching: bool,
    /// Per-agent context window budget in tokens.
    pub context_limit: u64,
    /// Warning threshold as a fraction of `context_limit`.
    pub warn_fraction: f64,
    /// Critical threshold as a fraction of `context_limit`.
    pub crit_fraction: f64,
    /// Session inactivity expiry.
    pub ttl_session: Duration,
    /// Max entries kept in a session history.
    pub n_history: usize,
    /// Classifier cache entry TTL.
    pub classify_ttl: Duration,
    /// Classifier cache capacity (LRU bound).
    pub classify_cache_capacity: usize,
    /// Soft deadline for one classification; expiry degrades to conversation.
    pub classify_timeout: Duration,
    /// Transport message limit; longer texts are chunked.
    pub max_msg_chars: usize,
    /// Pause between consecutive chunks.
    pub chunk_delay: Duration,
    /// A2A task round-trip timeout.
    pub agent_task_timeout: Duration,
    /// Circuit breaker: failures in the window before opening.
    pub fail_threshold: u32,
    /// Circuit breaker: open duration before the half-open probe.
    pub breaker_timeout: Duration,
    /// Added to `steps_total` whenever completed steps catch up with it.
    pub growth_delta: u32,
    /// Retry attempts for external calls.
    pub max_retries: usize,
    /// Retry backoff base interval.
    pub retry_base: Duration,
    /// Retry backoff multiplier.
    pub retry_factor: f64,
    /// Retry backoff cap.
    pub retry_cap: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_review_iter: 10,
            min_quality: 9,
            max_build_retries: 10,
            agent_caching: false,
            context_limit: 200_000,
            warn_fraction: 0.75,
            crit_fraction: 0.90,
            ttl_session: Duration::from_secs(60 * 60),
            n_history: 10,
            classify_ttl: Duration::from_secs(60 * 60),
            classify_cache_capacity: 1024,
            classify_timeout: Duration::from_secs(5),
            max_msg_chars: 4096,
            chunk_delay: Duration::from_millis(500),
            agent_task_timeout: Duration::from_secs(120),
            fail_threshold: 5,
            breaker_timeout: Duration::from_secs(60),
            growth_delta: 5,
            max_retries: 3,
            retry_base: Duration::from_millis(500),
            retry_factor: 2.0,
            retry_cap: Duration::from_secs(30),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

impl CoreConfig {
    /// Builds the config from defaults overridden by environment variables.
    /// Durations use their natural units: minutes for TTLs, milliseconds
    /// for delays, seconds for timeouts.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_u64("MAX_REVIEW_ITER") {
            cfg.max_review_iter = v as u32;
        }
        if let Some(v) = env_u64("MIN_QUALITY") {
            cfg.min_quality = v.clamp(1, 10) as u8;
        }
        if let Some(v) = env_u64("MAX_BUILD_RETRIES") {
            cfg.max_build_retries = v as u32;
        }
        if let Some(v) = env_bool("AGENT_CACHING") {
            cfg.agent_caching = v;
        }
        if let Some(v) = env_u64("CONTEXT_LIMIT") {
            cfg.context_limit = v;
        }
        if let Some(v) = env_f64("WARN_FRACTION") {
            cfg.warn_fraction = v;
        }
        if let Some(v) = env_f64("CRIT_FRACTION") {
            cfg.crit_fraction = v;
        }
        if let Some(v) = env_u64("TTL_SESSION_MINUTES") {
            cfg.ttl_session = Duration::from_secs(v * 60);
        }
        if let Some(v) = env_u64("N_HISTORY") {
            cfg.n_history = v as usize;
        }
        if let Some(v) = env_u64("CLASSIFY_TTL_MINUTES") {
            cfg.classify_ttl = Duration::from_secs(v * 60);
        }
        if let Some(v) = env_u64("MAX_MSG_CHARS") {
            cfg.max_msg_chars = v as usize;
        }
        if let Some(v) = env_u64("CHUNK_DELAY_MS") {
            cfg.chunk_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("AGENT_TASK_TIMEOUT_SECONDS") {
            cfg.agent_task_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("FAIL_THRESHOLD") {
            cfg.fail_threshold = v as u32;
        }
        if let Some(v) = env_u64("BREAKER_TIMEOUT_SECONDS") {
            cfg.breaker_timeout = Duration::from_secs(v);
        }
        cfg
    }

    /// Runs the env/TOML overlay for `app_name`, then reads the environment.
    pub fn load(app_name: &str) -> Result<Self, env_config::LoadError> {
        env_config::load_and_apply(app_name, None)?;
        Ok(Self::from_env())
    }
}
