use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one bridge process. Defaults match production values; every
/// field can be overridden through `WA_BRIDGE_*` environment variables.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Base delay for the reconnect backoff (`base * 2^(attempts-1)`).
    pub restart_backoff: Duration,
    /// Ceiling for the reconnect backoff.
    pub restart_max_backoff: Duration,
    /// Reconnect attempts before giving up and flagging for manual action.
    pub restart_max_attempts: u32,
    /// Short fixed delay used when the socket asks for a restart.
    pub restart_fixed_delay: Duration,
    /// Bad-session closes inside the window that force re-pairing.
    pub bad_session_threshold: u32,
    pub bad_session_window: Duration,
    pub retry_queue_enabled: bool,
    pub retry_queue_path: PathBuf,
    pub retry_queue_max: usize,
    pub retry_queue_flush_interval: Duration,
    /// How long the store is judged unavailable after a transient failure.
    pub retry_queue_cooldown: Duration,
    /// Messages younger than this are eligible for realtime/notify.
    pub realtime_recency_window: Duration,
    /// Bound on nested envelope wrapper unwrapping. Not semantically
    /// meaningful; just a guard against pathological nesting.
    pub unwrap_depth: usize,
    pub group_meta_ttl: Duration,
    /// History-replay messages older than this many days are skipped.
    pub history_cutoff_days: i64,
    /// Delays before the avatar, lead-name and sender-name backfill jobs
    /// after a successful connect.
    pub job_stagger: [Duration; 3],
    /// Row limits per backfill pass.
    pub backfill_lead_limit: usize,
    pub backfill_message_limit: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_millis(1200),
            restart_max_backoff: Duration::from_secs(30),
            restart_max_attempts: 8,
            restart_fixed_delay: Duration::from_millis(250),
            bad_session_threshold: 3,
            bad_session_window: Duration::from_secs(10 * 60),
            retry_queue_enabled: true,
            retry_queue_path: PathBuf::from("logs/bridge-retry-queue.jsonl"),
            retry_queue_max: 5000,
            retry_queue_flush_interval: Duration::from_secs(5),
            retry_queue_cooldown: Duration::from_secs(15),
            realtime_recency_window: Duration::from_secs(2 * 60),
            unwrap_depth: 5,
            group_meta_ttl: Duration::from_secs(5 * 60),
            history_cutoff_days: 14,
            job_stagger: [
                Duration::from_secs(4),
                Duration::from_secs(7),
                Duration::from_secs(9),
            ],
            backfill_lead_limit: 300,
            backfill_message_limit: 400,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64("WA_BRIDGE_RESTART_BACKOFF_MS") {
            config.restart_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("WA_BRIDGE_RESTART_MAX_BACKOFF_MS") {
            config.restart_max_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("WA_BRIDGE_RESTART_MAX_ATTEMPTS") {
            config.restart_max_attempts = n as u32;
        }
        if let Some(n) = env_u64("WA_BRIDGE_BAD_SESSION_THRESHOLD") {
            config.bad_session_threshold = n as u32;
        }
        if let Some(ms) = env_u64("WA_BRIDGE_BAD_SESSION_WINDOW_MS") {
            config.bad_session_window = Duration::from_millis(ms);
        }
        if let Ok(value) = std::env::var("WA_BRIDGE_RETRY_QUEUE_ENABLED") {
            config.retry_queue_enabled = value != "false";
        }
        if let Ok(path) = std::env::var("WA_BRIDGE_RETRY_QUEUE_PATH") {
            config.retry_queue_path = PathBuf::from(path);
        }
        if let Some(n) = env_u64("WA_BRIDGE_RETRY_QUEUE_MAX") {
            config.retry_queue_max = n as usize;
        }
        if let Some(ms) = env_u64("WA_BRIDGE_RETRY_QUEUE_FLUSH_INTERVAL_MS") {
            config.retry_queue_flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("WA_BRIDGE_RETRY_QUEUE_COOLDOWN_MS") {
            config.retry_queue_cooldown = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("WA_BRIDGE_RECENCY_WINDOW_MS") {
            config.realtime_recency_window = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("WA_BRIDGE_UNWRAP_DEPTH") {
            config.unwrap_depth = n as usize;
        }
        if let Some(ms) = env_u64("WA_BRIDGE_GROUP_META_TTL_MS") {
            config.group_meta_ttl = Duration::from_millis(ms);
        }
        if let Some(days) = env_u64("WA_BRIDGE_HISTORY_CUTOFF_DAYS") {
            config.history_cutoff_days = days as i64;
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("Ignoring unparseable env var {name}={value}");
            None
        }
    }
}
