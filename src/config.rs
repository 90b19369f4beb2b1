// =============================================================================
// Configuration — environment-driven, loaded once at startup
// =============================================================================
//
// Out of scope per the specification ("configuration loading" is an external
// collaborator concern), but a binary still has to read the environment
// somehow. Follows the same `dotenv` + `std::env::var(...).unwrap_or(...)`
// idiom the source engine used for its own settings.
// =============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub deriv_app_id: String,

    pub settlement_min_timeout_ms: u64,
    pub settlement_max_timeout_ms: u64,
    pub settlement_buffer_ms: u64,
    pub settlement_lock_timeout_ms: u64,
    pub settlement_subscribe_max_attempts: u32,
    pub settlement_subscribe_base_delay_ms: u64,
    pub settlement_subscribe_max_delay_ms: u64,

    pub live_commission_flat: f64,
    pub live_commission_bps: f64,

    pub recovery_interval_ms: u64,
    pub recovery_cooldown_ms: u64,

    pub bind_addr: String,
    pub database_url: String,
    pub admin_token: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn load() -> Self {
        let _ = dotenv::dotenv();

        Self {
            deriv_app_id: env_or_string("DERIV_APP_ID", "1089"),

            settlement_min_timeout_ms: env_or("SETTLEMENT_MIN_TIMEOUT_MS", 30_000),
            settlement_max_timeout_ms: env_or("SETTLEMENT_MAX_TIMEOUT_MS", 600_000),
            settlement_buffer_ms: env_or("SETTLEMENT_BUFFER_MS", 30_000),
            settlement_lock_timeout_ms: env_or("SETTLEMENT_LOCK_TIMEOUT_MS", 5_000),
            settlement_subscribe_max_attempts: env_or("SETTLEMENT_SUBSCRIBE_MAX_ATTEMPTS", 3),
            settlement_subscribe_base_delay_ms: env_or(
                "SETTLEMENT_SUBSCRIBE_BASE_DELAY_MS",
                500,
            ),
            settlement_subscribe_max_delay_ms: env_or(
                "SETTLEMENT_SUBSCRIBE_MAX_DELAY_MS",
                5_000,
            ),

            live_commission_flat: env_or("LIVE_COMMISSION_FLAT", 0.0),
            live_commission_bps: env_or("LIVE_COMMISSION_BPS", 0.0),

            recovery_interval_ms: env_or("RECOVERY_INTERVAL_MS", 10_000),
            recovery_cooldown_ms: env_or("RECOVERY_COOLDOWN_MS", 30_000),

            bind_addr: env_or_string("BIND_ADDR", "0.0.0.0:3001"),
            database_url: env_or_string("DATABASE_URL", "sqlite::memory:"),
            admin_token: env_or_string("ADMIN_TOKEN", ""),
        }
    }

    /// Fees for a settled contract: flat + bps on stake (spec §4.8 step 1).
    pub fn fees_for_stake(&self, stake: f64) -> f64 {
        self.live_commission_flat + stake * (self.live_commission_bps / 10_000.0)
    }
}
