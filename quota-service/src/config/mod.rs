//! Configuration module for quota-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// `None` runs on the in-process store.
    pub database: Option<DatabaseConfig>,
    pub quota: QuotaSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Tunables of the quota ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSettings {
    pub rate_limit_per_minute: i64,
    pub bonus_monthly_cap_seconds: i64,
    pub daily_gift_seconds: i64,
    pub welcome_bonus_seconds: i64,
    pub welcome_bonus_ttl_days: i64,
    pub collision_window_seconds: i64,
    pub idempotency_retention_days: i64,
    pub audit_retention_days: i64,
    pub max_serialization_retries: u32,
    pub maintenance_interval_secs: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 20,
            bonus_monthly_cap_seconds: 18_000,
            daily_gift_seconds: 900,
            welcome_bonus_seconds: 1_800,
            welcome_bonus_ttl_days: 30,
            collision_window_seconds: 300,
            idempotency_retention_days: 180,
            audit_retention_days: 90,
            max_serialization_retries: 3,
            maintenance_interval_secs: 3_600,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl QuotaSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rate_limit_per_minute: env_or(
                "QUOTA_RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            ),
            bonus_monthly_cap_seconds: env_or(
                "QUOTA_BONUS_MONTHLY_CAP_SECONDS",
                defaults.bonus_monthly_cap_seconds,
            ),
            daily_gift_seconds: env_or("QUOTA_DAILY_GIFT_SECONDS", defaults.daily_gift_seconds),
            welcome_bonus_seconds: env_or(
                "QUOTA_WELCOME_BONUS_SECONDS",
                defaults.welcome_bonus_seconds,
            ),
            welcome_bonus_ttl_days: env_or(
                "QUOTA_WELCOME_BONUS_TTL_DAYS",
                defaults.welcome_bonus_ttl_days,
            ),
            collision_window_seconds: env_or(
                "QUOTA_COLLISION_WINDOW_SECONDS",
                defaults.collision_window_seconds,
            ),
            idempotency_retention_days: env_or(
                "QUOTA_IDEMPOTENCY_RETENTION_DAYS",
                defaults.idempotency_retention_days,
            ),
            audit_retention_days: env_or(
                "QUOTA_AUDIT_RETENTION_DAYS",
                defaults.audit_retention_days,
            ),
            max_serialization_retries: env_or(
                "QUOTA_MAX_SERIALIZATION_RETRIES",
                defaults.max_serialization_retries,
            ),
            maintenance_interval_secs: env_or(
                "QUOTA_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval_secs,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let checks = [
            (self.rate_limit_per_minute > 0, "QUOTA_RATE_LIMIT_PER_MINUTE must be positive"),
            (self.bonus_monthly_cap_seconds >= 0, "QUOTA_BONUS_MONTHLY_CAP_SECONDS must not be negative"),
            (self.daily_gift_seconds > 0, "QUOTA_DAILY_GIFT_SECONDS must be positive"),
            (self.welcome_bonus_seconds > 0, "QUOTA_WELCOME_BONUS_SECONDS must be positive"),
            (self.welcome_bonus_ttl_days > 0, "QUOTA_WELCOME_BONUS_TTL_DAYS must be positive"),
            (self.collision_window_seconds >= 0, "QUOTA_COLLISION_WINDOW_SECONDS must not be negative"),
            (self.idempotency_retention_days > 0, "QUOTA_IDEMPOTENCY_RETENTION_DAYS must be positive"),
            (self.audit_retention_days > 0, "QUOTA_AUDIT_RETENTION_DAYS must be positive"),
            (self.maintenance_interval_secs > 0, "QUOTA_MAINTENANCE_INTERVAL_SECS must be positive"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(AppError::ConfigError(anyhow::anyhow!(*message))),
            None => Ok(()),
        }
    }
}

impl QuotaConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let database = match env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()) {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            }),
            None => None,
        };

        let quota = QuotaSettings::from_env();
        quota.validate()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "quota-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database,
            quota,
        })
    }
}
