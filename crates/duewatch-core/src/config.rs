//! Duewatch configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DuewatchError, Result};
use crate::types::Threshold;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuewatchConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_database_path() -> String {
    "~/.duewatch/duewatch.db".into()
}

impl Default for DuewatchConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            rate_limit: RateLimitConfig::default(),
            notifications: NotificationsConfig::default(),
            telegram: TelegramConfig::default(),
            webhook: WebhookConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl DuewatchConfig {
    /// Load config from the default path (~/.duewatch/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DuewatchError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DuewatchError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DuewatchError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Duewatch home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".duewatch")
    }

    /// Reject values that cannot drive a sane scheduler. Called once at
    /// startup; steady-state code never re-validates.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.upcoming_interval_secs == 0 {
            return Err(DuewatchError::config(
                "scheduler.upcoming_interval_secs must be > 0",
            ));
        }
        if self.scheduler.reconcile_interval_secs == 0 {
            return Err(DuewatchError::config(
                "scheduler.reconcile_interval_secs must be > 0",
            ));
        }
        if self.dispatch.workers == 0 {
            return Err(DuewatchError::config("dispatch.workers must be > 0"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(DuewatchError::config("dispatch.queue_capacity must be > 0"));
        }
        if self.dispatch.retry_budget == 0 {
            return Err(DuewatchError::config("dispatch.retry_budget must be > 0"));
        }
        if self.rate_limit.max_calls == 0 {
            return Err(DuewatchError::config("rate_limit.max_calls must be > 0"));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(DuewatchError::config("rate_limit.window_secs must be > 0"));
        }
        for key in &self.notifications.default_thresholds {
            if Threshold::from_key(key).is_none() {
                return Err(DuewatchError::config(format!(
                    "notifications.default_thresholds: unknown threshold '{key}'"
                )));
            }
        }
        if self
            .notifications
            .default_timezone
            .parse::<chrono_tz::Tz>()
            .is_err()
        {
            return Err(DuewatchError::config(format!(
                "notifications.default_timezone: unknown timezone '{}'",
                self.notifications.default_timezone
            )));
        }
        if self.telegram.enabled && self.telegram.bot_token.is_empty() {
            return Err(DuewatchError::config(
                "telegram.bot_token is required when telegram is enabled",
            ));
        }
        if self.webhook.enabled && self.webhook.url.is_empty() {
            return Err(DuewatchError::config(
                "webhook.url is required when webhook is enabled",
            ));
        }
        Ok(())
    }
}

/// Scan cadences and staleness bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Fast scan over deadlines inside the widest threshold window.
    #[serde(default = "default_upcoming_interval")]
    pub upcoming_interval_secs: u64,
    /// Slow full sweep catching anything the fast scan missed.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Thresholds staler than this are skipped outright, bounding the burst
    /// of reminders flushed after an extended outage.
    #[serde(default = "default_late_grace")]
    pub late_grace_secs: u64,
    /// Pending reservations older than this are re-driven by reconciliation.
    #[serde(default = "default_stale_pending")]
    pub stale_pending_secs: u64,
    /// How long shutdown waits for in-flight dispatch before force-stopping.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_upcoming_interval() -> u64 {
    60
}
fn default_reconcile_interval() -> u64 {
    900
}
fn default_late_grace() -> u64 {
    3600
}
fn default_stale_pending() -> u64 {
    600
}
fn default_shutdown_timeout() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            upcoming_interval_secs: default_upcoming_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            late_grace_secs: default_late_grace(),
            stale_pending_secs: default_stale_pending(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Dispatch worker pool and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Delivery attempts per reservation before it fails terminally.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
}

fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    256
}
fn default_retry_budget() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    2
}
fn default_backoff_max() -> u64 {
    300
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            retry_budget: default_retry_budget(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
        }
    }
}

/// Outbound rate ceiling, shared by every dispatch worker in the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,
}

fn default_rate_window() -> u64 {
    60
}
fn default_max_calls() -> u32 {
    20
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window(),
            max_calls: default_max_calls(),
        }
    }
}

/// Defaults seeded into a user's notification preference on first contact.
/// Users change them afterwards through the settings surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// IANA timezone assigned to users who have not picked one.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// Threshold keys enabled for new users.
    #[serde(default = "default_thresholds")]
    pub default_thresholds: Vec<String>,
}

fn default_timezone() -> String {
    "UTC".into()
}
fn default_thresholds() -> Vec<String> {
    vec!["due".into(), "1_day".into()]
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            default_timezone: default_timezone(),
            default_thresholds: default_thresholds(),
        }
    }
}

impl NotificationsConfig {
    /// The configured default set as thresholds. Unknown keys were rejected
    /// by `validate`, so they are silently dropped here.
    pub fn thresholds(&self) -> Vec<Threshold> {
        self.default_thresholds
            .iter()
            .filter_map(|key| Threshold::from_key(key))
            .collect()
    }
}

/// Telegram Bot API transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
        }
    }
}

/// Generic HTTP webhook transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            headers: Vec::new(),
        }
    }
}

/// Health/status HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_enabled")]
    pub enabled: bool,
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_enabled() -> bool {
    true
}
fn default_gateway_host() -> String {
    "127.0.0.1".into()
}
fn default_gateway_port() -> u16 {
    8088
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: default_gateway_enabled(),
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}
