//! Spool configuration structures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default quota, matching the usual "eight at a time" spool.
pub const DEFAULT_QUOTA: usize = 8;
/// Default spool name.
pub const DEFAULT_NAME: &str = "Spool";
/// Default interval between periodic progress refreshes while draining.
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 250;

/// Environment variable prefix read by [`SpoolConfig::from_env`].
pub const ENV_PREFIX: &str = "SPOOL_";

/// Configuration for a single spool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Display name, used in logs and progress reports.
    pub name: String,
    /// Maximum number of jobs running at once.
    pub quota: usize,
    /// Start admitting immediately; when false, jobs wait for `start()`.
    pub autostart: bool,
    /// Report progress through the spool's sink while draining.
    pub show_progress: bool,
    /// Interval between periodic progress refreshes (thread-backed spools).
    pub progress_interval_ms: u64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            quota: DEFAULT_QUOTA,
            autostart: true,
            show_progress: true,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl SpoolConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the spool name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the quota.
    #[must_use]
    pub const fn with_quota(mut self, quota: usize) -> Self {
        self.quota = quota;
        self
    }

    /// Set the quota to the number of available CPUs.
    #[must_use]
    pub fn with_available_parallelism(mut self) -> Self {
        self.quota = num_cpus::get().max(1);
        self
    }

    /// Set whether the spool starts admitting on construction.
    #[must_use]
    pub const fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// Set whether drains report progress.
    #[must_use]
    pub const fn with_show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Set the progress refresh interval.
    #[must_use]
    pub const fn with_progress_interval_ms(mut self, interval_ms: u64) -> Self {
        self.progress_interval_ms = interval_ms;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Describes the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.quota == 0 {
            return Err("quota must be greater than 0".into());
        }
        if self.progress_interval_ms == 0 {
            return Err("progress_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse a configuration from a JSON string and validate it.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `SPOOL_*` environment variables, reading `.env` first if present.
    ///
    /// Recognised: `SPOOL_NAME`, `SPOOL_QUOTA`, `SPOOL_AUTOSTART`,
    /// `SPOOL_SHOW_PROGRESS`, `SPOOL_PROGRESS_INTERVAL_MS`. Unset variables
    /// keep their defaults.
    ///
    /// # Errors
    ///
    /// Unparseable values or validation failure.
    pub fn from_env() -> Result<Self, String> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to read .env");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary `SPOOL_*` key lookup.
    ///
    /// # Errors
    ///
    /// Unparseable values or validation failure.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let get = |field: &str| lookup(&format!("{ENV_PREFIX}{field}"));
        let mut cfg = Self::default();
        if let Some(name) = get("NAME") {
            cfg.name = name;
        }
        if let Some(quota) = get("QUOTA") {
            cfg.quota = quota
                .trim()
                .parse()
                .map_err(|e| format!("{ENV_PREFIX}QUOTA: {e}"))?;
        }
        if let Some(autostart) = get("AUTOSTART") {
            cfg.autostart = parse_flag("AUTOSTART", &autostart)?;
        }
        if let Some(show) = get("SHOW_PROGRESS") {
            cfg.show_progress = parse_flag("SHOW_PROGRESS", &show)?;
        }
        if let Some(interval) = get("PROGRESS_INTERVAL_MS") {
            cfg.progress_interval_ms = interval
                .trim()
                .parse()
                .map_err(|e| format!("{ENV_PREFIX}PROGRESS_INTERVAL_MS: {e}"))?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_flag(field: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("{ENV_PREFIX}{field}: expected a boolean, got `{other}`")),
    }
}

/// Named spool configurations, e.g. one per collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolsConfig {
    /// Map of spool key to configuration.
    pub spools: HashMap<String, SpoolConfig>,
}

impl SpoolsConfig {
    /// Validate every spool and ensure at least one exists.
    ///
    /// # Errors
    ///
    /// Names the first invalid spool.
    pub fn validate(&self) -> Result<(), String> {
        if self.spools.is_empty() {
            return Err("at least one spool must be defined".into());
        }
        for (key, spool) in &self.spools {
            spool
                .validate()
                .map_err(|e| format!("spool `{key}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
