//! Configuration for the engine.
//!
//! Layered with the following priority (highest first):
//! 1. TOML config file (`~/.config/gossip/config.toml`)
//! 2. Compiled defaults
//!
//! A missing default-path file is not an error (defaults are used). An
//! explicit path that doesn't exist is an error. The engine is a library,
//! so there is no CLI layer; embedding applications pass a path or a
//! ready-made [`CoreConfig`].

use std::path::PathBuf;

use rand::Rng as _;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    announcements: AnnouncementsFileConfig,
    messages: MessagesFileConfig,
    session_recovery: SessionRecoveryFileConfig,
    transport: TransportFileConfig,
    profile: ProfileFileConfig,
}

/// `[announcements]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AnnouncementsFileConfig {
    fetch_limit: Option<usize>,
    broken_threshold_ms: Option<u64>,
}

/// `[messages]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MessagesFileConfig {
    retry_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    max_fetch_iterations: Option<u32>,
}

/// `[session_recovery]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionRecoveryFileConfig {
    killed_retry_delay_ms: Option<u64>,
    saturated_retry_delay_ms: Option<u64>,
    jitter_ms: Option<u64>,
}

/// `[transport]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransportFileConfig {
    timeout_ms: Option<u64>,
    retry_attempts: Option<u32>,
}

/// `[profile]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ProfileFileConfig {
    key_republish_interval_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Announcement-board tuning.
#[derive(Debug, Clone)]
pub struct AnnouncementsConfig {
    /// Page size for announcement fetches.
    pub fetch_limit: usize,
    /// Age of a still-unanswered handshake after which renewal is signaled.
    pub broken_threshold_ms: u64,
}

/// Outgoing-queue tuning.
#[derive(Debug, Clone)]
pub struct MessagesConfig {
    /// Base delay for send retries.
    pub retry_delay_ms: u64,
    /// Cap on the exponential retry delay.
    pub retry_max_delay_ms: u64,
    /// Bound on the unstable-seeker-set fetch iteration.
    pub max_fetch_iterations: u32,
}

/// Killed/saturated session recovery tuning.
#[derive(Debug, Clone)]
pub struct SessionRecoveryConfig {
    /// Delay between killed-session recovery attempts.
    pub killed_retry_delay_ms: u64,
    /// Delay before the one-shot saturated-session retry.
    pub saturated_retry_delay_ms: u64,
    /// Spread applied to recovery schedules (± this many ms).
    pub jitter_ms: u64,
}

/// Relay-call tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-call timeout; a timeout is treated as a network error.
    pub timeout_ms: u64,
    /// Immediate in-call retries for user-initiated sends.
    pub retry_attempts: u32,
}

/// Profile maintenance tuning.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    /// Minimum interval between public-key republishes.
    pub key_republish_interval_ms: u64,
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Announcement-board tuning.
    pub announcements: AnnouncementsConfig,
    /// Outgoing-queue tuning.
    pub messages: MessagesConfig,
    /// Session recovery tuning.
    pub session_recovery: SessionRecoveryConfig,
    /// Relay-call tuning.
    pub transport: TransportConfig,
    /// Profile maintenance tuning.
    pub profile: ProfileConfig,
    /// Buffer size for the event channel.
    pub event_buffer: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            announcements: AnnouncementsConfig {
                fetch_limit: 100,
                broken_threshold_ms: 30 * 60 * 1000,
            },
            messages: MessagesConfig {
                retry_delay_ms: 5_000,
                retry_max_delay_ms: 5 * 60 * 1000,
                max_fetch_iterations: 10,
            },
            session_recovery: SessionRecoveryConfig {
                killed_retry_delay_ms: 60_000,
                saturated_retry_delay_ms: 60_000,
                jitter_ms: 2_000,
            },
            transport: TransportConfig {
                timeout_ms: 10_000,
                retry_attempts: 3,
            },
            profile: ProfileConfig {
                key_republish_interval_ms: 7 * 24 * 60 * 60 * 1000,
            },
            event_buffer: 64,
        }
    }
}

impl CoreConfig {
    /// Loads configuration by merging a TOML file onto compiled defaults.
    ///
    /// If `path` is given, the file must exist. If `path` is `None`, the
    /// default path (`~/.config/gossip/config.toml`) is tried and silently
    /// ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit config file cannot be read,
    /// or any config file fails to parse.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let file = load_config_file(path)?;
        Ok(Self::resolve(&file))
    }

    /// Resolves a `CoreConfig` from a parsed config file.
    ///
    /// Priority: file > default. Separated from `load()` to enable unit
    /// testing without the filesystem.
    #[must_use]
    fn resolve(file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            announcements: AnnouncementsConfig {
                fetch_limit: file
                    .announcements
                    .fetch_limit
                    .unwrap_or(defaults.announcements.fetch_limit),
                broken_threshold_ms: file
                    .announcements
                    .broken_threshold_ms
                    .unwrap_or(defaults.announcements.broken_threshold_ms),
            },
            messages: MessagesConfig {
                retry_delay_ms: file
                    .messages
                    .retry_delay_ms
                    .unwrap_or(defaults.messages.retry_delay_ms),
                retry_max_delay_ms: file
                    .messages
                    .retry_max_delay_ms
                    .unwrap_or(defaults.messages.retry_max_delay_ms),
                max_fetch_iterations: file
                    .messages
                    .max_fetch_iterations
                    .unwrap_or(defaults.messages.max_fetch_iterations),
            },
            session_recovery: SessionRecoveryConfig {
                killed_retry_delay_ms: file
                    .session_recovery
                    .killed_retry_delay_ms
                    .unwrap_or(defaults.session_recovery.killed_retry_delay_ms),
                saturated_retry_delay_ms: file
                    .session_recovery
                    .saturated_retry_delay_ms
                    .unwrap_or(defaults.session_recovery.saturated_retry_delay_ms),
                jitter_ms: file
                    .session_recovery
                    .jitter_ms
                    .unwrap_or(defaults.session_recovery.jitter_ms),
            },
            transport: TransportConfig {
                timeout_ms: file
                    .transport
                    .timeout_ms
                    .unwrap_or(defaults.transport.timeout_ms),
                retry_attempts: file
                    .transport
                    .retry_attempts
                    .unwrap_or(defaults.transport.retry_attempts),
            },
            profile: ProfileConfig {
                key_republish_interval_ms: file
                    .profile
                    .key_republish_interval_ms
                    .unwrap_or(defaults.profile.key_republish_interval_ms),
            },
            event_buffer: defaults.event_buffer,
        }
    }

    /// A recovery schedule delay with the configured ± jitter applied.
    #[must_use]
    pub fn jittered_recovery_delay(&self, base_ms: u64) -> u64 {
        apply_spread(base_ms, self.session_recovery.jitter_ms)
    }

    /// The exponential send-retry delay for the given attempt count,
    /// capped at `retry_max_delay_ms`, with ±10% jitter.
    #[must_use]
    pub fn backoff_delay(&self, attempts: u32) -> u64 {
        let factor = 1u64 << attempts.min(20);
        let delay = self
            .messages
            .retry_delay_ms
            .saturating_mul(factor)
            .min(self.messages.retry_max_delay_ms);
        apply_spread(delay, delay / 10)
    }
}

/// Returns `base ± spread`, never below zero.
fn apply_spread(base: u64, spread: u64) -> u64 {
    if spread == 0 {
        return base;
    }
    let offset = rand::rng().random_range(0..=spread * 2);
    (base + offset).saturating_sub(spread)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            // No config dir available — use defaults.
            return Ok(ConfigFile::default());
        };
        config_dir.join("gossip").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
