// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for AWCP Delegators and
//! Executors.
//!
//! This crate provides [`DelegatorConfig`] and [`ExecutorConfig`] — the two
//! option tables a daemon loads at startup — together with helpers for
//! loading from TOML files, merging overlays, and producing advisory
//! [`ConfigWarning`]s. Recognized options are enumerated; unrecognized TOML
//! keys are ignored rather than rejected.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A TTL or retention value is unusually large.
    LargeDuration {
        /// Field the value came from.
        field: String,
        /// Value in seconds.
        secs: u64,
    },
    /// No listeners are configured for an Executor.
    NoListeners,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeDuration { field, secs } => {
                write!(f, "'{field}' is unusually large ({secs}s)")
            }
            ConfigWarning::NoListeners => {
                write!(f, "no listeners configured; this executor cannot receive INVITEs")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

/// Read-only or read-write, as configured rather than as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AccessModeConfig {
    /// Read-only.
    Ro,
    /// Read-write.
    Rw,
}

/// Hook commands run around the Delegator's lifecycle. Each is a shell
/// command string; empty means no hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HooksConfig {
    /// Run before admission is checked, on the Delegator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_delegate: Option<String>,
    /// Run after a delegation reaches a terminal state, on the Delegator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_done: Option<String>,
}

/// Hook commands run after an assignment reaches a terminal state, on the
/// Executor. Each is a shell command string; empty means no hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorHooksConfig {
    /// Run after an assignment finishes successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_task_complete: Option<String>,
    /// Run after an assignment fails or expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Delegator config
// ---------------------------------------------------------------------------

/// Top-level Delegator configuration: `spec.md` §6's Delegator option table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DelegatorConfig {
    /// `environment.baseDir`.
    pub environment: DelegatorEnvironmentConfig,
    /// `admission.{maxConcurrentDelegations,maxTotalBytes,maxFileCount,maxSingleFileBytes}`.
    #[serde(default)]
    pub admission: DelegatorAdmissionConfig,
    /// `defaults.{ttlSeconds,accessMode}`.
    #[serde(default)]
    pub defaults: DelegationDefaults,
    /// `hooks.*`.
    #[serde(default)]
    pub hooks: HooksConfig,
}

/// `environment.baseDir`: the directory environments are staged under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DelegatorEnvironmentConfig {
    /// Base directory under which each delegation gets `<baseDir>/<id>/`.
    pub base_dir: String,
}

/// `admission.*` thresholds a Delegator enforces before preparing a
/// transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DelegatorAdmissionConfig {
    /// Maximum number of concurrently active delegations.
    pub max_concurrent_delegations: u32,
    /// Maximum total workspace size, in bytes.
    pub max_total_bytes: u64,
    /// Maximum number of files across all resources.
    pub max_file_count: u64,
    /// Maximum size of any single file, in bytes.
    pub max_single_file_bytes: u64,
}

impl Default for DelegatorAdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_delegations: 5,
            max_total_bytes: 100 * 1024 * 1024,
            max_file_count: 10_000,
            max_single_file_bytes: 50 * 1024 * 1024,
        }
    }
}

/// `defaults.{ttlSeconds,accessMode}`: applied when an INVITE omits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DelegationDefaults {
    /// Default lease TTL, in seconds.
    pub ttl_seconds: u64,
    /// Default access mode.
    pub access_mode: AccessModeConfig,
}

impl Default for DelegationDefaults {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            access_mode: AccessModeConfig::Rw,
        }
    }
}

const MAX_REASONABLE_TTL_SECONDS: u64 = 86_400;

/// Load a [`DelegatorConfig`] from an optional TOML file path, applying
/// environment overrides afterward. `None` is an error: unlike the optional
/// overlay case, a Delegator has no sensible default `environment.baseDir`.
pub fn load_delegator_config(path: &Path) -> Result<DelegatorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let mut config = parse_delegator_toml(&content)?;
    apply_delegator_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`DelegatorConfig`].
pub fn parse_delegator_toml(content: &str) -> Result<DelegatorConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply `AWCP_DELEGATOR_*` environment variable overrides.
pub fn apply_delegator_env_overrides(config: &mut DelegatorConfig) {
    if let Ok(val) = std::env::var("AWCP_DELEGATOR_ENVIRONMENT_BASE_DIR") {
        config.environment.base_dir = val;
    }
    if let Ok(val) = std::env::var("AWCP_DELEGATOR_DEFAULT_TTL_SECONDS") {
        if let Ok(secs) = val.parse() {
            config.defaults.ttl_seconds = secs;
        }
    }
    if let Ok(val) = std::env::var("AWCP_DELEGATOR_MAX_CONCURRENT_DELEGATIONS") {
        if let Ok(n) = val.parse() {
            config.admission.max_concurrent_delegations = n;
        }
    }
}

/// Validate a parsed [`DelegatorConfig`], returning advisory warnings.
pub fn validate_delegator_config(config: &DelegatorConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.environment.base_dir.trim().is_empty() {
        errors.push("environment.baseDir must not be empty".into());
    }
    if config.admission.max_file_count == 0 {
        errors.push("admission.maxFileCount must be greater than zero".into());
    }
    if config.admission.max_concurrent_delegations == 0 {
        errors.push("admission.maxConcurrentDelegations must be greater than zero".into());
    }
    if config.defaults.ttl_seconds == 0 {
        errors.push("defaults.ttlSeconds must be greater than zero".into());
    } else if config.defaults.ttl_seconds > MAX_REASONABLE_TTL_SECONDS {
        warnings.push(ConfigWarning::LargeDuration {
            field: "defaults.ttlSeconds".into(),
            secs: config.defaults.ttl_seconds,
        });
    }
    if config.hooks.pre_delegate.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "hooks.preDelegate".into(),
            hint: "no pre-admission hook will run".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

/// Merge two Delegator configurations. Values in `overlay` take precedence.
pub fn merge_delegator_configs(base: DelegatorConfig, overlay: DelegatorConfig) -> DelegatorConfig {
    DelegatorConfig {
        environment: if overlay.environment.base_dir.is_empty() {
            base.environment
        } else {
            overlay.environment
        },
        admission: overlay.admission,
        defaults: overlay.defaults,
        hooks: HooksConfig {
            pre_delegate: overlay.hooks.pre_delegate.or(base.hooks.pre_delegate),
            post_done: overlay.hooks.post_done.or(base.hooks.post_done),
        },
    }
}

// ---------------------------------------------------------------------------
// Executor config
// ---------------------------------------------------------------------------

/// Top-level Executor configuration: `spec.md` §6's Executor option table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// `workDir`: base directory transports stage local work under.
    pub work_dir: String,
    /// `transport`: the adapter instance this Executor uses.
    pub transport: TransportConfig,
    /// `admission.{maxConcurrentDelegations,maxTtlSeconds,allowedAccessModes}`.
    #[serde(default)]
    pub admission: ExecutorAdmissionConfig,
    /// `assignment.{sandbox,resultRetentionMs}`.
    #[serde(default)]
    pub assignment: AssignmentConfig,
    /// `listeners[]`.
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    /// `hooks.{onTaskComplete,onError}`.
    #[serde(default)]
    pub hooks: ExecutorHooksConfig,
}

/// Transport adapter selection and its own configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// ZIP-archive transport.
    #[serde(rename_all = "camelCase")]
    Archive {
        /// Inline-vs-served-URL selection threshold, in bytes.
        #[serde(default = "default_chunk_threshold_bytes")]
        chunk_threshold_bytes: u64,
    },
    /// SSH-certificate + `sshfs` transport.
    #[serde(rename_all = "camelCase")]
    Sshfs {
        /// Delegator host the Executor mounts against.
        host: String,
        /// SSH port.
        port: u16,
        /// SSH username certificates are issued for.
        user: String,
    },
}

fn default_chunk_threshold_bytes() -> u64 {
    2 * 1024 * 1024
}

/// `admission.*` thresholds an Executor enforces before accepting an
/// INVITE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorAdmissionConfig {
    /// Maximum number of concurrently active assignments.
    pub max_concurrent_delegations: u32,
    /// Maximum lease TTL this Executor will accept.
    pub max_ttl_seconds: u64,
    /// Access modes this Executor is willing to accept.
    pub allowed_access_modes: Vec<AccessModeConfig>,
}

impl Default for ExecutorAdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_delegations: 5,
            max_ttl_seconds: 3600,
            allowed_access_modes: vec![AccessModeConfig::Ro, AccessModeConfig::Rw],
        }
    }
}

/// `assignment.{sandbox,resultRetentionMs}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentConfig {
    /// Named sandbox profile applied to task execution.
    pub sandbox: String,
    /// How long a completed assignment's result is retained before cleanup.
    pub result_retention_ms: u64,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            sandbox: "default".into(),
            result_retention_ms: 30 * 60 * 1000,
        }
    }
}

/// One configured listener endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ListenerConfig {
    /// Inbound HTTP listener.
    Http {
        /// Address to bind, e.g. `"0.0.0.0:7420"`.
        bind: String,
    },
    /// Outbound WebSocket reverse tunnel to a Delegator-side relay.
    #[serde(rename_all = "camelCase")]
    Ws {
        /// URL of the relay to dial.
        tunnel_url: String,
    },
}

/// Load an [`ExecutorConfig`] from a TOML file path, applying environment
/// overrides afterward.
pub fn load_executor_config(path: &Path) -> Result<ExecutorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let mut config = parse_executor_toml(&content)?;
    apply_executor_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into an [`ExecutorConfig`].
pub fn parse_executor_toml(content: &str) -> Result<ExecutorConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply `AWCP_EXECUTOR_*` environment variable overrides.
pub fn apply_executor_env_overrides(config: &mut ExecutorConfig) {
    if let Ok(val) = std::env::var("AWCP_EXECUTOR_WORK_DIR") {
        config.work_dir = val;
    }
    if let Ok(val) = std::env::var("AWCP_EXECUTOR_MAX_CONCURRENT_DELEGATIONS") {
        if let Ok(n) = val.parse() {
            config.admission.max_concurrent_delegations = n;
        }
    }
}

/// Validate a parsed [`ExecutorConfig`], returning advisory warnings.
pub fn validate_executor_config(config: &ExecutorConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.work_dir.trim().is_empty() {
        errors.push("workDir must not be empty".into());
    }
    if config.admission.max_concurrent_delegations == 0 {
        errors.push("admission.maxConcurrentDelegations must be greater than zero".into());
    }
    if let TransportConfig::Sshfs { host, user, .. } = &config.transport {
        if host.trim().is_empty() || user.trim().is_empty() {
            errors.push("transport.sshfs requires a non-empty host and user".into());
        }
    }
    if config.listeners.is_empty() {
        warnings.push(ConfigWarning::NoListeners);
    }
    if config.hooks.on_task_complete.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "hooks.onTaskComplete".into(),
            hint: "no hook will run after a successful assignment".into(),
        });
    }
    if config.assignment.result_retention_ms > 24 * 60 * 60 * 1000 {
        warnings.push(ConfigWarning::LargeDuration {
            field: "assignment.resultRetentionMs".into(),
            secs: config.assignment.result_retention_ms / 1000,
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

/// Merge two Executor configurations. Values in `overlay` take precedence;
/// listener lists are concatenated rather than replaced.
pub fn merge_executor_configs(base: ExecutorConfig, overlay: ExecutorConfig) -> ExecutorConfig {
    let mut listeners = base.listeners;
    listeners.extend(overlay.listeners);
    ExecutorConfig {
        work_dir: if overlay.work_dir.is_empty() {
            base.work_dir
        } else {
            overlay.work_dir
        },
        transport: overlay.transport,
        admission: overlay.admission,
        assignment: overlay.assignment,
        listeners,
        hooks: ExecutorHooksConfig {
            on_task_complete: overlay.hooks.on_task_complete.or(base.hooks.on_task_complete),
            on_error: overlay.hooks.on_error.or(base.hooks.on_error),
        },
    }
}
