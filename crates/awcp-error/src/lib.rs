//! Unified error taxonomy with stable error codes for AWCP.
//!
//! Every AWCP error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag that appears verbatim in `ERROR` wire messages), a
//! human-readable message, an optional cause chain, and arbitrary key-value
//! context. Use the builder returned by [`AwcpError::new`] to construct
//! errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The Executor (or Delegator) declined the request outright.
    Decline,
    /// A required transport dependency is missing or unavailable.
    Dependency,
    /// The workspace failed an admission-controller size/shape check.
    Workspace,
    /// A work directory could not be resolved or used.
    WorkDir,
    /// The lease or the START window expired.
    Lease,
    /// Credential or authentication failure.
    Auth,
    /// Setup (transport or environment) failed after acceptance.
    Setup,
    /// The delegated task itself failed.
    Task,
    /// The delegation was cancelled.
    Cancellation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Decline => "decline",
            Self::Dependency => "dependency",
            Self::Workspace => "workspace",
            Self::WorkDir => "workdir",
            Self::Lease => "lease",
            Self::Auth => "auth",
            Self::Setup => "setup",
            Self::Task => "task",
            Self::Cancellation => "cancellation",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serializes to exactly the `SCREAMING_SNAKE_CASE` string named
/// in the protocol's error taxonomy, and that string is what travels on the
/// wire inside an `ERROR` message's `code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The Executor declined the INVITE (no reason beyond policy given).
    Declined,
    /// A required transport dependency (e.g. `sshfs`) is not available.
    DepMissing,
    /// The workspace exceeds an admission-controller size/count threshold.
    WorkspaceTooLarge,
    /// A declared resource source does not exist.
    WorkspaceNotFound,
    /// A declared resource is structurally invalid (bad globs, bad mode, ...).
    WorkspaceInvalid,
    /// The resolved work directory was denied by policy.
    WorkdirDenied,
    /// START did not arrive before the lease's outer bound expired.
    StartExpired,
    /// The active lease expired while the delegation was running.
    Expired,
    /// Credential issuance or verification failed.
    AuthFailed,
    /// Transport or environment setup failed after ACCEPT.
    SetupFailed,
    /// The task runner itself failed.
    TaskFailed,
    /// The delegation was cancelled by the Delegator.
    Cancelled,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Declined => ErrorCategory::Decline,
            Self::DepMissing => ErrorCategory::Dependency,
            Self::WorkspaceTooLarge | Self::WorkspaceNotFound | Self::WorkspaceInvalid => {
                ErrorCategory::Workspace
            }
            Self::WorkdirDenied => ErrorCategory::WorkDir,
            Self::StartExpired | Self::Expired => ErrorCategory::Lease,
            Self::AuthFailed => ErrorCategory::Auth,
            Self::SetupFailed => ErrorCategory::Setup,
            Self::TaskFailed => ErrorCategory::Task,
            Self::Cancelled => ErrorCategory::Cancellation,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"WORKSPACE_TOO_LARGE"`), identical to its wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Declined => "DECLINED",
            Self::DepMissing => "DEP_MISSING",
            Self::WorkspaceTooLarge => "WORKSPACE_TOO_LARGE",
            Self::WorkspaceNotFound => "WORKSPACE_NOT_FOUND",
            Self::WorkspaceInvalid => "WORKSPACE_INVALID",
            Self::WorkdirDenied => "WORKDIR_DENIED",
            Self::StartExpired => "START_EXPIRED",
            Self::Expired => "EXPIRED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::SetupFailed => "SETUP_FAILED",
            Self::TaskFailed => "TASK_FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AwcpError
// ---------------------------------------------------------------------------

/// Unified AWCP error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context. Only
/// `code` and `message` cross the wire in an `ERROR` message; `source` never
/// does (no stack traces are emitted to peers).
///
/// # Builder usage
///
/// ```
/// use awcp_error::{AwcpError, ErrorCode};
///
/// let err = AwcpError::new(ErrorCode::WorkspaceTooLarge, "workspace exceeds maxTotalBytes")
///     .with_context("maxTotalBytes", 104_857_600u64)
///     .with_context("observedBytes", 209_715_200u64);
/// ```
pub struct AwcpError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics (admission stats, hints).
    pub context: BTreeMap<String, serde_json::Value>,
}

impl AwcpError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Build the `{code, message}` pair carried by a wire `ERROR` message.
    pub fn to_wire(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code,
            message: self.message.clone(),
        }
    }
}

impl fmt::Debug for AwcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("AwcpError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for AwcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AwcpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// The minimal `{code, message}` payload that rides inside a wire `ERROR`
/// message — never carries `context` or `source`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayloadCode(pub ErrorCode);

/// Wire-shape error payload: exactly what an `ERROR` message's body carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable message (not guaranteed stable; do not match on it).
    pub message: String,
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serializable snapshot of an [`AwcpError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwcpErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&AwcpError> for AwcpErrorDto {
    fn from(err: &AwcpError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<AwcpErrorDto> for AwcpError {
    fn from(dto: AwcpErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
