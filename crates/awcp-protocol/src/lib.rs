//! awcp-protocol
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The five wire messages a Delegator and Executor exchange — `INVITE`,
//! `ACCEPT`, `START`, `DONE`, `ERROR` — plus the version check every inbound
//! message must pass before it reaches an engine.

use awcp_core::{ActiveLease, EnvironmentDeclaration, LeaseConfig, TaskSpec, TransportHandle};
use awcp_error::ErrorCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The only protocol version this crate understands.
pub const PROTOCOL_VERSION: &str = "1";

/// Transport the Delegator would prefer the Executor admit, named in
/// INVITE's optional `requirements`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirements {
    /// Requested transport discriminator (`"archive"` or `"sshfs"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
}

/// Authentication material carried in INVITE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Authentication scheme identifier.
    #[serde(rename = "type")]
    pub auth_type: String,
    /// Opaque credential value for that scheme.
    pub credential: String,
    /// Scheme-specific extra fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Constraints the Executor reports in ACCEPT, tightening the lease before
/// START is sent.
pub use awcp_core::ExecutorConstraints;

/// Work directory the Executor reports in ACCEPT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorWorkDir {
    /// Absolute path of the allocated work directory.
    pub path: String,
}

/// A reference to a deferred [`awcp_core::Snapshot`], carried in DONE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotReference {
    /// Snapshot id the Delegator can look up via its API.
    pub snapshot_id: Uuid,
}

/// The five wire message kinds, tagged on the wire by `type`.
///
/// Every variant carries `version` and `delegation_id` as its header
/// fields, matching `{version="1", type, delegationId}` in the protocol
/// description. Unknown extra fields on the wire are ignored by `serde`'s
/// default behavior (no `deny_unknown_fields`), matching forward
/// compatibility requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AwcpMessage {
    /// Delegator -> Executor: propose a delegation.
    #[serde(rename_all = "camelCase")]
    Invite {
        /// Literal `"1"`.
        version: String,
        /// Opaque delegation id.
        delegation_id: Uuid,
        /// Task carried verbatim to the task runner.
        task: TaskSpec,
        /// Requested lease.
        lease: LeaseConfig,
        /// Declared environment (names + modes only).
        environment: EnvironmentDeclaration,
        /// Transport preference, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        requirements: Option<Requirements>,
        /// Authentication material, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        auth: Option<AuthInfo>,
    },
    /// Executor -> Delegator: accept a delegation.
    #[serde(rename_all = "camelCase")]
    Accept {
        /// Literal `"1"`.
        version: String,
        /// Opaque delegation id.
        delegation_id: Uuid,
        /// Allocated work directory.
        executor_work_dir: ExecutorWorkDir,
        /// Tightened constraints, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        executor_constraints: Option<ExecutorConstraints>,
    },
    /// Delegator -> Executor: hand off the active lease and transport handle.
    #[serde(rename_all = "camelCase")]
    Start {
        /// Literal `"1"`.
        version: String,
        /// Opaque delegation id.
        delegation_id: Uuid,
        /// The lease now in force.
        lease: ActiveLease,
        /// Tagged transport handle for this delegation.
        work_dir: TransportHandle,
    },
    /// Executor -> Delegator: task finished, result attached or referenced.
    #[serde(rename_all = "camelCase")]
    Done {
        /// Literal `"1"`.
        version: String,
        /// Opaque delegation id.
        delegation_id: Uuid,
        /// Final summary from the task runner.
        final_summary: String,
        /// Optional notable highlights.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        highlights: Vec<String>,
        /// Optional free-form notes.
        #[serde(skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
        /// Deferred-apply snapshot reference, if the transport produced one.
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<SnapshotReference>,
    },
    /// Either direction: something went wrong.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Literal `"1"`.
        version: String,
        /// Opaque delegation id.
        delegation_id: Uuid,
        /// Stable taxonomy code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
        /// Optional remediation hint.
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
}

impl AwcpMessage {
    /// The message's `version` header field.
    pub fn version(&self) -> &str {
        match self {
            Self::Invite { version, .. }
            | Self::Accept { version, .. }
            | Self::Start { version, .. }
            | Self::Done { version, .. }
            | Self::Error { version, .. } => version,
        }
    }

    /// The message's `delegation_id` header field.
    pub fn delegation_id(&self) -> Uuid {
        match self {
            Self::Invite { delegation_id, .. }
            | Self::Accept { delegation_id, .. }
            | Self::Start { delegation_id, .. }
            | Self::Done { delegation_id, .. }
            | Self::Error { delegation_id, .. } => *delegation_id,
        }
    }

    /// The message's `type` discriminator, as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invite { .. } => "INVITE",
            Self::Accept { .. } => "ACCEPT",
            Self::Start { .. } => "START",
            Self::Done { .. } => "DONE",
            Self::Error { .. } => "ERROR",
        }
    }

    /// Build an `ERROR` message for `delegation_id`, stamped with the
    /// current protocol version.
    pub fn error(delegation_id: Uuid, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id,
            code,
            message: message.into(),
            hint: None,
        }
    }

    /// As [`Self::error`], with a remediation hint attached.
    pub fn error_with_hint(
        delegation_id: Uuid,
        code: ErrorCode,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self::Error {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id,
            code,
            message: message.into(),
            hint: Some(hint.into()),
        }
    }
}

/// Errors raised while decoding or validating a wire message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The JSON payload did not parse as any [`AwcpMessage`] variant.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The message's `version` field was not [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0:?}")]
    UnsupportedVersion(String),
    /// A message arrived whose `type` is not legal for the caller's current
    /// state (e.g. a second INVITE for an already-accepted delegation).
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// The message kind the caller was expecting.
        expected: &'static str,
        /// The message kind actually received.
        got: &'static str,
    },
}

/// Parse and version-validate a wire message.
///
/// Per the protocol's wire-format rule, a message whose `version` is not
/// exactly `"1"` is rejected without touching any engine state.
///
/// ```
/// use awcp_protocol::decode_message;
///
/// let raw = r#"{"type":"ERROR","version":"1","delegationId":
///     "00000000-0000-0000-0000-000000000000","code":"CANCELLED","message":"stopped"}"#;
/// let msg = decode_message(raw).unwrap();
/// assert_eq!(msg.kind(), "ERROR");
/// ```
pub fn decode_message(raw: &str) -> Result<AwcpMessage, ProtocolError> {
    let msg: AwcpMessage = serde_json::from_str(raw)?;
    if msg.version() != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(msg.version().to_string()));
    }
    Ok(msg)
}

/// Serialize a message to its wire JSON form.
pub fn encode_message(msg: &AwcpMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use awcp_core::AccessMode;
    use chrono::{DateTime, Utc};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sample_invite() -> AwcpMessage {
        AwcpMessage::Invite {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id: Uuid::nil(),
            task: TaskSpec {
                description: "demo".into(),
                prompt: "append to hello.txt".into(),
            },
            lease: LeaseConfig {
                ttl_seconds: 60,
                access_mode: AccessMode::Rw,
            },
            environment: EnvironmentDeclaration {
                resources: vec![],
                root: "/work/abc".into(),
            },
            requirements: None,
            auth: None,
        }
    }

    #[test]
    fn invite_roundtrips_through_json() {
        let msg = sample_invite();
        let json = encode_message(&msg).unwrap();
        assert!(json.contains(r#""type":"INVITE""#));
        assert!(json.contains(r#""delegationId":"#));
        assert!(json.contains(r#""ttlSeconds":60"#));
        let back = decode_message(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn header_accessors() {
        let msg = sample_invite();
        assert_eq!(msg.version(), "1");
        assert_eq!(msg.delegation_id(), Uuid::nil());
        assert_eq!(msg.kind(), "INVITE");
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let raw = r#"{"type":"ERROR","version":"2","delegationId":
            "00000000-0000-0000-0000-000000000000","code":"CANCELLED","message":"x"}"#;
        let err = decode_message(raw).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion(v) if v == "2"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{"type":"ERROR","version":"1","delegationId":
            "00000000-0000-0000-0000-000000000000","code":"CANCELLED","message":"x",
            "somethingFuture":"ignored"}"#;
        let msg = decode_message(raw).unwrap();
        assert_eq!(msg.kind(), "ERROR");
    }

    #[test]
    fn error_constructor_sets_version_and_no_hint() {
        let msg = AwcpMessage::error(Uuid::nil(), ErrorCode::Cancelled, "stopped");
        match msg {
            AwcpMessage::Error {
                version,
                code,
                hint,
                ..
            } => {
                assert_eq!(version, "1");
                assert_eq!(code, ErrorCode::Cancelled);
                assert!(hint.is_none());
            }
            _ => panic!("expected Error variant"),
        }
    }

    #[test]
    fn error_with_hint_constructor() {
        let msg = AwcpMessage::error_with_hint(
            Uuid::nil(),
            ErrorCode::DepMissing,
            "sshfs not found",
            "install sshfs and retry",
        );
        match msg {
            AwcpMessage::Error { hint, .. } => {
                assert_eq!(hint.as_deref(), Some("install sshfs and retry"));
            }
            _ => panic!("expected Error variant"),
        }
    }

    #[test]
    fn done_message_roundtrip_with_snapshot() {
        let msg = AwcpMessage::Done {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id: Uuid::nil(),
            final_summary: "appended X to hello.txt".into(),
            highlights: vec!["hello.txt changed".into()],
            notes: None,
            snapshot: Some(SnapshotReference {
                snapshot_id: Uuid::nil(),
            }),
        };
        let json = encode_message(&msg).unwrap();
        let back = decode_message(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn start_message_roundtrip_with_archive_handle() {
        let msg = AwcpMessage::Start {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id: Uuid::nil(),
            lease: ActiveLease {
                expires_at: now(),
                access_mode: AccessMode::Rw,
            },
            work_dir: TransportHandle::Archive {
                download_url: "https://d.example/a.zip".into(),
                upload_url: "https://d.example/a/result".into(),
                checksum: awcp_core::sha256_hex(b"x"),
                expires_at: now(),
                chunked: None,
                inline_base64: None,
            },
        };
        let json = encode_message(&msg).unwrap();
        let back = decode_message(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = decode_message("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
