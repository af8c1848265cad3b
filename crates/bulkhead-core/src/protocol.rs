//! Wire formats
//!
//! - MessagePack frames from the sandbox child to the supervisor: setup failures, and the
//!   action's exit status
//! - JSON for spawn specs handed to the `bulkhead` helper

use crate::error::Stage;
use crate::{Result, SandboxError, SpawnSpec};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};

/// Message from the sandbox child. Success is signalled by the report pipe closing
/// without a message, which happens when the action's `execve` succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildReport {
    /// A setup step failed; the child exits right after sending this
    SetupFailed {
        stage: Stage,
        errno: i32,
        message: String,
    },
}

impl ChildReport {
    #[must_use]
    pub fn setup_failed(stage: Stage, errno: Errno, message: impl Into<String>) -> Self {
        Self::SetupFailed {
            stage,
            errno: errno as i32,
            message: message.into(),
        }
    }

    /// Convert into the error surfaced to the caller
    #[must_use]
    pub fn into_error(self) -> SandboxError {
        match self {
            Self::SetupFailed {
                stage,
                errno,
                message,
            } => SandboxError::from_stage_failure(stage, Errno::from_raw(errno), message),
        }
    }
}

/// How the action ended, sent by the sandbox init after reaping it.
///
/// The launcher's own exit status folds a signal death into `128 + n`, which an action
/// could also return on purpose; this frame keeps the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatus {
    pub exit_code: i32,
    pub signal: Option<i32>,
}

impl ActionStatus {
    #[must_use]
    pub const fn exited(code: i32) -> Self {
        Self {
            exit_code: code,
            signal: None,
        }
    }

    #[must_use]
    pub const fn signaled(signal: i32) -> Self {
        Self {
            exit_code: crate::result::signal_exit_code(signal),
            signal: Some(signal),
        }
    }
}

/// Encode a message to msgpack
pub fn encode<T: Serialize>(msg: &T) -> std::result::Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(msg)
}

/// Decode a message from msgpack
pub fn decode<'a, T: Deserialize<'a>>(
    data: &'a [u8],
) -> std::result::Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}

/// Parse and validate a JSON spawn spec
pub fn spec_from_json(data: &[u8]) -> Result<SpawnSpec> {
    let spec: SpawnSpec = serde_json::from_slice(data)
        .map_err(|e| SandboxError::InvalidSpec(format!("malformed spawn spec: {e}")))?;
    spec.validate()?;
    Ok(spec)
}

/// Serialize a spawn spec to pretty JSON
pub fn spec_to_json(spec: &SpawnSpec) -> Result<String> {
    serde_json::to_string_pretty(spec)
        .map_err(|e| SandboxError::InvalidSpec(format!("cannot serialize spawn spec: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn child_report_survives_msgpack() {
        let report = ChildReport::setup_failed(Stage::Mounted, Errno::EPERM, "mount /proc");
        let bytes = encode(&report).unwrap();
        let back: ChildReport = decode(&bytes).unwrap();
        assert_eq!(back, report);

        let err = back.into_error();
        assert_eq!(err.kind(), ErrorKind::IsolationDenied);
        assert_eq!(err.stage(), Some(Stage::Mounted));
    }

    #[test]
    fn spec_json_is_validated() {
        let err = spec_from_json(br#"{"argv": [], "host_root": "/w", "timeout": 10}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSpec);

        let err = spec_from_json(b"not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSpec);

        let spec = spec_from_json(
            br#"{"argv": ["cc", "-c", "a.c"], "host_root": "/w", "timeout": 10,
                 "inputs": {"a.c": "/src/a.c"}, "outputs": ["obj"]}"#,
        )
        .unwrap();
        let json = spec_to_json(&spec).unwrap();
        assert_eq!(spec_from_json(json.as_bytes()).unwrap(), spec);
    }
}
