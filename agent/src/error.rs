//! Agent error types and result alias.

use thiserror::Error;

/// Agent result type alias
pub type Result<T> = std::result::Result<T, AgentError>;

/// Process-level error types.
///
/// Capture failures have their own taxonomy ([`CaptureError`]) because the
/// state tracker needs categorized outcomes; everything else that can go
/// wrong in the agent funnels through here.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Storage root cannot absorb a new capture even after forced cleanup.
    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Update error: {0}")]
    Update(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a capture failure should be handled by the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying on the same handle (timeout, empty frame, 5xx).
    Transient,
    /// The capture handle is poisoned; a reconnect is warranted.
    Fatal,
    /// Retrying is pointless until the configuration changes (bad
    /// credentials, no media profile). Logged rate-limited, never reconnected.
    Permanent,
}

/// Categorized capture failure, shared by all camera drivers.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("no media profile advertised")]
    NoProfile,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("empty frame")]
    EmptyFrame,

    #[error("camera not connected")]
    NotConnected,

    #[error("camera backend error: {0}")]
    Backend(#[from] opencv::Error),
}

impl CaptureError {
    /// Map the failure onto the recovery the worker should take.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout(_) | Self::EmptyFrame | Self::Decode(_) | Self::Codec(_) => {
                FailureClass::Transient
            }
            Self::Http { status, .. } => match status {
                401 | 403 => FailureClass::Permanent,
                _ => FailureClass::Transient,
            },
            Self::Auth(_) | Self::NoProfile => FailureClass::Permanent,
            Self::DeviceNotFound(_)
            | Self::DeviceBusy(_)
            | Self::Unreachable(_)
            | Self::NotConnected
            | Self::Backend(_) => FailureClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_permanent() {
        assert_eq!(
            CaptureError::Auth("bad digest".into()).class(),
            FailureClass::Permanent
        );
        assert_eq!(CaptureError::NoProfile.class(), FailureClass::Permanent);
        assert_eq!(
            CaptureError::Http {
                status: 401,
                message: "unauthorized".into()
            }
            .class(),
            FailureClass::Permanent
        );
    }

    #[test]
    fn timeouts_are_transient() {
        assert_eq!(CaptureError::Timeout(30).class(), FailureClass::Transient);
        assert_eq!(CaptureError::EmptyFrame.class(), FailureClass::Transient);
        assert_eq!(
            CaptureError::Http {
                status: 503,
                message: "busy".into()
            }
            .class(),
            FailureClass::Transient
        );
    }

    #[test]
    fn connection_losses_require_reconnect() {
        assert_eq!(
            CaptureError::Unreachable("10.0.0.9:554".into()).class(),
            FailureClass::Fatal
        );
        assert_eq!(
            CaptureError::DeviceNotFound("/dev/video0".into()).class(),
            FailureClass::Fatal
        );
    }
}
