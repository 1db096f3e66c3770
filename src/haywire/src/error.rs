//! Error kinds shared by every host-side component.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HaywireError {
    #[error("memory backend unavailable at {path:?}: {source}")]
    BackendUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no valid beacon discovery page in the memory backend")]
    DiscoveryMissing,

    #[error("companion session changed from {old:#x} to {new:#x}")]
    SessionChanged { old: u32, new: u32 },

    #[error("torn beacon page: category {category} index {index}")]
    TornPage { category: u32, index: u32 },

    #[error("no translation for PID {pid} at VA {va:#x}")]
    TranslationAbsent { pid: u32, va: u64 },

    #[error("guest agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("beacon protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("read of {len} bytes at {gpa:#x} outside backend of {size:#x} bytes")]
    OutOfRange { gpa: u64, len: usize, size: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl HaywireError {
    /// Errors that callers absorb silently (skipped page, zero-filled read).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HaywireError::TornPage { .. } | HaywireError::TranslationAbsent { .. }
        )
    }

    pub(crate) fn backend(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HaywireError::BackendUnavailable {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, HaywireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(HaywireError::TornPage {
            category: 2,
            index: 3
        }
        .is_recoverable());
        assert!(HaywireError::TranslationAbsent { pid: 1, va: 0x1000 }.is_recoverable());
        assert!(!HaywireError::DiscoveryMissing.is_recoverable());
        assert!(!HaywireError::ProtocolViolation("bad".into()).is_recoverable());
    }

    #[test]
    fn test_session_changed_display() {
        let err = HaywireError::SessionChanged { old: 0x10, new: 0x20 };
        assert_eq!(
            err.to_string(),
            "companion session changed from 0x10 to 0x20"
        );
    }
}
