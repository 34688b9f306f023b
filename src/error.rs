//! Error types for vSphere VM provisioning

use std::time::Duration;
use thiserror::Error;

use crate::controller::VirtualMachineHandle;
use crate::platform::ObjectKind;

/// Errors reported by a platform client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid power state: {0}")]
    InvalidPowerState(String),

    #[error("remote fault: {0}")]
    Fault(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} not found: {path}")]
    NotFound { kind: ObjectKind, path: String },

    #[error("{kind} path '{path}' is ambiguous ({count} matches)")]
    Ambiguous {
        kind: ObjectKind,
        path: String,
        count: usize,
    },

    #[error("linked clone of '{template}' requires a snapshot{}", snapshot_suffix(.snapshot))]
    SnapshotRequired {
        template: String,
        snapshot: Option<String>,
    },

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("virtual machine {handle} created but {step} failed: {message}")]
    PartialFailure {
        handle: VirtualMachineHandle,
        step: String,
        message: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
        /// Set once the virtual machine exists, so the caller can resume it
        handle: Option<VirtualMachineHandle>,
    },

    #[error("folder placement failed: {0}")]
    PlacementFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: virtual machine is {current}, expected {expected}")]
    InvalidState { current: String, expected: String },

    #[error("attribute error: {0}")]
    Attribute(String),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn snapshot_suffix(snapshot: &Option<String>) -> String {
    snapshot
        .as_ref()
        .map(|s| format!(" ('{}' not found)", s))
        .unwrap_or_default()
}

impl Error {
    /// Check whether the caller may retry the operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::PartialFailure { .. })
    }

    /// Handle of the virtual machine left behind by a partial failure or a
    /// timeout after creation
    pub fn handle(&self) -> Option<&VirtualMachineHandle> {
        match self {
            Error::PartialFailure { handle, .. } => Some(handle),
            Error::Timeout { handle, .. } => handle.as_ref(),
            _ => None,
        }
    }

    /// Attach the handle of an existing virtual machine to a timeout
    pub(crate) fn with_handle(self, vm: &VirtualMachineHandle) -> Self {
        match self {
            Error::Timeout { operation, after, handle: None } => Error::Timeout {
                operation,
                after,
                handle: Some(vm.clone()),
            },
            other => other,
        }
    }

    /// Map a failed lookup onto the locator taxonomy
    pub(crate) fn lookup(kind: ObjectKind, path: &str, err: PlatformError) -> Self {
        match err {
            PlatformError::NotFound(_) => Error::NotFound {
                kind,
                path: path.to_string(),
            },
            other => Error::Platform(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_required_message() {
        let err = Error::SnapshotRequired {
            template: "tmpl".into(),
            snapshot: Some("snap1".into()),
        };
        assert_eq!(
            err.to_string(),
            "linked clone of 'tmpl' requires a snapshot ('snap1' not found)"
        );

        let err = Error::SnapshotRequired {
            template: "tmpl".into(),
            snapshot: None,
        };
        assert_eq!(err.to_string(), "linked clone of 'tmpl' requires a snapshot");
    }

    #[test]
    fn test_retryable() {
        let handle = VirtualMachineHandle::new("vm", "dc1", None);
        let partial = Error::PartialFailure {
            handle: handle.clone(),
            step: "disk configuration".into(),
            message: "boom".into(),
        };
        assert!(partial.is_retryable());
        assert_eq!(partial.handle(), Some(&handle));

        let not_found = Error::NotFound {
            kind: ObjectKind::Datastore,
            path: "ds9".into(),
        };
        assert!(!not_found.is_retryable());
        assert!(not_found.handle().is_none());
    }

    #[test]
    fn test_timeout_carries_handle() {
        let timeout = Error::Timeout {
            operation: "guest customization".into(),
            after: Duration::from_secs(1),
            handle: None,
        };
        assert!(timeout.is_retryable());
        assert!(timeout.handle().is_none());

        let handle = VirtualMachineHandle::new("vm", "dc1", Some("team".into()));
        let timeout = timeout.with_handle(&handle);
        assert_eq!(timeout.handle(), Some(&handle));
        assert_eq!(timeout.to_string(), "guest customization timed out after 1s");

        let other = Error::Config("bad".into()).with_handle(&handle);
        assert!(other.handle().is_none());
    }

    #[test]
    fn test_lookup_mapping() {
        let err = Error::lookup(
            ObjectKind::Network,
            "LAN",
            PlatformError::NotFound("LAN".into()),
        );
        assert!(matches!(err, Error::NotFound { kind: ObjectKind::Network, .. }));

        let err = Error::lookup(ObjectKind::Network, "LAN", PlatformError::Fault("down".into()));
        assert!(matches!(err, Error::Platform(PlatformError::Fault(_))));
    }
}
