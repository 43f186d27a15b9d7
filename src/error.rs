use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors thay may occur in this library.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// Device does not exist.
    #[error("The device `{0}` does not exist")]
    NoSuchDevice(String),

    /// Node does not exist on the given device.
    #[error("The device `{device}` has no node named `{node}`")]
    NoSuchNode {
        /// The device which was asked.
        device: String,

        /// The missing node name.
        node: String,
    },

    /// Command does not exist.
    #[error("The command `{0}` does not exist")]
    NoSuchCommand(String),

    /// Two devices share a name.
    #[error("A device named `{0}` already exists")]
    DuplicateDevice(String),

    /// Two nodes within the same device share a name.
    #[error("The device `{device}` has more than one node named `{node}`")]
    DuplicateNode {
        /// The device with the problem.
        device: String,

        /// The duplicated node name.
        node: String,
    },

    /// A node was used with a device it does not belong to.
    #[error("The node `{node}` belongs to device `{owner}`, not `{device}`")]
    NodeDeviceMismatch {
        /// The node.
        node: String,

        /// The device the node actually belongs to.
        owner: String,

        /// The device it was used with.
        device: String,
    },

    /// The configuration is not valid.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// Something went wrong with the underlying transport.
    #[error("Transport problem on `{port}`: {problem}")]
    Transport {
        /// Which port.
        port: String,

        /// What went wrong.
        problem: String,
    },

    /// Writing to a port which is not open.
    #[error("The port `{port}` is closed: {reason}")]
    PortClosed {
        /// Which port.
        port: String,

        /// Why it is closed.
        reason: String,
    },

    /// Writing to a remote IO port without a connected peer.
    #[error("No remote peer is connected to `{0}`")]
    NotConnected(String),

    /// Writing to a port which does not support writes.
    #[error("The port `{0}` does not support writing")]
    WriteUnsupported(String),

    /// A line is already open with different settings.
    #[error("The port `{path}` is already open with different settings: {problem}")]
    SettingsMismatch {
        /// The path of the line.
        path: String,

        /// Which settings differ.
        problem: String,
    },

    /// The resource is held by someone else.
    #[error("Busy: {0}")]
    Busy(String),

    /// A submenu command was asked to run.
    #[error("Command not runnable: {0}")]
    NotRunnable(String),

    /// A command body returned an error.
    #[error("Command `{command}` failed: {problem}")]
    CommandFailed {
        /// The command name.
        command: String,

        /// The error the command body produced.
        problem: String,
    },

    /// The device has no associated external lock.
    #[error("Device `{0}` has no associated Jenkins lock")]
    NoLock(String),

    /// The lock backend failed.
    #[error("Lock backend problem: {0}")]
    LockBackend(String),

    /// No build is running on the device.
    #[error("Device `{0}` has no build in progress")]
    NoBuild(String),

    /// The device has been killed.
    #[error("Device `{0}` is no longer alive")]
    DeviceDead(String),

    /// A feature gate is closed.
    #[error("The feature `{0}` is disabled")]
    FeatureDisabled(String),

    /// Native port is not known.
    #[error("The native port `{0}` does not exist")]
    NoSuchNativePort(String),

    /// The user did something which is not valid.
    #[error("The request did not conform to valid usage. Problem: `{0}`")]
    BadUsage(String),
}

impl Error {
    pub(crate) fn transport(port: impl Into<String>, problem: impl ToString) -> Self {
        Self::Transport {
            port: port.into(),
            problem: problem.to_string(),
        }
    }

    /// Unwrap as [`Error::BadConfig`], else give back the error.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}
