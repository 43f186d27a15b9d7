use serde::{Deserialize, Serialize};

use crate::{
    command::CommandDescription,
    device::{
        build::{BuildOp, BuildSnapshot},
        DeviceSnapshot,
    },
    devices::{EphemeralRequest, ReloadSpec},
    error,
    lock::{LockAction, LockCredentials},
    native_port::NativePortSnapshot,
    port::LineSettings,
    user::User,
};

/// Actions users can ask of the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Every device, local and remote.
    ListDevices,

    /// One local device.
    GetDevice {
        /// Device id.
        id: String,
    },

    /// Create an ephemeral device.
    CreateDevice(EphemeralRequest),

    /// Run a command on a device and wait for it to finish.
    RunCommand {
        /// Device id.
        device: String,
        /// Command name.
        command: String,
        /// Session to send progress to. Without one, no progress is sent.
        #[serde(default)]
        origin: Option<String>,
    },

    /// The commands available on devices.
    ListCommands,

    /// Do something with the external lock of a device.
    LockAction {
        /// Device id.
        device: String,
        /// What to do.
        action: LockAction,
        /// Who is asking.
        credentials: LockCredentials,
    },

    /// Start a build on a device, replacing any build in progress.
    StartBuild {
        /// Device id.
        device: String,
        /// Build name.
        name: String,
        /// Where to read more.
        #[serde(default)]
        link: Option<String>,
        /// Started by an external system.
        #[serde(default)]
        external: bool,
    },

    /// Change the build in progress.
    PatchBuild {
        /// Device id.
        device: String,
        /// The change.
        op: BuildOp,
    },

    /// End the build in progress.
    RemoveBuild {
        /// Device id.
        device: String,
    },

    /// Record who holds the external lock of a device.
    SetLockOwner {
        /// Device id.
        device: String,
        /// The owner, if any.
        owner: Option<String>,
    },

    /// Re-read the configuration file and report what reloading it would do.
    PlanReload,

    /// Re-read the configuration file and reload it.
    ApplyReload {
        /// Only do this. Without it, do whatever it takes.
        #[serde(default)]
        spec: Option<ReloadSpec>,
    },

    /// Serial adapters on the host.
    ListNativePorts,

    /// Start using a serial adapter.
    OpenNativePort {
        /// OS path.
        path: String,
        /// Line settings.
        settings: LineSettings,
    },

    /// Keep using a serial adapter.
    KeepAliveNativePort {
        /// OS path.
        path: String,
    },

    /// Refuse a host, and whatever it resolves to, on every node.
    Blacklist {
        /// Host name or address.
        host: String,
    },

    /// The refused hosts.
    ListBlacklist,

    /// Set the profile of a host.
    SetUserInfo {
        /// Host name or address.
        host: String,
        /// Name to show.
        display_name: String,
        /// Email.
        #[serde(default)]
        email: Option<String>,
    },
}

/// Responses the gateway gives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The action was successful and no more context is needed.
    Ok,

    /// Devices.
    Devices(Vec<DeviceSnapshot>),

    /// A device.
    Device(DeviceSnapshot),

    /// The command tree.
    Commands(Vec<CommandDescription>),

    /// A build, as it is after the action.
    Build(Option<BuildSnapshot>),

    /// Who holds an external lock.
    LockOwner(Option<String>),

    /// What a reload does or did.
    Reload(ReloadSpec),

    /// Native ports.
    NativePorts(Vec<NativePortSnapshot>),

    /// A native port.
    NativePort(NativePortSnapshot),

    /// Blacklisted hosts.
    Hosts(Vec<String>),

    /// A user.
    User(User),
}

/// A fallible response.
pub type ResponseResult = Result<Response, error::Error>;
