use std::{collections::BTreeMap, path::Path, time::Duration};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    port::{LineSettings, Parity, StopBits},
};

/// End-of-line convention of a node.
/// Advisory only, bytes are bridged as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Eol {
    /// `\r`
    Cr,
    /// `\n`
    Lf,
    /// `\r\n`
    #[default]
    Crlf,
}

/// Ways the web front end may offer to connect to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebLink {
    /// A telnet link to the node's TCP port.
    Telnet,
    /// An SSH link. Needs an SSH block.
    Ssh,
    /// A raw socket link to the node's TCP port.
    Raw,
}

/// How to reach the machine behind a node over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SshInfo {
    /// Host name or address.
    pub host: String,
    /// Login.
    pub username: String,
    /// Password.
    pub password: String,
}

/// Where a node's line comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortConfig {
    /// A local serial line.
    Serial {
        /// E.g. `/dev/ttyUSB0` or `COM3`.
        path: String,

        /// Line parameters.
        settings: LineSettings,
    },

    /// A companion process connects to us and provides the line.
    RemoteIo {
        /// Port to listen on for the companion. Any free port if not given.
        port: Option<u16>,
    },

    /// An in-memory line.
    Mock {
        /// Echo writes back as line data.
        #[serde(default)]
        loopback: bool,
    },
}

/// A node as described by a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique within the device.
    pub name: String,

    /// End-of-line convention.
    #[serde(default)]
    pub eol: Eol,

    /// The line.
    pub port: PortConfig,

    /// TCP port clients connect to. Any free port if not given.
    #[serde(default)]
    pub tcp_port: Option<u16>,

    /// Links to show in the front end.
    #[serde(default)]
    pub web_links: Vec<WebLink>,

    /// SSH details, required by [`WebLink::Ssh`].
    #[serde(default)]
    pub ssh: Option<SshInfo>,

    /// Anything else. Not interpreted.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl NodeConfig {
    /// A node on a serial line.
    pub fn serial(name: &str, path: &str, settings: LineSettings) -> Self {
        Self::with_port(
            name,
            PortConfig::Serial {
                path: path.into(),
                settings,
            },
        )
    }

    /// A node on a mock line.
    pub fn mock(name: &str, loopback: bool) -> Self {
        Self::with_port(name, PortConfig::Mock { loopback })
    }

    /// A node on any kind of line.
    pub fn with_port(name: &str, port: PortConfig) -> Self {
        Self {
            name: name.into(),
            eol: Eol::default(),
            port,
            tcp_port: None,
            web_links: vec![],
            ssh: None,
            metadata: None,
        }
    }
}

/// A device tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    /// Name of the tag.
    pub name: String,

    /// Longer description.
    #[serde(default)]
    pub description: Option<String>,

    /// Color to show the tag with.
    #[serde(default)]
    pub color: Option<String>,

    /// Show on the device page, not only in lists.
    #[serde(default)]
    pub show_on_device_page: bool,
}

impl Tag {
    /// A tag with only a name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            description: None,
            color: None,
            show_on_device_page: false,
        }
    }
}

/// A device as described by a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name. Unique.
    pub name: String,

    /// Longer description.
    #[serde(default)]
    pub description: Option<String>,

    /// Used for grouping in the front end.
    #[serde(default)]
    pub category: Option<String>,

    /// Tags.
    #[serde(default)]
    pub tags: Vec<Tag>,

    /// The nodes, in display order.
    pub nodes: Vec<NodeConfig>,

    /// Name of the lock an external build system uses for this device.
    #[serde(default)]
    pub jenkins_lock: Option<String>,
}

impl DeviceConfig {
    /// A device with only a name and nodes.
    pub fn new(name: &str, nodes: Vec<NodeConfig>) -> Self {
        Self {
            name: name.into(),
            description: None,
            category: None,
            tags: vec![],
            nodes,
            jenkins_lock: None,
        }
    }
}

/// The native port ("find my port") feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsFindConfig {
    /// Gate for the whole feature.
    pub enabled: bool,

    /// How often clients are expected to keep ports alive.
    pub poll_interval_secs: u64,
}

impl PortsFindConfig {
    /// The poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for PortsFindConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: 30,
        }
    }
}

/// Changes applied to devices fetched from a remote gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRewrite {
    /// Put in front of every device name.
    #[serde(default)]
    pub name_prefix: Option<String>,

    /// Replace the category.
    #[serde(default)]
    pub category: Option<String>,

    /// Add these tags.
    #[serde(default)]
    pub add_tags: Vec<Tag>,
}

/// A peer gateway whose devices are shown alongside ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Display name.
    pub name: String,

    /// Where the peer is.
    pub url: String,

    /// Rewrites applied to the peer's devices.
    #[serde(default)]
    pub rewrite: DeviceRewrite,
}

/// How users are presented.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDirectoryConfig {
    /// Avatar url for users without one. `{host}` is replaced by the user's host.
    #[serde(default)]
    pub avatar_template: Option<String>,
}

/// The configuration used for running the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The devices to set up.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Hosts which may not connect to nodes.
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Native port discovery.
    #[serde(default)]
    pub ports_find: PortsFindConfig,

    /// If set, the devices are reloaded from the file on SIGHUP.
    #[serde(default)]
    pub config_reloadable: bool,

    /// Peer gateways.
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,

    /// User presentation.
    #[serde(default)]
    pub user_directory: UserDirectoryConfig,
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Could not parse configuration: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path).map_err(|e| {
            Error::BadConfig(format!("Could not read `{}`: {e}", path.display()))
        })?;

        let config = Self::deserialize(&s)?;
        config.validate()?;

        Ok(config)
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        let console = NodeConfig {
            tcp_port: Some(7000),
            web_links: vec![WebLink::Telnet, WebLink::Raw],
            ..NodeConfig::serial("console", "/dev/ttyUSB0", LineSettings::default())
        };

        let debug = NodeConfig {
            eol: Eol::Lf,
            web_links: vec![WebLink::Telnet, WebLink::Ssh],
            ssh: Some(SshInfo {
                host: "bench-1.lab".into(),
                username: "root".into(),
                password: "root".into(),
            }),
            metadata: Some(serde_json::json!({"jtag": "SWD"})),
            ..NodeConfig::serial(
                "debug",
                "/dev/ttyUSB1",
                LineSettings {
                    baud_rate: 9600,
                    parity: Parity::Even,
                    stop_bits: StopBits::Two,
                    ..LineSettings::default()
                },
            )
        };

        Self {
            devices: vec![
                DeviceConfig {
                    description: Some("The bench by the window".into()),
                    category: Some("Benches".into()),
                    tags: vec![Tag {
                        color: Some("green".into()),
                        show_on_device_page: true,
                        ..Tag::new("arm64")
                    }],
                    jenkins_lock: Some("bench-1-lock".into()),
                    ..DeviceConfig::new("bench-1", vec![console, debug])
                },
                DeviceConfig::new("demo", vec![NodeConfig::mock("loop", true)]),
            ],
            blacklist: vec!["10.0.0.5".into()],
            ports_find: PortsFindConfig::default(),
            config_reloadable: true,
            remotes: vec![RemoteConfig {
                name: "lab-2".into(),
                url: "http://lab-2:8080".into(),
                rewrite: DeviceRewrite {
                    name_prefix: Some("lab-2/".into()),
                    ..Default::default()
                },
            }],
            user_directory: UserDirectoryConfig::default(),
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(format!("Could not serialize configuration: {e}")))
    }

    /// Check the invariants the rest of the gateway relies on.
    pub fn validate(&self) -> Result<(), Error> {
        validate_devices(&self.devices)?;

        if self.ports_find.poll_interval_secs == 0 {
            return Err(Error::BadConfig(
                "ports_find.poll_interval_secs must be positive".into(),
            ));
        }

        if let Some(name) = self.remotes.iter().map(|remote| &remote.name).duplicates().next() {
            return Err(Error::BadConfig(format!("Remote `{name}` is listed twice")));
        }

        Ok(())
    }
}

/// Check a list of device configurations.
///
/// Device names are unique, node names are unique within a device,
/// pinned TCP ports are unique, baud rates are positive,
/// and SSH links come with an SSH block.
pub fn validate_devices(devices: &[DeviceConfig]) -> Result<(), Error> {
    if let Some(name) = devices.iter().map(|device| &device.name).duplicates().next() {
        return Err(Error::DuplicateDevice(name.clone()));
    }

    let mut pinned: BTreeMap<u16, String> = BTreeMap::new();

    for device in devices {
        if let Some(node) = device.nodes.iter().map(|node| &node.name).duplicates().next() {
            return Err(Error::DuplicateNode {
                device: device.name.clone(),
                node: node.clone(),
            });
        }

        for node in &device.nodes {
            let at = || format!("{}.{}", device.name, node.name);

            if let PortConfig::Serial { settings, .. } = &node.port {
                if settings.baud_rate == 0 {
                    return Err(Error::BadConfig(format!(
                        "{}: baud rate must be positive",
                        at()
                    )));
                }
            }

            if node.web_links.contains(&WebLink::Ssh) && node.ssh.is_none() {
                return Err(Error::BadConfig(format!(
                    "{}: has an SSH web link but no SSH block",
                    at()
                )));
            }

            if let Some(port) = node.tcp_port.filter(|port| *port != 0) {
                if let Some(other) = pinned.insert(port, at()) {
                    return Err(Error::BadConfig(format!(
                        "TCP port {port} is used by both {other} and {}",
                        at()
                    )));
                }
            }
        }
    }

    Ok(())
}
