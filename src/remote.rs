//! Peer gateways whose devices are shown alongside ours.

use parking_lot::Mutex;

use crate::{
    config::{DeviceRewrite, RemoteConfig},
    device::{DeviceSnapshot, RemoteInfo},
};

/// A peer gateway.
///
/// Keeps the device list last fetched from the peer.
/// Fetching is up to whoever talks to the peer.
#[derive(Debug)]
pub struct Remote {
    name: String,
    url: String,
    rewrite: DeviceRewrite,
    devices: Mutex<Vec<DeviceSnapshot>>,
}

impl From<&RemoteConfig> for Remote {
    fn from(config: &RemoteConfig) -> Self {
        Self::new(&config.name, &config.url, config.rewrite.clone())
    }
}

impl Remote {
    /// A peer with nothing fetched yet.
    pub fn new(name: &str, url: &str, rewrite: DeviceRewrite) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            rewrite,
            devices: Mutex::new(vec![]),
        }
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the peer is.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Make a snapshot from the peer presentable here.
    ///
    /// The configured rewrites are only applied if `apply_config_rewrites` is set,
    /// the snapshot is always marked as belonging to this peer.
    pub fn rewrite_device(
        &self,
        mut snapshot: DeviceSnapshot,
        apply_config_rewrites: bool,
    ) -> DeviceSnapshot {
        if apply_config_rewrites {
            if let Some(prefix) = &self.rewrite.name_prefix {
                snapshot.name = format!("{prefix}{}", snapshot.name);
            }
            if let Some(category) = &self.rewrite.category {
                snapshot.category = Some(category.clone());
            }
            for tag in &self.rewrite.add_tags {
                if !snapshot.tags.iter().any(|known| known.name == tag.name) {
                    snapshot.tags.push(tag.clone());
                }
            }
        }

        snapshot.remote_info = Some(RemoteInfo {
            name: self.name.clone(),
            url: self.url.clone(),
        });
        snapshot
    }

    /// Store what the peer reported.
    pub fn set_devices(&self, devices: Vec<DeviceSnapshot>) {
        *self.devices.lock() = devices;
    }

    /// What the peer last reported, rewritten.
    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.devices
            .lock()
            .iter()
            .cloned()
            .map(|device| self.rewrite_device(device, true))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::Tag;

    fn snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            id: "bench-1".into(),
            name: "Bench 1".into(),
            description: None,
            category: Some("boards".into()),
            tags: vec![Tag::new("arm")],
            nodes: vec![],
            web_connections: vec![],
            build: None,
            jenkins_lock_name: None,
            jenkins_lock_owner: None,
            alive: true,
            ephemeral: false,
            remote_info: None,
        }
    }

    fn remote() -> Remote {
        Remote::new(
            "lab-2",
            "http://lab-2:8080",
            DeviceRewrite {
                name_prefix: Some("lab-2/".into()),
                category: Some("remote".into()),
                add_tags: vec![Tag::new("arm"), Tag::new("remote")],
            },
        )
    }

    #[test]
    fn rewrites_are_optional() {
        let remote = remote();

        let plain = remote.rewrite_device(snapshot(), false);
        assert_eq!(plain.name, "Bench 1");
        assert_eq!(
            plain.remote_info,
            Some(RemoteInfo {
                name: "lab-2".into(),
                url: "http://lab-2:8080".into(),
            })
        );

        let rewritten = remote.rewrite_device(snapshot(), true);
        assert_eq!(rewritten.name, "lab-2/Bench 1");
        assert_eq!(rewritten.category.as_deref(), Some("remote"));
        assert_eq!(rewritten.tags, vec![Tag::new("arm"), Tag::new("remote")]);
        assert!(rewritten.remote_info.is_some());
    }

    #[test]
    fn stored_devices_come_back_rewritten() {
        let remote = remote();
        assert!(remote.devices().is_empty());

        remote.set_devices(vec![snapshot()]);
        let devices = remote.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "lab-2/Bench 1");
    }
}
