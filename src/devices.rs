//! The live registry of devices, and reloading it from new configuration.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::{validate_devices, DeviceConfig, NodeConfig, PortConfig, Tag},
    context::Context,
    device::{Device, DeviceEvent, DeviceSnapshot, EPHEMERAL_GRACE},
    error::Error,
    events::Publisher,
    id::{slugify, IdGenerator},
};

/// Changes to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicesEvent {
    /// A device with this id appeared.
    Added(String),
    /// The device with this id is gone.
    Removed(String),
    /// The device with this id was rebuilt from new configuration.
    Replaced(String),
}

/// What a reload does to an existing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChange {
    /// Rebuild it from its new configuration, keeping its id.
    Update,
    /// Remove it.
    Remove,
}

/// What a reload would do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSpec {
    /// Names of devices to create, in configuration order.
    pub add: Vec<String>,
    /// Existing devices to change, by id.
    pub change: BTreeMap<String, DeviceChange>,
}

impl ReloadSpec {
    /// True if the reload would do nothing.
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.change.is_empty()
    }
}

/// How much of a reload to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadScope {
    /// Whatever it takes to match the new configuration.
    All,
    /// Only what was planned earlier.
    Planned(ReloadSpec),
}

/// A node of a device created on request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralNode {
    /// Node name.
    pub name: String,
    /// Port clients connect to. Any free port if not given.
    #[serde(default)]
    pub tcp_port: Option<u16>,
}

/// A request for a device which lives only while it is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralRequest {
    /// Display name.
    pub name: String,
    /// Longer description.
    #[serde(default)]
    pub description: Option<String>,
    /// Grouping.
    #[serde(default)]
    pub category: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Nodes. Each gets a line provided by a companion process.
    pub nodes: Vec<EphemeralNode>,
}

impl From<EphemeralRequest> for DeviceConfig {
    fn from(request: EphemeralRequest) -> Self {
        let nodes = request
            .nodes
            .into_iter()
            .map(|node| NodeConfig {
                tcp_port: node.tcp_port,
                ..NodeConfig::with_port(&node.name, PortConfig::RemoteIo { port: None })
            })
            .collect();

        DeviceConfig {
            description: request.description,
            category: request.category,
            tags: request.tags,
            ..DeviceConfig::new(&request.name, nodes)
        }
    }
}

/// All devices.
#[derive(Debug)]
pub struct Devices {
    context: Context,
    ids: Mutex<IdGenerator>,
    devices: RwLock<Vec<Arc<Device>>>,
    events: Publisher<DevicesEvent>,
    ephemeral_grace: Duration,
}

impl Devices {
    /// An empty registry.
    pub fn new(context: Context) -> Self {
        Self {
            context,
            ids: Mutex::new(IdGenerator::default()),
            devices: RwLock::new(vec![]),
            events: Publisher::default(),
            ephemeral_grace: EPHEMERAL_GRACE,
        }
    }

    /// Change how long ephemeral devices are kept before they are checked for use.
    pub fn with_ephemeral_grace(mut self, grace: Duration) -> Self {
        self.ephemeral_grace = grace;
        self
    }

    /// The collaborators devices are built with.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Receive registry changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DevicesEvent> {
        self.events.subscribe()
    }

    /// Every device, in order.
    pub fn list(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    /// Every device as shown to clients.
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.list().iter().map(|device| device.snapshot()).collect()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// True if there are no devices.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// The device with this id.
    pub fn get(&self, id: &str) -> Result<Arc<Device>, Error> {
        self.find(|device| device.id() == id)
            .ok_or_else(|| Error::NoSuchDevice(id.into()))
    }

    /// The first device matching `predicate`.
    pub fn find(&self, predicate: impl Fn(&Device) -> bool) -> Option<Arc<Device>> {
        self.devices
            .read()
            .iter()
            .find(|device| predicate(device))
            .cloned()
    }

    fn check_name_free(&self, name: &str) -> Result<(), Error> {
        match self.find(|device| device.name() == name) {
            Some(_) => Err(Error::DuplicateDevice(name.into())),
            None => Ok(()),
        }
    }

    fn build(
        &self,
        config: DeviceConfig,
        make: impl FnOnce(&str, DeviceConfig) -> Result<Arc<Device>, Error>,
    ) -> Result<Arc<Device>, Error> {
        self.check_name_free(&config.name)?;
        let id = self.ids.lock().gen(Some(&slugify(&config.name)))?;

        let device = match make(&id, config) {
            Ok(device) => device,
            Err(e) => {
                self.ids.lock().release(&id);
                return Err(e);
            }
        };

        self.devices.write().push(device.clone());
        info!(%id, name = %device.name(), "Device added");
        self.events.publish(DevicesEvent::Added(id));

        Ok(device)
    }

    /// Add a device. It is not opened.
    pub fn add(&self, config: DeviceConfig) -> Result<Arc<Device>, Error> {
        self.build(config, |id, config| Device::new(id, config, &self.context))
    }

    /// Create and open a device on request.
    ///
    /// It is removed from the registry once it kills itself for lack of open nodes.
    pub fn create_ephemeral(self: &Arc<Self>, request: EphemeralRequest) -> Result<Arc<Device>, Error> {
        let grace = self.ephemeral_grace;
        let device = self.build(request.into(), |id, config| {
            Device::new_ephemeral(id, config, &self.context, grace)
        })?;

        tokio::spawn(
            reap(
                Arc::downgrade(self),
                Arc::downgrade(&device),
                device.subscribe(),
            )
            .instrument(info_span!("reaper", id = %device.id())),
        );

        device.open()?;
        Ok(device)
    }

    fn take(&self, predicate: impl Fn(&Arc<Device>) -> bool) -> Option<Arc<Device>> {
        let mut devices = self.devices.write();
        let index = devices.iter().position(predicate)?;
        Some(devices.remove(index))
    }

    fn retire(&self, device: &Arc<Device>) {
        self.ids.lock().release(device.id());
        device.kill();
        info!(id = %device.id(), "Device removed");
        self.events
            .publish(DevicesEvent::Removed(device.id().into()));
    }

    /// Remove a device, killing it and releasing its id.
    pub fn remove(&self, id: &str) -> Result<Arc<Device>, Error> {
        let device = self
            .take(|device| device.id() == id)
            .ok_or_else(|| Error::NoSuchDevice(id.into()))?;

        self.retire(&device);
        Ok(device)
    }

    /// Remove the device at `index`.
    pub fn remove_at(&self, index: usize) -> Result<Arc<Device>, Error> {
        let device = {
            let mut devices = self.devices.write();
            if index >= devices.len() {
                return Err(Error::NoSuchDevice(format!("#{index}")));
            }
            devices.remove(index)
        };

        self.retire(&device);
        Ok(device)
    }

    /// Work out what [`Devices::apply_reload`] would do to match `configs`.
    ///
    /// Ephemeral devices are left out.
    pub fn plan_reload(&self, configs: &[DeviceConfig]) -> ReloadSpec {
        let devices = self.list();
        let configured: Vec<_> = devices
            .iter()
            .filter(|device| !device.is_ephemeral())
            .collect();

        let mut spec = ReloadSpec::default();

        for device in &configured {
            match configs.iter().find(|config| config.name == device.name()) {
                None => {
                    spec.change.insert(device.id().into(), DeviceChange::Remove);
                }
                Some(config) if !device.matches_config(config) => {
                    spec.change.insert(device.id().into(), DeviceChange::Update);
                }
                Some(_) => {}
            }
        }

        let known: BTreeSet<_> = configured.iter().map(|device| device.name()).collect();
        spec.add = configs
            .iter()
            .filter(|config| !known.contains(config.name.as_str()))
            .map(|config| config.name.clone())
            .collect();
        self.skip_ephemeral_names(&mut spec);

        spec
    }

    /// Configured names held by a live ephemeral device wait until it is gone.
    fn skip_ephemeral_names(&self, spec: &mut ReloadSpec) {
        spec.add.retain(|name| {
            let held = self
                .find(|device| device.is_ephemeral() && device.name() == name)
                .map(|device| device.id().to_string());

            if let Some(id) = &held {
                warn!(%name, %id, "Configured device name is held by an ephemeral device, not adding it");
            }
            held.is_none()
        });
    }

    fn check_reload(&self, configs: &[DeviceConfig], spec: &ReloadSpec) -> Result<(), Error> {
        validate_devices(configs)?;

        let config_named = |name: &str| {
            configs
                .iter()
                .find(|config| config.name == name)
                .ok_or_else(|| Error::BadUsage(format!("No configuration for device `{name}`")))
        };

        for (id, change) in &spec.change {
            let device = self
                .get(id)
                .ok()
                .filter(|device| !device.is_ephemeral())
                .ok_or_else(|| Error::NoSuchDevice(id.clone()))?;

            if *change == DeviceChange::Update {
                config_named(device.name())?;
            }
        }

        for name in &spec.add {
            config_named(name)?;

            let clash = self.find(|device| {
                !device.is_ephemeral()
                    && device.name() == name
                    && spec.change.get(device.id()) != Some(&DeviceChange::Remove)
            });
            if clash.is_some() {
                return Err(Error::DuplicateDevice(name.clone()));
            }
        }

        Ok(())
    }

    /// Change the registry to match `configs`.
    ///
    /// Removed devices are killed. Updated devices are rebuilt under the same id,
    /// taking over the browser sessions and build of the old device, which is killed
    /// before the new one opens. Added devices get fresh ids.
    /// Nothing is changed if the reload is not possible.
    ///
    /// Returns what was done.
    pub async fn apply_reload(
        &self,
        configs: &[DeviceConfig],
        scope: ReloadScope,
    ) -> Result<ReloadSpec, Error> {
        let mut spec = match scope {
            ReloadScope::All => self.plan_reload(configs),
            ReloadScope::Planned(spec) => spec,
        };
        self.skip_ephemeral_names(&mut spec);
        self.check_reload(configs, &spec)?;

        if spec.is_empty() {
            debug!("Nothing to reload");
            return Ok(spec);
        }
        info!(add = ?spec.add, change = ?spec.change, "Reloading devices");

        for (id, _) in spec
            .change
            .iter()
            .filter(|(_, change)| **change == DeviceChange::Remove)
        {
            let removed = self.remove(id)?;
            removed.released().await;
        }

        for (id, _) in spec
            .change
            .iter()
            .filter(|(_, change)| **change == DeviceChange::Update)
        {
            self.replace(id, configs).await?;
        }

        for name in &spec.add {
            let config = configs
                .iter()
                .find(|config| config.name == *name)
                .cloned()
                .ok_or_else(|| Error::BadUsage(format!("No configuration for device `{name}`")))?;

            let device = self.add(config)?;
            if let Err(e) = device.open() {
                warn!(%e, id = %device.id(), "Could not open device");
            }
        }

        Ok(spec)
    }

    async fn replace(&self, id: &str, configs: &[DeviceConfig]) -> Result<(), Error> {
        let old = self.get(id)?;
        let config = configs
            .iter()
            .find(|config| config.name == old.name())
            .cloned()
            .ok_or_else(|| Error::BadUsage(format!("No configuration for device `{}`", old.name())))?;

        let new = Device::new(id, config, &self.context)?;
        new.copy_runtime_data(&old);

        old.kill();
        old.released().await;

        {
            let mut devices = self.devices.write();
            match devices.iter_mut().find(|device| device.id() == id) {
                Some(slot) => *slot = new.clone(),
                None => devices.push(new.clone()),
            }
        }

        if let Err(e) = new.open() {
            warn!(%e, %id, "Could not open replaced device");
        }

        info!(%id, "Device replaced");
        self.events.publish(DevicesEvent::Replaced(id.into()));
        Ok(())
    }

    /// Kill every device and forget them.
    pub fn clear(&self) {
        let devices = std::mem::take(&mut *self.devices.write());
        for device in &devices {
            self.retire(device);
        }
    }
}

/// Remove an ephemeral device from the registry once it has killed itself.
async fn reap(
    devices: Weak<Devices>,
    device: Weak<Device>,
    mut events: broadcast::Receiver<DeviceEvent>,
) {
    loop {
        match events.recv().await {
            Ok(DeviceEvent::Killed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => debug!("Reaper lagged, skipped {n} event(s)"),
            Err(RecvError::Closed) => return,
        }
    }

    let Some(devices) = devices.upgrade() else {
        return;
    };

    if let Some(device) = devices.take(|candidate| Weak::ptr_eq(&Arc::downgrade(candidate), &device)) {
        info!(id = %device.id(), "Reaping ephemeral device");
        devices.retire(&device);
    }
}
