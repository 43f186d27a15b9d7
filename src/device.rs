//! A device: a named group of nodes with build and lock status,
//! and a mutex serializing its commands.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, time::Instant};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    command::{CommandProgress, MarkerCaps, ModalRow},
    config::{DeviceConfig, Tag},
    connections::{Connection, Connections},
    context::Context,
    error::Error,
    events::Publisher,
    lock::{LockAction, LockCredentials},
    node::{Node, NodeEvent, NodeSnapshot},
    port::{PortState, TransportExt},
};

/// Builds an external system runs on a device.
pub mod build;

use build::{Build, BuildOp, BuildSnapshot};

/// How long an ephemeral device lives even if none of its nodes are open.
pub const EPHEMERAL_GRACE: Duration = Duration::from_secs(10);

/// Things happening on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DeviceEvent {
    /// Something shown in the device snapshot changed.
    Updated,

    /// Progress of a command.
    Command(CommandProgress),

    /// A command asked terminals to draw a marker line.
    TermLine {
        /// Text of the marker.
        label: String,
        /// Which end of a section the marker is, if any.
        caps: Option<MarkerCaps>,
    },

    /// A command wants a dialog shown.
    CommandModal {
        /// The session which started the command.
        to: Option<String>,
        /// Dialog title.
        title: String,
        /// Dialog contents.
        rows: Vec<ModalRow>,
    },

    /// The device is gone.
    Killed,
}

/// Where a device shown locally actually lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    /// Name of the peer gateway.
    pub name: String,
    /// Where the peer gateway is.
    pub url: String,
}

/// A device as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Stable id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Longer description.
    pub description: Option<String>,
    /// Grouping.
    pub category: Option<String>,
    /// Tags.
    pub tags: Vec<Tag>,
    /// Nodes in order.
    pub nodes: Vec<NodeSnapshot>,
    /// Who is looking at the device in a browser.
    pub web_connections: Vec<Connection>,
    /// The build in progress.
    pub build: Option<BuildSnapshot>,
    /// Name of the external lock.
    pub jenkins_lock_name: Option<String>,
    /// Who holds the external lock, as last reported.
    pub jenkins_lock_owner: Option<String>,
    /// False once killed.
    pub alive: bool,
    /// Created on request rather than from configuration.
    pub ephemeral: bool,
    /// Set for devices of peer gateways.
    pub remote_info: Option<RemoteInfo>,
}

#[derive(Debug, Clone, Copy)]
struct Ephemeral {
    created: Instant,
    grace: Duration,
}

/// A group of nodes.
pub struct Device {
    id: String,
    config: DeviceConfig,
    nodes: Vec<Arc<Node>>,

    web_connections: Connections,
    command_mutex: tokio::sync::Mutex<()>,

    build: Mutex<Option<Build>>,
    lock_owner: Mutex<Option<String>>,

    alive: AtomicBool,
    ephemeral: Option<Ephemeral>,

    events: Publisher<DeviceEvent>,
    context: Context,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("nodes", &self.nodes)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Device {
    /// Build a device and its nodes from configuration. Nothing is opened yet.
    pub fn new(id: &str, config: DeviceConfig, context: &Context) -> Result<Arc<Self>, Error> {
        Self::from_config(id, config, context, None)
    }

    /// Build a device which kills itself once none of its nodes are open,
    /// but not before `grace` has passed.
    pub fn new_ephemeral(
        id: &str,
        config: DeviceConfig,
        context: &Context,
        grace: Duration,
    ) -> Result<Arc<Self>, Error> {
        let ephemeral = Ephemeral {
            created: Instant::now(),
            grace,
        };
        Self::from_config(id, config, context, Some(ephemeral))
    }

    fn from_config(
        id: &str,
        config: DeviceConfig,
        context: &Context,
        ephemeral: Option<Ephemeral>,
    ) -> Result<Arc<Self>, Error> {
        let nodes = config
            .nodes
            .iter()
            .map(|node| Node::new(id, node.clone(), context))
            .collect();

        Self::assemble(id, config, nodes, context, ephemeral)
    }

    /// Build a device around nodes which already exist.
    ///
    /// Every node must have been made for the device `id`.
    /// The node list of `config` is replaced by the nodes' own configuration.
    pub fn from_nodes(
        id: &str,
        config: DeviceConfig,
        nodes: Vec<Arc<Node>>,
        context: &Context,
    ) -> Result<Arc<Self>, Error> {
        Self::assemble(id, config, nodes, context, None)
    }

    fn assemble(
        id: &str,
        mut config: DeviceConfig,
        nodes: Vec<Arc<Node>>,
        context: &Context,
        ephemeral: Option<Ephemeral>,
    ) -> Result<Arc<Self>, Error> {
        if let Some(node) = nodes.iter().find(|node| node.device_id() != id) {
            return Err(Error::NodeDeviceMismatch {
                node: node.name().into(),
                owner: node.device_id().into(),
                device: id.into(),
            });
        }

        config.nodes = nodes.iter().map(|node| node.config().clone()).collect();
        crate::config::validate_devices(std::slice::from_ref(&config))?;

        let web_connections = Connections::new(context.users.clone());

        let node_events: Vec<_> = nodes.iter().map(|node| node.subscribe()).collect();
        let web_events = web_connections.subscribe();

        let device = Arc::new(Self {
            id: id.into(),
            nodes,
            web_connections,
            command_mutex: tokio::sync::Mutex::new(()),
            build: Mutex::new(None),
            lock_owner: Mutex::new(None),
            alive: AtomicBool::new(true),
            ephemeral,
            events: Publisher::default(),
            context: context.clone(),
            cancel: CancellationToken::new(),
            config,
        });

        tokio::spawn(
            watch(
                Arc::downgrade(&device),
                node_events,
                web_events,
                device.cancel.clone(),
            )
            .instrument(info_span!("device", id = %device.id)),
        );

        Ok(device)
    }

    /// Stable id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The static configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The nodes, in order.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// The node called `name`.
    pub fn node(&self, name: &str) -> Result<&Arc<Node>, Error> {
        self.nodes
            .iter()
            .find(|node| node.name() == name)
            .ok_or_else(|| Error::NoSuchNode {
                device: self.config.name.clone(),
                node: name.into(),
            })
    }

    /// Browser sessions looking at this device.
    pub fn web_connections(&self) -> &Connections {
        &self.web_connections
    }

    /// False once killed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Created on request rather than from configuration.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral.is_some()
    }

    /// Receive device events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: DeviceEvent) {
        self.events.publish(event);
    }

    pub(crate) fn command_mutex(&self) -> &tokio::sync::Mutex<()> {
        &self.command_mutex
    }

    /// Open every node.
    pub fn open(&self) -> Result<(), Error> {
        if !self.is_alive() {
            return Err(Error::DeviceDead(self.config.name.clone()));
        }

        for node in &self.nodes {
            node.open()?;
        }

        Ok(())
    }

    /// Make the device inert: every node is shut down and its clients detached.
    /// Calling it again does nothing.
    pub fn kill(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(id = %self.id, "Killing device");

        for node in &self.nodes {
            node.shutdown("Device removed");
        }

        self.events.publish(DeviceEvent::Updated);
        self.events.publish(DeviceEvent::Killed);
        self.cancel.cancel();
    }

    /// Wait until the listening sockets of every node are gone, e.g. after [`Device::kill`].
    pub async fn released(&self) {
        for node in &self.nodes {
            node.released().await;
        }
    }

    /// The build in progress.
    pub fn build(&self) -> Option<BuildSnapshot> {
        self.build.lock().as_ref().map(Build::snapshot)
    }

    /// Start a build, replacing any build in progress.
    pub fn start_build(&self, name: &str, link: Option<String>, external: bool) -> BuildSnapshot {
        let build = Build::new(&self.config.name, name, link, external);
        let snapshot = build.snapshot();

        if let Some(old) = self.build.lock().replace(build) {
            debug!(old = %old.name(), "Replacing build");
        }
        info!(device = %self.config.name, build = %name, "Build started");

        self.events.publish(DeviceEvent::Updated);
        snapshot
    }

    /// Detach the build in progress, marking it ended.
    pub fn end_build(&self) -> Option<Build> {
        let mut build = self.build.lock().take()?;
        build.end();

        info!(device = %self.config.name, build = %build.name(), result = ?build.result(), "Build ended");
        self.events.publish(DeviceEvent::Updated);

        Some(build)
    }

    /// Change the build in progress.
    ///
    /// A [`BuildOp::Result`] ends the build. Returns the build as it is after the change.
    pub fn build_op(&self, op: &BuildOp) -> Result<BuildSnapshot, Error> {
        let no_build = || Error::NoBuild(self.config.name.clone());

        if let BuildOp::Result(result) = op {
            self.build.lock().as_mut().ok_or_else(no_build)?.set_result(*result);
            return self
                .end_build()
                .map(|build| build.snapshot())
                .ok_or_else(no_build);
        }

        let snapshot = {
            let mut build = self.build.lock();
            let build = build.as_mut().ok_or_else(no_build)?;
            build.apply(op);
            build.snapshot()
        };

        self.events.publish(DeviceEvent::Updated);
        Ok(snapshot)
    }

    /// Name of the external lock.
    pub fn jenkins_lock_name(&self) -> Option<&str> {
        self.config.jenkins_lock.as_deref()
    }

    /// Who holds the external lock, as last reported.
    pub fn jenkins_lock_owner(&self) -> Option<String> {
        self.lock_owner.lock().clone()
    }

    /// Record who holds the external lock.
    /// Always raises [`DeviceEvent::Updated`], since it is the result of a poll.
    pub fn set_jenkins_lock_owner(&self, owner: Option<String>) {
        *self.lock_owner.lock() = owner;
        self.events.publish(DeviceEvent::Updated);
    }

    /// Perform an action on the external lock and record the resulting owner.
    pub async fn jenkins_lock_action(
        &self,
        action: LockAction,
        credentials: &LockCredentials,
    ) -> Result<Option<String>, Error> {
        let lock = self
            .jenkins_lock_name()
            .ok_or_else(|| Error::NoLock(self.config.name.clone()))?;

        let owner = self.context.locks.perform(lock, action, credentials).await?;
        self.set_jenkins_lock_owner(owner.clone());

        Ok(owner)
    }

    /// Take the external lock.
    pub async fn reserve_in_jenkins(
        &self,
        credentials: &LockCredentials,
    ) -> Result<Option<String>, Error> {
        self.jenkins_lock_action(LockAction::Reserve, credentials)
            .await
    }

    /// Give the external lock back.
    pub async fn unreserve_in_jenkins(
        &self,
        credentials: &LockCredentials,
    ) -> Result<Option<String>, Error> {
        self.jenkins_lock_action(LockAction::Unreserve, credentials)
            .await
    }

    /// True if this device would be built the same from `config`.
    ///
    /// Nodes are compared in order, tags as a set.
    pub fn matches_config(&self, config: &DeviceConfig) -> bool {
        let ours = &self.config;

        let tags = |tags: &[Tag]| tags.iter().cloned().collect::<BTreeSet<_>>();

        ours.name == config.name
            && ours.description == config.description
            && ours.category == config.category
            && ours.jenkins_lock == config.jenkins_lock
            && tags(&ours.tags) == tags(&config.tags)
            && self.nodes.len() == config.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&config.nodes)
                .all(|(node, config)| node.matches_config(config))
    }

    /// Take over what observers of `old` see: its browser sessions,
    /// the build in progress and the lock owner.
    pub fn copy_runtime_data(&self, old: &Device) {
        self.web_connections.transplant_from(&old.web_connections);
        *self.build.lock() = old.build.lock().clone();
        *self.lock_owner.lock() = old.lock_owner.lock().clone();

        self.events.publish(DeviceEvent::Updated);
    }

    /// The device as shown to clients.
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id.clone(),
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            category: self.config.category.clone(),
            tags: self.config.tags.clone(),
            nodes: self.nodes.iter().map(|node| node.snapshot()).collect(),
            web_connections: self.web_connections.list(),
            build: self.build(),
            jenkins_lock_name: self.config.jenkins_lock.clone(),
            jenkins_lock_owner: self.jenkins_lock_owner(),
            alive: self.is_alive(),
            ephemeral: self.is_ephemeral(),
            remote_info: None,
        }
    }

    /// Kill an ephemeral device past its grace period if none of its nodes are open.
    fn check_liveness(&self) {
        let Some(ephemeral) = self.ephemeral else {
            return;
        };

        if ephemeral.created.elapsed() < ephemeral.grace {
            return;
        }

        if self.nodes.iter().any(|node| node.port().is_open()) {
            return;
        }

        info!(id = %self.id, "No node open anymore");
        self.kill();
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Watched {
    Node(NodeEvent),
    Web,
    Lagged(u64),
}

fn watched<T>(item: Result<T, BroadcastStreamRecvError>, f: impl FnOnce(T) -> Watched) -> Watched {
    match item {
        Ok(item) => f(item),
        Err(BroadcastStreamRecvError::Lagged(n)) => Watched::Lagged(n),
    }
}

/// Turn node and connection events into device updates.
async fn watch(
    device: Weak<Device>,
    node_events: Vec<broadcast::Receiver<NodeEvent>>,
    web_events: broadcast::Receiver<crate::connections::ConnectionEvent>,
    cancel: CancellationToken,
) {
    let nodes = futures::stream::select_all(
        node_events
            .into_iter()
            .map(|events| BroadcastStream::new(events).map(|item| watched(item, Watched::Node))),
    );
    let web = BroadcastStream::new(web_events).map(|item| watched(item, |_| Watched::Web));

    let mut events = futures::stream::select(nodes, web);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(device) = device.upgrade() else { break };

        match event {
            Watched::Node(NodeEvent::SerialStateChanged(state)) => {
                device.events.publish(DeviceEvent::Updated);
                if matches!(state, PortState::Closed { .. }) {
                    device.check_liveness();
                }
            }
            Watched::Node(NodeEvent::TcpConnect(_) | NodeEvent::TcpDisconnect(_)) | Watched::Web => {
                device.events.publish(DeviceEvent::Updated)
            }
            Watched::Node(NodeEvent::SerialData(_) | NodeEvent::WriteCollision { .. }) => {}
            Watched::Lagged(n) => warn!("Device watcher lagged, skipped {n} event(s)"),
        }
    }

    debug!("Stopped watching device");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::{NodeConfig, PortConfig},
        lock::MemoryLocks,
        port::{driver::MemoryDriver, Transport},
    };

    fn context() -> Context {
        Context::new(Arc::new(MemoryDriver::default()))
    }

    fn bench(nodes: &[&str]) -> DeviceConfig {
        DeviceConfig::new(
            "bench-1",
            nodes
                .iter()
                .map(|name| NodeConfig::mock(name, false))
                .collect(),
        )
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<DeviceEvent>,
        wanted: impl Fn(&DeviceEvent) -> bool,
    ) -> DeviceEvent {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn smoke_test_build() {
        let device = Device::new("bench-1", bench(&["console"]), &context()).unwrap();

        device.start_build("smoke-test", None, false);
        device.build_op(&BuildOp::PushStage("boot".into())).unwrap();
        let snapshot = device.build_op(&BuildOp::PushTask("flash".into())).unwrap();
        assert_eq!(snapshot.stage.unwrap().name, "boot");
        assert_eq!(snapshot.task.unwrap().name, "flash");

        device.build_op(&BuildOp::PopTask).unwrap();
        device.build_op(&BuildOp::PopStage).unwrap();
        let last = device.build_op(&BuildOp::Result(true)).unwrap();

        assert_eq!(last.result, Some(true));
        assert_eq!(last.stage, None);
        assert_eq!(last.task, None);
        assert!(last.ended);
        assert_eq!(device.build(), None);
    }

    #[tokio::test]
    async fn build_ops_need_a_build() {
        let device = Device::new("bench-1", bench(&["console"]), &context()).unwrap();

        assert_eq!(
            device.build_op(&BuildOp::PopStage),
            Err(Error::NoBuild("bench-1".into()))
        );
        assert_eq!(
            device.build_op(&BuildOp::Result(false)),
            Err(Error::NoBuild("bench-1".into()))
        );
        assert!(device.end_build().is_none());
    }

    #[tokio::test]
    async fn starting_a_build_replaces_the_old_one() {
        let device = Device::new("bench-1", bench(&["console"]), &context()).unwrap();

        device.start_build("first", None, false);
        device.build_op(&BuildOp::PushStage("boot".into())).unwrap();
        device.start_build("second", Some("http://ci/2".into()), true);

        let build = device.build().unwrap();
        assert_eq!(build.name, "second");
        assert_eq!(build.stage, None);
        assert!(build.external);
        assert_eq!(build.device, "bench-1");
    }

    #[tokio::test]
    async fn lock_owner_always_updates() {
        let device = Device::new("bench-1", bench(&["console"]), &context()).unwrap();
        let mut events = device.subscribe();

        device.set_jenkins_lock_owner(Some("ann".into()));
        device.set_jenkins_lock_owner(Some("ann".into()));

        assert_eq!(events.recv().await.unwrap(), DeviceEvent::Updated);
        assert_eq!(events.recv().await.unwrap(), DeviceEvent::Updated);
        assert_eq!(device.jenkins_lock_owner().as_deref(), Some("ann"));
    }

    #[tokio::test]
    async fn lock_actions() {
        let credentials = LockCredentials {
            username: "ann".into(),
            api_key: "key".into(),
        };

        let device = Device::new("bench-1", bench(&["console"]), &context()).unwrap();
        assert_eq!(
            device.reserve_in_jenkins(&credentials).await,
            Err(Error::NoLock("bench-1".into()))
        );

        let locks = Arc::new(MemoryLocks::default());
        let context = context().with_locks(locks.clone());
        let config = DeviceConfig {
            jenkins_lock: Some("bench-lock".into()),
            ..bench(&["console"])
        };
        let device = Device::new("bench-1", config, &context).unwrap();

        assert_eq!(
            device.reserve_in_jenkins(&credentials).await,
            Ok(Some("ann".into()))
        );
        assert_eq!(locks.owner("bench-lock").as_deref(), Some("ann"));
        assert_eq!(device.jenkins_lock_owner().as_deref(), Some("ann"));

        device.unreserve_in_jenkins(&credentials).await.unwrap();
        assert_eq!(device.jenkins_lock_owner(), None);
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let device = Device::new("bench-1", bench(&["console", "debug"]), &context()).unwrap();
        device.open().unwrap();
        let mut events = device.subscribe();

        device.kill();
        device.kill();

        assert!(!device.is_alive());
        for node in device.nodes() {
            assert!(!node.port().is_open());
        }
        next_matching(&mut events, |event| *event == DeviceEvent::Killed).await;
        assert_eq!(device.open(), Err(Error::DeviceDead("bench-1".into())));

        // Only one kill was announced.
        while let Ok(event) = events.try_recv() {
            assert_ne!(event, DeviceEvent::Killed);
        }
    }

    #[tokio::test]
    async fn config_match() {
        let tag = |name: &str| Tag::new(name);
        let config = DeviceConfig {
            tags: vec![tag("a"), tag("b")],
            ..bench(&["console", "debug"])
        };
        let device = Device::new("bench-1", config.clone(), &context()).unwrap();

        assert!(device.matches_config(&config));

        let reordered_tags = DeviceConfig {
            tags: vec![tag("b"), tag("a")],
            ..config.clone()
        };
        assert!(device.matches_config(&reordered_tags));

        let reordered_nodes = DeviceConfig {
            nodes: config.nodes.iter().rev().cloned().collect(),
            ..config.clone()
        };
        assert!(!device.matches_config(&reordered_nodes));

        let mut changed_node = config.clone();
        changed_node.nodes[1].port = PortConfig::Mock { loopback: true };
        assert!(!device.matches_config(&changed_node));

        let described = DeviceConfig {
            description: Some("new".into()),
            ..config
        };
        assert!(!device.matches_config(&described));
    }

    #[tokio::test]
    async fn nodes_must_belong_to_the_device() {
        let context = context();
        let stray = Node::new("bench-2", NodeConfig::mock("console", false), &context);

        let err = Device::from_nodes("bench-1", bench(&[]), vec![stray], &context).unwrap_err();
        assert_eq!(
            err,
            Error::NodeDeviceMismatch {
                node: "console".into(),
                owner: "bench-2".into(),
                device: "bench-1".into(),
            }
        );
    }

    #[tokio::test]
    async fn duplicate_node_names_are_rejected() {
        let err = Device::new("bench-1", bench(&["a", "a"]), &context()).unwrap_err();
        assert!(matches!(err, Error::DuplicateNode { .. }));
    }

    #[tokio::test]
    async fn runtime_data_survives_replacement() {
        let context = context();
        let old = Device::new("bench-1", bench(&["console"]), &context).unwrap();
        old.web_connections().add("10.0.0.1").await;
        old.start_build("smoke-test", None, true);
        old.build_op(&BuildOp::PushStage("boot".into())).unwrap();
        old.set_jenkins_lock_owner(Some("ann".into()));

        let new = Device::new("bench-1", bench(&["console", "debug"]), &context).unwrap();
        new.copy_runtime_data(&old);

        let snapshot = new.snapshot();
        assert_eq!(snapshot.web_connections.len(), 1);
        assert_eq!(snapshot.web_connections[0].host, "10.0.0.1");
        assert_eq!(snapshot.build.unwrap().stage.unwrap().name, "boot");
        assert_eq!(snapshot.jenkins_lock_owner.as_deref(), Some("ann"));
        assert!(old.web_connections().is_empty());
    }

    #[tokio::test]
    async fn node_changes_update_the_device() {
        let device = Device::new("bench-1", bench(&["console"]), &context()).unwrap();
        let mut events = device.subscribe();

        device.open().unwrap();
        assert_eq!(events.recv().await.unwrap(), DeviceEvent::Updated);
    }

    #[tokio::test]
    async fn unknown_node() {
        let device = Device::new("bench-1", bench(&["console"]), &context()).unwrap();

        assert!(device.node("console").is_ok());
        assert_eq!(
            device.node("debug").unwrap_err(),
            Error::NoSuchNode {
                device: "bench-1".into(),
                node: "debug".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ephemeral_device_dies_when_idle_after_grace() {
        let config = DeviceConfig::new("tmp", vec![NodeConfig::mock("console", false)]);
        let device = Device::new_ephemeral("tmp", config, &context(), EPHEMERAL_GRACE).unwrap();
        let mut events = device.subscribe();
        device.open().unwrap();
        next_matching(&mut events, |event| *event == DeviceEvent::Updated).await;

        let mock = device.node("console").unwrap().port().as_mock().unwrap();

        // Within the grace period a close is tolerated.
        mock.fail("Unplugged");
        next_matching(&mut events, |event| *event == DeviceEvent::Updated).await;
        tokio::task::yield_now().await;
        assert!(device.is_alive());

        mock.open().unwrap();
        tokio::time::advance(EPHEMERAL_GRACE + Duration::from_secs(1)).await;

        mock.fail("Unplugged");
        next_matching(&mut events, |event| *event == DeviceEvent::Killed).await;
        assert!(!device.is_alive());
    }

    #[tokio::test]
    async fn event_json() {
        let json = serde_json::to_value(DeviceEvent::TermLine {
            label: "flash".into(),
            caps: Some(MarkerCaps::Start),
        })
        .unwrap();

        assert_eq!(
            json,
            serde_json::json!({"event": "termLine", "label": "flash", "caps": "start"})
        );
    }
}
