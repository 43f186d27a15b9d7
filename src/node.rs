//! A node: one line of a device, bridged to any number of TCP clients.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{broadcast, broadcast::error::RecvError, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    config::{Eol, NodeConfig, PortConfig, SshInfo, WebLink},
    connections::{Connection, ConnectionEvent, ConnectionId, Connections},
    context::Context,
    error::Error,
    events::Publisher,
    port::{
        tcp::Accepted, LinePort, MockPort, PortEvent, PortKind, PortState, RemoteIoPort,
        SerialPort, TcpListenerPort, Transport,
    },
    user::{host_of, User},
};

/// Detection of concurrent writers on a line.
pub mod collision;

use collision::RecentWriters;

/// Things happening on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Bytes came from the line.
    SerialData(Bytes),

    /// The line opened or closed.
    SerialStateChanged(PortState),

    /// A TCP client attached.
    TcpConnect(Connection),

    /// A TCP client went away.
    TcpDisconnect(Connection),

    /// Several hosts wrote to the line within a short window.
    WriteCollision {
        /// Everybody involved.
        users: Vec<User>,
    },
}

/// A node as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    /// Name within the device.
    pub name: String,

    /// Which kind of line.
    pub kind: PortKind,

    /// Serial path, for serial nodes.
    pub path: Option<String>,

    /// Line parameters, for serial nodes.
    pub settings: Option<crate::port::LineSettings>,

    /// The port clients connect to, once listening.
    pub tcp_port: Option<u16>,

    /// The port a remote-IO companion connects to, once listening.
    pub remote_io_port: Option<u16>,

    /// End-of-line convention.
    pub eol: Eol,

    /// Offered links.
    pub web_links: Vec<WebLink>,

    /// SSH details.
    pub ssh: Option<SshInfo>,

    /// Opaque metadata.
    pub metadata: Option<serde_json::Value>,

    /// Attached TCP clients.
    pub tcp_connections: Vec<Connection>,

    /// State of the line.
    pub state: PortState,
}

/// One bridged line.
///
/// Created in two steps: the transports are built first,
/// then the node wraps them and starts forwarding their events.
pub struct Node {
    device_id: String,
    config: NodeConfig,

    port: LinePort,
    tcp: TcpListenerPort,
    tcp_connections: Connections,
    writers: Mutex<RecentWriters>,

    events: Publisher<NodeEvent>,

    /// Bytes written by clients, tagged with who wrote them.
    fanout: broadcast::Sender<(ConnectionId, Bytes)>,

    context: Context,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("device_id", &self.device_id)
            .field("name", &self.config.name)
            .field("state", &self.port.state())
            .finish()
    }
}

fn line_port(config: &NodeConfig, context: &Context) -> LinePort {
    match &config.port {
        PortConfig::Serial { path, settings } => LinePort::Serial(SerialPort::new(
            path,
            settings.clone(),
            context.driver.clone(),
        )),
        PortConfig::RemoteIo { port } => LinePort::RemoteIo(RemoteIoPort::new(port.unwrap_or(0))),
        PortConfig::Mock { loopback } => LinePort::Mock(MockPort::new(&config.name, *loopback)),
    }
}

impl Node {
    /// Build a node belonging to the device `device_id`.
    /// Nothing is opened yet, see [`Node::open`].
    pub fn new(device_id: &str, config: NodeConfig, context: &Context) -> Arc<Self> {
        let port = line_port(&config, context);
        let (tcp, accepted) = TcpListenerPort::new(config.tcp_port.unwrap_or(0));

        let tcp_connections = Connections::new(context.users.clone());

        let port_events = port.subscribe();
        let connection_events = tcp_connections.subscribe();

        let node = Arc::new(Self {
            device_id: device_id.into(),
            tcp_connections,
            writers: Mutex::new(RecentWriters::default()),
            events: Publisher::default(),
            fanout: broadcast::channel(1024).0,
            context: context.clone(),
            shutdown: CancellationToken::new(),
            config,
            port,
            tcp,
        });

        let span = info_span!("node", device = %node.device_id, node = %node.config.name);

        tokio::spawn(
            forward_events(
                Arc::downgrade(&node),
                port_events,
                connection_events,
                node.shutdown.clone(),
            )
            .instrument(span.clone()),
        );
        tokio::spawn(
            accept_clients(Arc::downgrade(&node), accepted, node.shutdown.clone())
                .instrument(span),
        );

        node
    }

    /// The node's name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The id of the device this node belongs to.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The static configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The line.
    pub fn port(&self) -> &LinePort {
        &self.port
    }

    /// The listener clients connect to.
    pub fn tcp(&self) -> &TcpListenerPort {
        &self.tcp
    }

    /// The attached TCP clients.
    pub fn tcp_connections(&self) -> &Connections {
        &self.tcp_connections
    }

    /// Receive node events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// How many receivers of node events are alive.
    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    /// Open the line and start listening for clients.
    pub fn open(&self) -> Result<(), Error> {
        self.port.open()?;
        self.tcp.open()
    }

    /// Close the line and stop listening. Attached clients stay attached.
    pub fn close(&self, reason: Option<&str>) {
        self.port.close(reason);
        self.tcp.close(reason);
    }

    /// Close everything and detach all clients. The node is unusable afterwards.
    pub fn shutdown(&self, reason: &str) {
        info!(device = %self.device_id, node = %self.config.name, %reason, "Shutting down node");
        self.close(Some(reason));
        self.shutdown.cancel();
    }

    /// Wait until the listening sockets closed by the last [`Node::close`] are gone.
    pub async fn released(&self) {
        self.tcp.released().await;
        if let Some(remote_io) = self.port.as_remote_io() {
            remote_io.released().await;
        }
    }

    /// Write to the line.
    ///
    /// With a host, the write is tracked, and a [`NodeEvent::WriteCollision`] is raised
    /// if other hosts wrote recently. The write happens regardless.
    pub fn write(&self, bytes: Bytes, host: Option<&str>) -> Result<(), Error> {
        if let Some(host) = host {
            let contenders = self
                .writers
                .lock()
                .record(host, tokio::time::Instant::now());

            if let Some(hosts) = contenders {
                warn!(node = %self.config.name, ?hosts, "Write collision");
                let users = hosts
                    .iter()
                    .map(|host| self.context.users.cached_or_anonymous(host))
                    .collect();
                self.events.publish(NodeEvent::WriteCollision { users });
            }
        }

        self.port.write(bytes)
    }

    /// True if the static configuration equals `config`.
    /// Runtime state (connections, open or not) is not considered.
    pub fn matches_config(&self, config: &NodeConfig) -> bool {
        self.config == *config
    }

    /// The node as shown to clients.
    pub fn snapshot(&self) -> NodeSnapshot {
        let serial = self.port.as_serial();

        NodeSnapshot {
            name: self.config.name.clone(),
            kind: self.port.kind(),
            path: serial.map(|serial| serial.path().to_string()),
            settings: serial.map(SerialPort::settings),
            tcp_port: self.tcp.local_port(),
            remote_io_port: self.port.as_remote_io().and_then(RemoteIoPort::local_port),
            eol: self.config.eol,
            web_links: self.config.web_links.clone(),
            ssh: self.config.ssh.clone(),
            metadata: self.config.metadata.clone(),
            tcp_connections: self.tcp_connections.list(),
            state: self.port.state(),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn forward_events(
    node: Weak<Node>,
    mut port_events: broadcast::Receiver<PortEvent>,
    mut connection_events: broadcast::Receiver<ConnectionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,

            event = port_events.recv() => match event {
                Ok(PortEvent::Data(data)) => NodeEvent::SerialData(data),
                Ok(PortEvent::StateChanged(state)) => NodeEvent::SerialStateChanged(state),
                Ok(PortEvent::Listening(_)) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!("Node event forwarding lagged, skipped {n} port event(s)");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },

            event = connection_events.recv() => match event {
                Ok(ConnectionEvent::Connected(connection)) => NodeEvent::TcpConnect(connection),
                Ok(ConnectionEvent::Disconnected(connection)) => NodeEvent::TcpDisconnect(connection),
                Err(RecvError::Lagged(n)) => {
                    warn!("Node event forwarding lagged, skipped {n} connection event(s)");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let Some(node) = node.upgrade() else { break };
        node.events.publish(event);
    }

    debug!("Stopped forwarding node events");
}

async fn accept_clients(
    node: Weak<Node>,
    mut accepted: mpsc::UnboundedReceiver<Accepted>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            client = accepted.recv() => match client {
                Some(client) => client,
                None => break,
            },
        };

        let span = info_span!("client", %addr);
        tokio::spawn(bridge(node.clone(), stream, addr).instrument(span));
    }

    debug!("Stopped accepting clients");
}

/// Pump bytes between one client socket and the node until either side goes away.
async fn bridge(node: Weak<Node>, mut stream: TcpStream, addr: SocketAddr) {
    let host = host_of(&addr);

    let Some(this) = node.upgrade() else { return };

    if this.context.blacklist.contains(&host) {
        drop(this);
        info!(%host, "Refusing blacklisted host");

        let refusal = format!("Connection refused: {host} is blacklisted\r\n");
        if let Err(e) = stream.write_all(refusal.as_bytes()).await {
            debug!(?e, "Could not tell blacklisted host about refusal");
        }
        if let Err(e) = stream.shutdown().await {
            debug!(?e, "Could not shut down refused connection");
        }
        return;
    }

    // Subscribed before the connection is announced, so nothing is missed after.
    let shutdown = this.shutdown.clone();
    let mut port_events = this.port.subscribe();
    let mut fanout = this.fanout.subscribe();
    let connection = this.tcp_connections.add(&host).await;
    drop(this);

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        buf.reserve(1024);

        tokio::select! {
            _ = shutdown.cancelled() => break,

            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    let bytes = buf.split().freeze();
                    let Some(node) = node.upgrade() else { break };

                    match node.write(bytes.clone(), Some(&host)) {
                        Ok(()) => {
                            // No listeners is fine.
                            let _ = node.fanout.send((connection.id, bytes));
                        }
                        Err(e) => debug!(%e, "Dropping client bytes"),
                    }
                }
                Err(e) => {
                    debug!(?e, "Client read failed");
                    break;
                }
            },

            event = port_events.recv() => match event {
                Ok(PortEvent::Data(bytes)) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Client lagged, skipped {n} port event(s)"),
                Err(RecvError::Closed) => break,
            },

            written = fanout.recv() => match written {
                Ok((origin, bytes)) if origin != connection.id => {
                    trace!("Fanning out {} byte(s) from {origin}", bytes.len());
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Client lagged, skipped {n} written chunk(s)"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Some(node) = node.upgrade() {
        node.tcp_connections.remove(connection.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::port::driver::MemoryDriver;

    fn context() -> Context {
        Context::new(Arc::new(MemoryDriver::default()))
    }

    async fn next_collision(events: &mut broadcast::Receiver<NodeEvent>) -> Option<Vec<String>> {
        loop {
            match events.try_recv() {
                Ok(NodeEvent::WriteCollision { users }) => {
                    return Some(users.into_iter().map(|user| user.host).collect())
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn collisions() {
        let node = Node::new("bench-1", NodeConfig::mock("console", false), &context());
        node.open().unwrap();
        let mut events = node.subscribe();

        node.write(Bytes::from_static(b"a"), Some("10.0.0.1")).unwrap();
        assert_eq!(next_collision(&mut events).await, None);

        tokio::time::advance(Duration::from_millis(100)).await;
        node.write(Bytes::from_static(b"b"), Some("10.0.0.2")).unwrap();
        assert_eq!(
            next_collision(&mut events).await,
            Some(vec!["10.0.0.1".into(), "10.0.0.2".into()])
        );
        assert_eq!(next_collision(&mut events).await, None);

        tokio::time::advance(Duration::from_millis(100)).await;
        node.write(Bytes::from_static(b"c"), Some("10.0.0.3")).unwrap();
        assert_eq!(
            next_collision(&mut events).await,
            Some(vec!["10.0.0.1".into(), "10.0.0.2".into(), "10.0.0.3".into()])
        );

        tokio::time::advance(Duration::from_millis(1500)).await;
        node.write(Bytes::from_static(b"d"), Some("10.0.0.1")).unwrap();
        assert_eq!(next_collision(&mut events).await, None);

        // Every write made it to the line.
        assert_eq!(node.port().as_mock().unwrap().written().len(), 4);
    }

    #[tokio::test]
    async fn writes_without_host_are_not_tracked() {
        let node = Node::new("bench-1", NodeConfig::mock("console", false), &context());
        node.open().unwrap();
        let mut events = node.subscribe();

        node.write(Bytes::from_static(b"a"), Some("10.0.0.1")).unwrap();
        node.write(Bytes::from_static(b"b"), None).unwrap();
        assert_eq!(next_collision(&mut events).await, None);
    }

    #[tokio::test]
    async fn port_events_are_forwarded() {
        let node = Node::new("bench-1", NodeConfig::mock("console", false), &context());
        let mut events = node.subscribe();

        node.open().unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            NodeEvent::SerialStateChanged(PortState::Open)
        );

        node.port().as_mock().unwrap().inject(Bytes::from_static(b"boot\r\n"));
        assert_eq!(
            events.recv().await.unwrap(),
            NodeEvent::SerialData(Bytes::from_static(b"boot\r\n"))
        );
    }

    #[tokio::test]
    async fn config_match_ignores_runtime_state() {
        let config = NodeConfig::mock("console", false);
        let node = Node::new("bench-1", config.clone(), &context());

        assert!(node.matches_config(&config));
        node.open().unwrap();
        assert!(node.matches_config(&config));

        let pinned = NodeConfig {
            tcp_port: Some(7001),
            ..config.clone()
        };
        assert!(!node.matches_config(&pinned));

        let renamed = NodeConfig {
            name: "debug".into(),
            ..config
        };
        assert!(!node.matches_config(&renamed));
    }

    #[tokio::test]
    async fn snapshot_has_realized_tcp_port() {
        let node = Node::new("bench-1", NodeConfig::mock("console", false), &context());
        let mut events = node.tcp().subscribe();
        node.open().unwrap();

        let port = loop {
            if let PortEvent::Listening(port) = events.recv().await.unwrap() {
                break port;
            }
        };

        let snapshot = node.snapshot();
        assert_eq!(snapshot.tcp_port, Some(port));
        assert_eq!(snapshot.state, PortState::Open);
        assert_eq!(snapshot.kind, PortKind::Mock);
    }

    #[tokio::test]
    async fn serial_snapshot_shows_the_line() {
        let settings = crate::port::LineSettings {
            baud_rate: 9600,
            ..Default::default()
        };
        let node = Node::new(
            "bench-1",
            NodeConfig::serial("console", "/dev/ttyMEM0", settings.clone()),
            &context(),
        );

        let snapshot = node.snapshot();
        assert_eq!(snapshot.kind, PortKind::Serial);
        assert_eq!(snapshot.path.as_deref(), Some("/dev/ttyMEM0"));
        assert_eq!(snapshot.settings, Some(settings));

        let mock = Node::new("bench-1", NodeConfig::mock("debug", false), &context()).snapshot();
        assert_eq!(mock.path, None);
        assert_eq!(mock.settings, None);
    }
}
