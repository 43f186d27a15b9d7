//! Ports: the state machines owning a single transport.
//!
//! Every variant implements [`Transport`].
//! A [`Node`](crate::node::Node) picks one through [`LinePort`] at construction.

use std::fmt::Display;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{error::Error, events::Publisher};

/// Reconnect backoff timing.
pub mod backoff;
pub mod driver;
pub mod mock;
/// Lines provided by a companion process connecting over TCP.
pub mod remote_io;
/// Serial port settings and transport.
pub mod serial;
/// TCP listening sockets that expose lines to clients.
pub mod tcp;

pub use mock::MockPort;
pub use remote_io::RemoteIoPort;
pub use serial::{ByteSize, LineSettings, Parity, SerialPort, StopBits};
pub use tcp::TcpListenerPort;

/// The reason a port has before anyone opened it.
pub const NEVER_OPENED: &str = "Never opened";

/// Whether a port is open, and if not, why.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PortState {
    /// The transport is usable.
    Open,

    /// The transport is not usable.
    Closed {
        /// Human readable, shown to operators.
        reason: String,
    },
}

impl PortState {
    /// A closed state with the given reason.
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }
}

impl Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed { reason } => write!(f, "closed ({reason})"),
        }
    }
}

/// Things ports tell their owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// The port opened or closed.
    StateChanged(PortState),

    /// Raw bytes came from the transport.
    Data(Bytes),

    /// A listening port is bound. Carries the realized port number.
    Listening(u16),
}

/// Which kind of transport a port uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortKind {
    /// A serial line.
    Serial,

    /// A TCP listening socket.
    TcpListener,

    /// A single inbound TCP peer acting as the line.
    RemoteIo,

    /// In-memory.
    Mock,
}

/// The capabilities shared by all ports.
pub trait Transport {
    /// What kind of port this is.
    fn kind(&self) -> PortKind;

    /// Begin (or keep) trying to reach the open state.
    /// Never waits for the transport to actually open.
    fn open(&self) -> Result<(), Error>;

    /// Force the port closed.
    ///
    /// With a reason, the state becomes `Closed { reason }` right away.
    /// Without one, an already reported reason is kept.
    fn close(&self, reason: Option<&str>);

    /// Put bytes on the transport.
    fn write(&self, bytes: Bytes) -> Result<(), Error>;

    /// The current state.
    fn state(&self) -> PortState;

    /// Receive state changes and data from now on.
    fn subscribe(&self) -> broadcast::Receiver<PortEvent>;
}

/// Conveniences for all [`Transport`]s.
pub trait TransportExt: Transport {
    /// True if open.
    fn is_open(&self) -> bool {
        self.state() == PortState::Open
    }

    /// The reason the port is closed, if it is.
    fn why_closed(&self) -> Option<String> {
        match self.state() {
            PortState::Open => None,
            PortState::Closed { reason } => Some(reason),
        }
    }
}

impl<T> TransportExt for T where T: Transport + ?Sized {}

/// The transport a node's line goes through.
#[derive(Debug)]
pub enum LinePort {
    /// A local serial line.
    Serial(SerialPort),

    /// A companion process connected over TCP.
    RemoteIo(RemoteIoPort),

    /// In-memory.
    Mock(MockPort),
}

impl LinePort {
    /// Get the serial port, if this is one.
    pub fn as_serial(&self) -> Option<&SerialPort> {
        match self {
            LinePort::Serial(port) => Some(port),
            _ => None,
        }
    }

    /// Get the remote-IO port, if this is one.
    pub fn as_remote_io(&self) -> Option<&RemoteIoPort> {
        match self {
            LinePort::RemoteIo(port) => Some(port),
            _ => None,
        }
    }

    /// Get the mock port, if this is one.
    pub fn as_mock(&self) -> Option<&MockPort> {
        match self {
            LinePort::Mock(port) => Some(port),
            _ => None,
        }
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            LinePort::Serial(port) => port,
            LinePort::RemoteIo(port) => port,
            LinePort::Mock(port) => port,
        }
    }
}

impl Transport for LinePort {
    fn kind(&self) -> PortKind {
        self.inner().kind()
    }

    fn open(&self) -> Result<(), Error> {
        self.inner().open()
    }

    fn close(&self, reason: Option<&str>) {
        self.inner().close(reason)
    }

    fn write(&self, bytes: Bytes) -> Result<(), Error> {
        self.inner().write(bytes)
    }

    fn state(&self) -> PortState {
        self.inner().state()
    }

    fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.inner().subscribe()
    }
}

#[derive(Debug)]
struct Status {
    state: PortState,
    generation: u64,
}

/// State and events shared by every port variant.
///
/// Each open attempt runs under a generation.
/// Closing bumps the generation, so a late report from an older attempt is ignored.
#[derive(Debug)]
pub(crate) struct PortCore {
    label: String,
    status: Mutex<Status>,
    events: Publisher<PortEvent>,
}

impl PortCore {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            status: Mutex::new(Status {
                state: PortState::closed(NEVER_OPENED),
                generation: 0,
            }),
            events: Publisher::default(),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn state(&self) -> PortState {
        self.status.lock().state.clone()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.status.lock().state == PortState::Open
    }

    /// Start a new open attempt.
    pub(crate) fn begin(&self) -> u64 {
        let mut status = self.status.lock();
        status.generation += 1;
        status.generation
    }

    /// Set the state on behalf of an open attempt.
    /// Returns false if the attempt is stale, in which case nothing changes.
    pub(crate) fn set_state_for(&self, generation: u64, state: PortState) -> bool {
        {
            let mut status = self.status.lock();
            if status.generation != generation {
                return false;
            }
            if status.state == state {
                return true;
            }
            status.state = state.clone();
        }

        self.announce(state);
        true
    }

    /// Set the state regardless of generation.
    pub(crate) fn set_state(&self, state: PortState) {
        {
            let mut status = self.status.lock();
            if status.state == state {
                return;
            }
            status.state = state.clone();
        }

        self.announce(state);
    }

    /// Invalidate every open attempt and close.
    pub(crate) fn close(&self, reason: Option<&str>) {
        let next = {
            let mut status = self.status.lock();
            status.generation += 1;

            let next = match (reason, &status.state) {
                (Some(reason), _) => PortState::closed(reason),
                (None, PortState::Open) => PortState::closed("Closed"),
                (None, PortState::Closed { .. }) => return,
            };
            if status.state == next {
                return;
            }
            status.state = next.clone();
            next
        };

        self.announce(next);
    }

    pub(crate) fn emit_data(&self, data: Bytes) {
        self.events.publish(PortEvent::Data(data));
    }

    pub(crate) fn emit(&self, event: PortEvent) {
        self.events.publish(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.events.subscribe()
    }

    fn announce(&self, state: PortState) {
        debug!(port = %self.label, %state, "State changed");
        self.events.publish(PortEvent::StateChanged(state));
    }
}
