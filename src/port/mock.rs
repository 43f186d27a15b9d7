//! A mock line, useful to test bridging without actual serial ports.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, trace, warn};

use crate::{
    error::Error,
    events::Publisher,
    port::{PortCore, PortEvent, PortKind, PortState, Transport},
};

/// An in-memory line.
///
/// Written bytes are recorded and published.
/// With loopback, written bytes also come back as line data, like a jumper across TX and RX.
#[derive(Debug)]
pub struct MockPort {
    core: PortCore,
    loopback: bool,
    written: Mutex<Vec<Bytes>>,
    writes: Publisher<Bytes>,
}

impl MockPort {
    /// A closed mock line.
    pub fn new(name: &str, loopback: bool) -> Self {
        Self {
            core: PortCore::new(format!("mock:{name}")),
            loopback,
            written: Mutex::new(vec![]),
            writes: Publisher::default(),
        }
    }

    /// Pretend the attached hardware sent something.
    pub fn inject(&self, bytes: impl Into<Bytes>) {
        if !self.core.is_open() {
            warn!(port = %self.core.label(), "Dropping injected bytes, port is closed");
            return;
        }
        self.core.emit_data(bytes.into());
    }

    /// Pretend the line failed.
    pub fn fail(&self, reason: &str) {
        info!(port = %self.core.label(), %reason, "Simulating failure");
        self.core.set_state(PortState::closed(reason));
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    /// Receive writes from now on.
    pub fn subscribe_writes(&self) -> broadcast::Receiver<Bytes> {
        self.writes.subscribe()
    }
}

impl Transport for MockPort {
    fn kind(&self) -> PortKind {
        PortKind::Mock
    }

    fn open(&self) -> Result<(), Error> {
        let generation = self.core.begin();
        self.core.set_state_for(generation, PortState::Open);
        Ok(())
    }

    fn close(&self, reason: Option<&str>) {
        self.core.close(reason);
    }

    fn write(&self, bytes: Bytes) -> Result<(), Error> {
        if !self.core.is_open() {
            return Err(Error::PortClosed {
                port: self.core.label().into(),
                reason: self.core.state().to_string(),
            });
        }

        trace!(port = %self.core.label(), "Mock write of {} byte(s)", bytes.len());
        self.written.lock().push(bytes.clone());
        self.writes.publish(bytes.clone());

        if self.loopback {
            self.core.emit_data(bytes);
        }

        Ok(())
    }

    fn state(&self) -> PortState {
        self.core.state()
    }

    fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.core.subscribe()
    }
}
