use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::Error,
    port::{PortCore, PortEvent, PortKind, PortState, Transport},
};

/// A freshly accepted client and where it came from.
pub type Accepted = (TcpStream, SocketAddr);

#[derive(Debug)]
struct ListenTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A TCP listening socket.
///
/// Open once actually listening.
/// Accepted sockets go to whoever holds the receiver returned by [`TcpListenerPort::new`].
#[derive(Debug)]
pub struct TcpListenerPort {
    requested: u16,
    core: Arc<PortCore>,
    local_port: Arc<Mutex<Option<u16>>>,
    accepted: mpsc::UnboundedSender<Accepted>,
    task: Mutex<Option<ListenTask>>,
    retired: Mutex<Option<JoinHandle<()>>>,
}

impl TcpListenerPort {
    /// A closed listener for `port`, where 0 means any free port.
    pub fn new(port: u16) -> (Self, mpsc::UnboundedReceiver<Accepted>) {
        let (accepted, rx) = mpsc::unbounded_channel();

        let listener = Self {
            requested: port,
            core: Arc::new(PortCore::new(format!("tcp:{port}"))),
            local_port: Arc::new(Mutex::new(None)),
            accepted,
            task: Mutex::new(None),
            retired: Mutex::new(None),
        };

        (listener, rx)
    }

    /// The port actually listened on, once bound.
    pub fn local_port(&self) -> Option<u16> {
        *self.local_port.lock()
    }

    /// Wait until the socket of the last [`Transport::close`] is really gone,
    /// so its port may be bound again.
    pub async fn released(&self) {
        let retired = self.retired.lock().take();
        if let Some(handle) = retired {
            let _ = handle.await;
        }
    }
}

impl Transport for TcpListenerPort {
    fn kind(&self) -> PortKind {
        PortKind::TcpListener
    }

    fn open(&self) -> Result<(), Error> {
        let mut task = self.task.lock();
        if task.as_ref().map_or(false, |task| !task.handle.is_finished()) {
            return Ok(());
        }

        let generation = self.core.begin();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            listen(
                self.requested,
                self.core.clone(),
                generation,
                self.local_port.clone(),
                self.accepted.clone(),
                cancel.clone(),
            )
            .instrument(info_span!("listener", requested = self.requested)),
        );

        *task = Some(ListenTask { cancel, handle });
        Ok(())
    }

    fn close(&self, reason: Option<&str>) {
        if let Some(task) = self.task.lock().take() {
            task.cancel.cancel();
            *self.retired.lock() = Some(task.handle);
        }
        *self.local_port.lock() = None;
        self.core.close(reason);
    }

    fn write(&self, _bytes: Bytes) -> Result<(), Error> {
        Err(Error::WriteUnsupported(self.core.label().into()))
    }

    fn state(&self) -> PortState {
        self.core.state()
    }

    fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.core.subscribe()
    }
}

impl Drop for TcpListenerPort {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

async fn listen(
    requested: u16,
    core: Arc<PortCore>,
    generation: u64,
    local_port: Arc<Mutex<Option<u16>>>,
    accepted: mpsc::UnboundedSender<Accepted>,
    cancel: CancellationToken,
) {
    let listener = tokio::select! {
        _ = cancel.cancelled() => return,
        bound = TcpListener::bind((Ipv4Addr::UNSPECIFIED, requested)) => bound,
    };

    let listener = match listener {
        Ok(listener) => listener,
        Err(e) => {
            warn!(?e, "Could not listen");
            core.set_state_for(
                generation,
                PortState::closed(format!("Could not listen on port {requested}: {e}")),
            );
            return;
        }
    };

    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            core.set_state_for(generation, PortState::closed(format!("Error: {e}")));
            return;
        }
    };

    if cancel.is_cancelled() {
        return;
    }
    *local_port.lock() = Some(port);
    info!(%port, "Listening");
    core.emit(PortEvent::Listening(port));
    if !core.set_state_for(generation, PortState::Open) {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stopped listening");
                return;
            }
            client = listener.accept() => match client {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted");
                    if accepted.send((stream, addr)).is_err() {
                        debug!("Nobody takes accepted sockets anymore");
                        return;
                    }
                }
                Err(e) => {
                    warn!(?e, "Accept failed");
                    core.set_state_for(generation, PortState::closed(format!("Error: {e}")));
                    return;
                }
            },
        }
    }
}
