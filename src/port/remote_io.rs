use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::Error,
    port::{PortCore, PortEvent, PortKind, PortState, Transport},
    user::host_of,
};

/// The closed reason while listening without a peer.
pub const WAITING_FOR_PEER: &str = "Waiting for remote peer";

#[derive(Debug)]
struct Peer {
    id: u64,
    host: String,
    to_peer: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Shared {
    local_port: Option<u16>,
    peer: Option<Peer>,
    next_peer_id: u64,
}

#[derive(Debug)]
struct ListenTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A line provided by a companion process which connects to us over TCP.
///
/// At most one peer is attached. A new peer replaces the old one,
/// which is torn down before the new one is attached.
#[derive(Debug)]
pub struct RemoteIoPort {
    requested: u16,
    core: Arc<PortCore>,
    shared: Arc<Mutex<Shared>>,
    task: Mutex<Option<ListenTask>>,
    retired: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteIoPort {
    /// A closed port which will listen on `port` (0: any free port).
    pub fn new(port: u16) -> Self {
        Self {
            requested: port,
            core: Arc::new(PortCore::new(format!("remote-io:{port}"))),
            shared: Arc::new(Mutex::new(Shared::default())),
            task: Mutex::new(None),
            retired: Mutex::new(None),
        }
    }

    /// The port peers should connect to, once listening.
    pub fn local_port(&self) -> Option<u16> {
        self.shared.lock().local_port
    }

    /// The host of the attached peer, if any.
    pub fn peer_host(&self) -> Option<String> {
        self.shared.lock().peer.as_ref().map(|peer| peer.host.clone())
    }

    /// Wait until the listening socket of the last [`Transport::close`] is gone.
    pub async fn released(&self) {
        let retired = self.retired.lock().take();
        if let Some(handle) = retired {
            let _ = handle.await;
        }
    }
}

impl Transport for RemoteIoPort {
    fn kind(&self) -> PortKind {
        PortKind::RemoteIo
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
                self.shared.clone(),
                cancel.clone(),
            )
            .instrument(info_span!("remote-io", requested = self.requested)),
        );

        *task = Some(ListenTask { cancel, handle });
        Ok(())
    }

    fn close(&self, reason: Option<&str>) {
        if let Some(task) = self.task.lock().take() {
            task.cancel.cancel();
            *self.retired.lock() = Some(task.handle);
        }

        {
            let mut shared = self.shared.lock();
            shared.local_port = None;
            if let Some(peer) = shared.peer.take() {
                peer.cancel.cancel();
            }
        }

        self.core.close(reason);
    }

    fn write(&self, bytes: Bytes) -> Result<(), Error> {
        let shared = self.shared.lock();
        let not_connected = || Error::NotConnected(self.core.label().into());

        match &shared.peer {
            Some(peer) => peer.to_peer.send(bytes).map_err(|_| not_connected()),
            None => Err(not_connected()),
        }
    }

    fn state(&self) -> PortState {
        self.core.state()
    }

    fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.core.subscribe()
    }
}

impl Drop for RemoteIoPort {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
        if let Some(peer) = self.shared.lock().peer.take() {
            peer.cancel.cancel();
        }
    }
}

async fn listen(
    requested: u16,
    core: Arc<PortCore>,
    generation: u64,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
) {
    let bound = tokio::select! {
        _ = cancel.cancelled() => return,
        bound = TcpListener::bind((Ipv4Addr::UNSPECIFIED, requested)) => bound,
    };

    let listener = match bound.and_then(|listener| {
        let port = listener.local_addr()?.port();
        Ok((listener, port))
    }) {
        Ok((listener, port)) => {
            if cancel.is_cancelled() {
                return;
            }
            shared.lock().local_port = Some(port);
            info!(%port, "Waiting for remote peer");
            core.emit(PortEvent::Listening(port));
            if !core.set_state_for(generation, PortState::closed(WAITING_FOR_PEER)) {
                return;
            }
            listener
        }
        Err(e) => {
            warn!(?e, "Could not listen");
            core.set_state_for(
                generation,
                PortState::closed(format!("Could not listen on port {requested}: {e}")),
            );
            return;
        }
    };

    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(?e, "Accept failed");
                    continue;
                }
            },
        };

        attach(stream, addr, &core, generation, &shared).await;
    }
}

async fn attach(
    stream: TcpStream,
    addr: SocketAddr,
    core: &Arc<PortCore>,
    generation: u64,
    shared: &Arc<Mutex<Shared>>,
) {
    let previous = shared.lock().peer.take();
    if let Some(previous) = previous {
        info!(old = %previous.host, new = %addr, "Replacing remote peer");
        previous.cancel.cancel();
        if let Err(e) = previous.handle.await {
            warn!(?e, "Old remote peer task failed");
        }
    }

    let (to_peer, from_owner) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let host = host_of(&addr);

    let mut shared_guard = shared.lock();
    shared_guard.next_peer_id += 1;
    let id = shared_guard.next_peer_id;

    let handle = tokio::spawn(
        serve_peer(
            id,
            stream,
            from_owner,
            core.clone(),
            generation,
            shared.clone(),
            cancel.clone(),
        )
        .instrument(info_span!("peer", %host)),
    );

    shared_guard.peer = Some(Peer {
        id,
        host,
        to_peer,
        cancel,
        handle,
    });
    core.set_state_for(generation, PortState::Open);
}

async fn serve_peer(
    id: u64,
    stream: TcpStream,
    mut from_owner: mpsc::UnboundedReceiver<Bytes>,
    core: Arc<PortCore>,
    generation: u64,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        buf.reserve(1024);

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Remote peer detached");
                return;
            }
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => core.emit_data(buf.split().freeze()),
                Err(e) => {
                    warn!(?e, "Remote peer read failed");
                    break;
                }
            },
            Some(bytes) = from_owner.recv() => {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!(?e, "Remote peer write failed");
                    break;
                }
            }
        }
    }

    info!("Remote peer went away");

    let still_current = {
        let mut shared = shared.lock();
        let current = shared.peer.as_ref().map_or(false, |peer| peer.id == id);
        if current {
            shared.peer = None;
        }
        current
    };

    if still_current {
        core.set_state_for(generation, PortState::closed(WAITING_FOR_PEER));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::port::TransportExt;

    async fn listening(port: &RemoteIoPort) -> u16 {
        for _ in 0..1000 {
            if let Some(port) = port.local_port() {
                return port;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Never listened");
    }

    async fn wait_open(port: &RemoteIoPort, open: bool) {
        for _ in 0..1000 {
            if port.is_open() == open {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Never became open={open}");
    }

    #[tokio::test]
    async fn write_needs_a_peer() {
        let port = RemoteIoPort::new(0);
        port.open().unwrap();
        listening(&port).await;

        assert_eq!(port.why_closed().as_deref(), Some(WAITING_FOR_PEER));
        assert!(matches!(
            port.write(Bytes::from_static(b"x")),
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn peer_carries_the_line() {
        let port = RemoteIoPort::new(0);
        let mut events = port.subscribe();
        port.open().unwrap();
        let local = listening(&port).await;

        let mut peer = TcpStream::connect(("127.0.0.1", local)).await.unwrap();
        wait_open(&port, true).await;
        assert_eq!(port.peer_host().as_deref(), Some("127.0.0.1"));

        port.write(Bytes::from_static(b"hello")).unwrap();
        let mut buf = [0; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"world").await.unwrap();
        loop {
            if let PortEvent::Data(data) = events.recv().await.unwrap() {
                assert_eq!(&data[..], b"world");
                break;
            }
        }

        drop(peer);
        wait_open(&port, false).await;
        assert_eq!(port.why_closed().as_deref(), Some(WAITING_FOR_PEER));
    }

    #[tokio::test]
    async fn second_peer_replaces_first() {
        let port = RemoteIoPort::new(0);
        port.open().unwrap();
        let local = listening(&port).await;

        let mut first = TcpStream::connect(("127.0.0.1", local)).await.unwrap();
        wait_open(&port, true).await;

        let mut second = TcpStream::connect(("127.0.0.1", local)).await.unwrap();

        // The first peer is hung up on.
        let mut buf = [0; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), first.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        // Writes now go to the second one, once it is attached.
        for _ in 0..1000 {
            if port.write(Bytes::from_static(b"2")).is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"2");
        assert!(port.is_open());
    }
}
