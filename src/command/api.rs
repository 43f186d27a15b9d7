use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::AbortHandle,
};
use tokio_util::codec::Encoder;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::{
    command::{
        lines::{CrlfCodec, LineBuffer},
        MarkerCaps, ModalRow,
    },
    device::{Device, DeviceEvent, DeviceSnapshot},
    error::Error,
    node::NodeEvent,
};

/// Stops one [`CommandApi::receive_async`] subscription.
#[derive(Debug, Clone)]
pub struct Subscription(AbortHandle);

impl Subscription {
    /// Stop receiving.
    pub fn cancel(&self) {
        self.0.abort();
    }
}

/// Subscriptions made during one command invocation.
#[derive(Debug, Default)]
struct Subscriptions(Arc<Mutex<Vec<AbortHandle>>>);

impl Subscriptions {
    fn track(&self, handle: AbortHandle) {
        self.0.lock().push(handle);
    }

    fn share(&self) -> Self {
        Self(self.0.clone())
    }

    fn cancel_all(&self) {
        let handles = std::mem::take(&mut *self.0.lock());
        if !handles.is_empty() {
            debug!("Cancelling {} subscription(s)", handles.len());
        }
        for handle in handles {
            handle.abort();
        }
    }
}

/// Cancels every subscription of an invocation when dropped.
#[derive(Debug)]
pub(crate) struct InvocationGuard(Subscriptions);

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        self.0.cancel_all();
    }
}

/// What a command body may do with its device.
///
/// Bound to one invocation: subscriptions made through it end with the invocation.
pub struct CommandApi {
    device: Arc<Device>,
    origin: Option<String>,
    subscriptions: Subscriptions,
}

impl std::fmt::Debug for CommandApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandApi")
            .field("device", &self.device.id())
            .field("origin", &self.origin)
            .finish()
    }
}

impl CommandApi {
    pub(crate) fn new(device: Arc<Device>, origin: Option<String>) -> (Self, InvocationGuard) {
        let subscriptions = Subscriptions::default();
        let guard = InvocationGuard(subscriptions.share());

        let api = Self {
            device,
            origin,
            subscriptions,
        };

        (api, guard)
    }

    /// The device as clients see it right now.
    pub fn device(&self) -> DeviceSnapshot {
        self.device.snapshot()
    }

    /// Write bytes to a node.
    pub fn send(&self, node: &str, bytes: impl Into<Bytes>) -> Result<(), Error> {
        self.device.node(node)?.write(bytes.into(), None)
    }

    /// Write text and CRLF to a node.
    pub fn send_line(&self, node: &str, text: &str) -> Result<(), Error> {
        let mut line = BytesMut::new();
        CrlfCodec::default()
            .encode(text, &mut line)
            .map_err(|e| Error::BadUsage(e.to_string()))?;

        self.send(node, line.freeze())
    }

    /// Call `handler` with data from a node until the invocation ends
    /// or the returned subscription is cancelled.
    ///
    /// With `buffer_lines`, the handler is called once per CRLF terminated line instead of
    /// once per chunk.
    pub fn receive_async<F>(
        &self,
        node: &str,
        mut handler: F,
        buffer_lines: bool,
    ) -> Result<Subscription, Error>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        let node = self.device.node(node)?;
        let mut events = node.subscribe();
        let span = info_span!("receive", node = %node.name());

        let handle = tokio::spawn(
            async move {
                let mut lines = buffer_lines.then(LineBuffer::default);

                loop {
                    match events.recv().await {
                        Ok(NodeEvent::SerialData(data)) => match lines.as_mut() {
                            Some(lines) => lines.push(&data).into_iter().for_each(&mut handler),
                            None => handler(data),
                        },
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => warn!("Receiver lagged, skipped {n} event(s)"),
                        Err(RecvError::Closed) => break,
                    }
                }

                trace!("Receiver done");
            }
            .instrument(span),
        );

        let handle = handle.abort_handle();
        self.subscriptions.track(handle.clone());

        Ok(Subscription(handle))
    }

    /// Like [`CommandApi::receive_async`], but delivered through a channel
    /// so the command body can await what arrives.
    pub fn receive(
        &self,
        node: &str,
        buffer_lines: bool,
    ) -> Result<mpsc::UnboundedReceiver<Bytes>, Error> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.receive_async(
            node,
            move |bytes| {
                // The body may have stopped listening.
                let _ = tx.send(bytes);
            },
            buffer_lines,
        )?;

        Ok(rx)
    }

    /// Ask the session which started the command to show a dialog.
    pub fn show_modal(&self, title: &str, rows: Vec<ModalRow>) {
        self.device.publish(DeviceEvent::CommandModal {
            to: self.origin.clone(),
            title: title.into(),
            rows,
        });
    }

    /// Ask terminals of the device to draw a marker line.
    pub fn emit_terminal_marker(&self, label: &str, caps: Option<MarkerCaps>) {
        self.device.publish(DeviceEvent::TermLine {
            label: label.into(),
            caps,
        });
    }
}
