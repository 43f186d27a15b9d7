//! Serial adapters found on the host, opened on request and kept open only
//! while a client keeps asking for them.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::PortsFindConfig,
    error::Error,
    events::Publisher,
    port::{
        driver::{NativePortInfo, SerialDriver},
        LineSettings, PortEvent, PortState, SerialPort, Transport, TransportExt,
    },
};

/// Ports without a keepalive for this many poll intervals are closed.
const KEEP_ALIVE_INTERVALS: u32 = 3;

/// Why the watchdog closed a port.
pub const KEEP_ALIVE_EXPIRED: &str = "No keepalive received";

/// Data read from a native port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeData {
    /// Which port.
    pub path: String,
    /// What was read.
    pub bytes: Bytes,
}

/// A native port as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativePortSnapshot {
    /// Where the port is and what it is.
    #[serde(flatten)]
    pub info: NativePortInfo,
    /// Settings, if the port is in use.
    pub settings: Option<LineSettings>,
    /// Current state.
    pub state: PortState,
}

#[derive(Debug)]
struct NativePort {
    info: Mutex<NativePortInfo>,
    port: SerialPort,
    last_keep_alive: Mutex<Option<Instant>>,
    forward: Mutex<Option<JoinHandle<()>>>,
}

impl NativePort {
    fn in_use(&self) -> bool {
        self.last_keep_alive.lock().is_some()
    }

    fn snapshot(&self) -> NativePortSnapshot {
        NativePortSnapshot {
            info: self.info.lock().clone(),
            settings: self.in_use().then(|| self.port.settings()),
            state: self.port.state(),
        }
    }
}

impl Drop for NativePort {
    fn drop(&mut self) {
        if let Some(forward) = self.forward.lock().take() {
            forward.abort();
        }
    }
}

/// The known native ports.
#[derive(Debug)]
pub struct NativePortRegistry {
    enabled: bool,
    poll_interval: Duration,
    driver: Arc<dyn SerialDriver>,
    ports: Mutex<BTreeMap<String, Arc<NativePort>>>,
    data: Arc<Publisher<NativeData>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl NativePortRegistry {
    /// An empty registry.
    pub fn new(config: &PortsFindConfig, driver: Arc<dyn SerialDriver>) -> Arc<Self> {
        Arc::new(Self {
            enabled: config.enabled,
            poll_interval: config.poll_interval(),
            driver,
            ports: Mutex::new(BTreeMap::new()),
            data: Arc::new(Publisher::default()),
            watchdog: Mutex::new(None),
        })
    }

    fn check_enabled(&self) -> Result<(), Error> {
        if self.enabled {
            Ok(())
        } else {
            Err(Error::FeatureDisabled("ports_find".into()))
        }
    }

    /// Find the adapters on the host.
    ///
    /// Ports seen before are updated in place. Ports which went away stay known.
    pub fn list(&self) -> Result<Vec<NativePortSnapshot>, Error> {
        self.check_enabled()?;

        let found = self.driver.available_ports()?;
        debug!("Found {} native port(s)", found.len());

        let mut ports = self.ports.lock();
        for info in found {
            match ports.get(&info.path) {
                Some(known) => *known.info.lock() = info,
                None => {
                    let port = SerialPort::new(&info.path, LineSettings::default(), self.driver.clone());
                    ports.insert(
                        info.path.clone(),
                        Arc::new(NativePort {
                            info: Mutex::new(info),
                            port,
                            last_keep_alive: Mutex::new(None),
                            forward: Mutex::new(None),
                        }),
                    );
                }
            }
        }

        Ok(ports.values().map(|port| port.snapshot()).collect())
    }

    fn get(&self, path: &str) -> Result<Arc<NativePort>, Error> {
        self.ports
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NoSuchNativePort(path.into()))
    }

    /// Open a port with the given settings, returning once the line is open.
    ///
    /// Opening a port which is already in use with the same settings does nothing.
    /// Different settings are refused, as is a line which cannot be opened.
    pub async fn open(
        self: &Arc<Self>,
        path: &str,
        settings: LineSettings,
    ) -> Result<NativePortSnapshot, Error> {
        self.check_enabled()?;

        let port = match self.get(path) {
            Ok(port) => port,
            Err(_) => {
                self.list()?;
                self.get(path)?
            }
        };

        {
            let mut forward = port.forward.lock();
            if forward.as_ref().map_or(true, JoinHandle::is_finished) {
                *forward = Some(tokio::spawn(
                    forward_data(port.port.subscribe(), path.to_owned(), Arc::downgrade(&self.data))
                        .instrument(info_span!("native", %path)),
                ));
            }
        }

        let fresh = !port.port.is_held();
        port.port.open_with(settings)?;
        if fresh {
            if let Err(e) = port.port.opened().await {
                warn!(%path, %e, "Could not open native port");
                return Err(e);
            }
        }

        *port.last_keep_alive.lock() = Some(Instant::now());
        info!(%path, "Native port in use");

        self.start_watchdog();
        Ok(port.snapshot())
    }

    /// Postpone closing an open port.
    pub fn keep_alive(&self, path: &str) -> Result<(), Error> {
        self.check_enabled()?;

        let port = self.get(path)?;
        let mut last = port.last_keep_alive.lock();
        match last.as_mut() {
            Some(last) => {
                *last = Instant::now();
                Ok(())
            }
            None => Err(Error::PortClosed {
                port: path.into(),
                reason: port.port.why_closed().unwrap_or_default(),
            }),
        }
    }

    /// Receive data read from any native port from now on.
    pub fn subscribe_data(&self) -> broadcast::Receiver<NativeData> {
        self.data.subscribe()
    }

    /// Close everything and forget every port.
    pub fn reset(&self) {
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }

        let ports = std::mem::take(&mut *self.ports.lock());
        for port in ports.values() {
            port.port.close(None);
        }
    }

    fn start_watchdog(self: &Arc<Self>) {
        let mut watchdog = self.watchdog.lock();
        if watchdog.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }

        debug!("Starting native port watchdog");
        *watchdog = Some(tokio::spawn(
            watch(Arc::downgrade(self), self.poll_interval).instrument(info_span!("native-watchdog")),
        ));
    }

    /// Close ports whose keepalive expired. Returns how many ports are still in use.
    fn expire(&self, now: Instant) -> usize {
        let limit = self.poll_interval * KEEP_ALIVE_INTERVALS;
        let ports: Vec<_> = self.ports.lock().values().cloned().collect();

        let mut in_use = 0;
        for port in ports {
            let mut last = port.last_keep_alive.lock();
            match *last {
                Some(seen) if now.duration_since(seen) > limit => {
                    let path = port.info.lock().path.clone();
                    info!(%path, "Keepalive expired, closing");
                    *last = None;
                    port.port.close(Some(KEEP_ALIVE_EXPIRED));
                }
                Some(_) => in_use += 1,
                None => {}
            }
        }

        in_use
    }
}

async fn watch(registry: Weak<NativePortRegistry>, poll_interval: Duration) {
    loop {
        tokio::time::sleep(poll_interval).await;

        let Some(registry) = registry.upgrade() else { break };
        if registry.expire(Instant::now()) == 0 {
            break;
        }
    }

    debug!("Native port watchdog stopped");
}

async fn forward_data(
    mut events: broadcast::Receiver<PortEvent>,
    path: String,
    data: Weak<Publisher<NativeData>>,
) {
    loop {
        match events.recv().await {
            Ok(PortEvent::Data(bytes)) => {
                let Some(data) = data.upgrade() else { break };
                data.publish(NativeData {
                    path: path.clone(),
                    bytes,
                });
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("Lagged, skipped {n} event(s)"),
            Err(RecvError::Closed) => break,
        }
    }
}
