use std::{fmt::Display, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    error::Error,
    port::{
        backoff::ReconnectSchedule,
        driver::{LineIo, SerialDriver},
        PortCore, PortEvent, PortKind, PortState, Transport,
    },
};

/// Appended to the closed reason while the line is being retried.
pub const RECONNECTING_SUFFIX: &str = ". Attempting to reconnect";

/// A failed attempt may close with the reason the port already had, which is not announced.
const SETTLE_POLL: Duration = Duration::from_millis(10);

/// Bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ByteSize {
    /// 5 bits.
    Five,
    /// 6 bits.
    Six,
    /// 7 bits.
    Seven,
    /// 8 bits.
    Eight,
}

impl TryFrom<u8> for ByteSize {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(Self::Five),
            6 => Ok(Self::Six),
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            other => Err(format!("Byte size must be 5-8, got {other}")),
        }
    }
}

impl From<ByteSize> for u8 {
    fn from(size: ByteSize) -> Self {
        match size {
            ByteSize::Five => 5,
            ByteSize::Six => 6,
            ByteSize::Seven => 7,
            ByteSize::Eight => 8,
        }
    }
}

impl From<ByteSize> for tokio_serial::DataBits {
    fn from(size: ByteSize) -> Self {
        match size {
            ByteSize::Five => tokio_serial::DataBits::Five,
            ByteSize::Six => tokio_serial::DataBits::Six,
            ByteSize::Seven => tokio_serial::DataBits::Seven,
            ByteSize::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Parity checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
    /// No parity bit.
    None,
}

impl Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parity = match self {
            Parity::Even => "even",
            Parity::Odd => "odd",
            Parity::None => "none",
        };
        write!(f, "{parity}")
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        }
    }
}

/// Stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    /// One stop bit.
    One,
    /// Two stop bits.
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            other => Err(format!("Stop bits must be 1 or 2, got {other}")),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(stop_bits: StopBits) -> Self {
        match stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(stop_bits: StopBits) -> Self {
        match stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// How to talk on a serial line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineSettings {
    /// Symbols per second. Must be positive.
    pub baud_rate: u32,

    /// Bits per character.
    pub byte_size: ByteSize,

    /// Parity checking.
    pub parity: Parity,

    /// Stop bits.
    #[serde(rename = "stop")]
    pub stop_bits: StopBits,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            byte_size: ByteSize::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl Display for LineSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate,
            u8::from(self.byte_size),
            match self.parity {
                Parity::Even => 'E',
                Parity::Odd => 'O',
                Parity::None => 'N',
            },
            u8::from(self.stop_bits)
        )
    }
}

impl LineSettings {
    /// Describe how `other` differs from these settings, if at all.
    pub fn mismatch(&self, other: &LineSettings) -> Option<String> {
        let mut problems = vec![];

        if self.baud_rate != other.baud_rate {
            problems.push(format!(
                "baud rate is {}, can't open with {}",
                self.baud_rate, other.baud_rate
            ));
        }
        if self.parity != other.parity {
            problems.push(format!(
                "parity is {}, can't open with {}",
                self.parity, other.parity
            ));
        }
        if self.stop_bits != other.stop_bits {
            problems.push(format!(
                "stop bits is {}, can't open with {}",
                u8::from(self.stop_bits),
                u8::from(other.stop_bits)
            ));
        }
        if self.byte_size != other.byte_size {
            problems.push(format!(
                "byte size is {}, can't open with {}",
                u8::from(self.byte_size),
                u8::from(other.byte_size)
            ));
        }

        (!problems.is_empty()).then(|| problems.join("; "))
    }
}

#[derive(Debug)]
struct LineTask {
    to_wire: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LineTask {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// A serial line which reconnects by itself when lost.
#[derive(Debug)]
pub struct SerialPort {
    path: String,
    settings: Mutex<LineSettings>,
    driver: Arc<dyn SerialDriver>,
    core: Arc<PortCore>,
    line: Mutex<Option<LineTask>>,
}

impl SerialPort {
    /// Create a closed port. Nothing is touched until [`Transport::open`].
    pub fn new(path: &str, settings: LineSettings, driver: Arc<dyn SerialDriver>) -> Self {
        Self {
            path: path.into(),
            settings: Mutex::new(settings),
            driver,
            core: Arc::new(PortCore::new(path)),
            line: Mutex::new(None),
        }
    }

    /// The OS path of the line.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The settings used for (re)opening.
    pub fn settings(&self) -> LineSettings {
        self.settings.lock().clone()
    }

    /// True while a line task is running, either holding the line or retrying it.
    pub fn is_held(&self) -> bool {
        self.line.lock().as_ref().map_or(false, LineTask::is_alive)
    }

    /// Open with specific settings.
    ///
    /// If the line is held with identical settings, nothing happens.
    /// If it is held with different settings, fails and leaves the line alone.
    pub fn open_with(&self, settings: LineSettings) -> Result<(), Error> {
        if self.is_held() {
            return match self.settings().mismatch(&settings) {
                None => Ok(()),
                Some(problem) => Err(Error::SettingsMismatch {
                    path: self.path.clone(),
                    problem,
                }),
            };
        }

        *self.settings.lock() = settings;
        self.open()
    }

    /// Wait until the line is open.
    ///
    /// Fails with the reason if the line task gave up, e.g. because the first open failed.
    pub async fn opened(&self) -> Result<(), Error> {
        let mut events = self.subscribe();

        loop {
            match self.state() {
                PortState::Open => return Ok(()),
                PortState::Closed { reason } if !self.is_held() => {
                    return Err(Error::transport(&self.path, reason))
                }
                PortState::Closed { .. } => {}
            }

            tokio::select! {
                _ = events.recv() => {}
                _ = tokio::time::sleep(SETTLE_POLL) => {}
            }
        }
    }
}

impl Transport for SerialPort {
    fn kind(&self) -> PortKind {
        PortKind::Serial
    }

    fn open(&self) -> Result<(), Error> {
        let mut line = self.line.lock();

        if line.as_ref().map_or(false, LineTask::is_alive) {
            trace!(path = %self.path, "Already held");
            return Ok(());
        }

        let generation = self.core.begin();
        let (to_wire, from_owner) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = LineWorker {
            path: self.path.clone(),
            settings: self.settings(),
            driver: self.driver.clone(),
            core: self.core.clone(),
            generation,
            from_owner,
            cancel: cancel.clone(),
        };

        info!(path = %self.path, settings = %worker.settings, "Starting serial port handler");
        let handle = tokio::spawn(worker.run().instrument(info_span!("tty", path = %self.path)));

        *line = Some(LineTask {
            to_wire,
            cancel,
            handle,
        });

        Ok(())
    }

    fn close(&self, reason: Option<&str>) {
        if let Some(task) = self.line.lock().take() {
            task.cancel.cancel();
        }
        self.core.close(reason);
    }

    fn write(&self, bytes: Bytes) -> Result<(), Error> {
        let closed = || Error::PortClosed {
            port: self.path.clone(),
            reason: self.core.state().to_string(),
        };

        if !self.core.is_open() {
            return Err(closed());
        }

        match self.line.lock().as_ref() {
            Some(task) => task.to_wire.send(bytes).map_err(|_| closed()),
            None => Err(closed()),
        }
    }

    fn state(&self) -> PortState {
        self.core.state()
    }

    fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.core.subscribe()
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        if let Some(task) = self.line.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

struct LineWorker {
    path: String,
    settings: LineSettings,
    driver: Arc<dyn SerialDriver>,
    core: Arc<PortCore>,
    generation: u64,
    from_owner: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
}

fn open_problem(error: &Error) -> String {
    match error {
        Error::Transport { problem, .. } => problem.clone(),
        other => other.to_string(),
    }
}

impl LineWorker {
    async fn run(mut self) {
        let mut schedule = ReconnectSchedule::default();
        let mut reconnecting = false;

        loop {
            match self.driver.open(&self.path, &self.settings) {
                Ok(io) => {
                    if !self.core.set_state_for(self.generation, PortState::Open) {
                        debug!("Closed while opening, letting go of the line");
                        return;
                    }
                    info!("Connected to serial port");
                    schedule.reset();

                    let Some(why) = self.pump(io).await else {
                        debug!("Line task cancelled");
                        return;
                    };

                    warn!(%why, "Lost serial port");
                    reconnecting = true;
                    let reason = PortState::closed(format!("{why}{RECONNECTING_SUFFIX}"));
                    if !self.core.set_state_for(self.generation, reason) {
                        return;
                    }
                }
                Err(e) => {
                    let mut reason = open_problem(&e);
                    if reconnecting {
                        reason.push_str(RECONNECTING_SUFFIX);
                    }
                    warn!(%reason, "Could not open serial port");

                    if !self.core.set_state_for(self.generation, PortState::closed(reason))
                        || !reconnecting
                    {
                        return;
                    }
                }
            }

            let delay = schedule.next_delay();
            debug!(?delay, attempt = schedule.attempts(), "Retrying serial port");

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Shovel bytes until the line is lost (returns why) or the task is cancelled (returns `None`).
    async fn pump(&mut self, io: Box<dyn LineIo>) -> Option<String> {
        let (mut reader, mut writer) = tokio::io::split(io);
        let mut buf = BytesMut::with_capacity(4096);

        // Whatever was queued for a previous line is stale.
        while self.from_owner.try_recv().is_ok() {}

        loop {
            buf.reserve(1024);

            tokio::select! {
                _ = self.cancel.cancelled() => return None,

                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => return Some("Disconnected".into()),
                    Ok(n) => {
                        trace!("Message from port: `{:?}`", &buf[..n.min(32)]);
                        self.core.emit_data(buf.split().freeze());
                    }
                    Err(e) => return Some(format!("Error: {e}")),
                },

                Some(bytes) = self.from_owner.recv() => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        return Some(format!("Error: {e}"));
                    }
                }
            }
        }
    }
}
