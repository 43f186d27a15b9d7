//! Access to the host's serial lines.
//!
//! [`TokioSerialDriver`] talks to real hardware.
//! [`MemoryDriver`] hands out in-memory lines, used by tests and demos.

use std::{collections::BTreeMap, fmt::Debug};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    sync::mpsc,
};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use crate::{error::Error, port::LineSettings};

/// An open line.
pub trait LineIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> LineIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Which bus an adapter sits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NativePortType {
    /// A USB adapter.
    #[serde(rename_all = "camelCase")]
    Usb {
        /// Vendor id.
        vid: u16,
        /// Product id.
        pid: u16,
        /// Serial number.
        serial_number: Option<String>,
        /// Manufacturer.
        manufacturer: Option<String>,
        /// Product name.
        product: Option<String>,
    },
    /// On the PCI bus.
    Pci,
    /// Bluetooth.
    Bluetooth,
    /// Anything else.
    Unknown,
}

/// A serial adapter found on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativePortInfo {
    /// The OS path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: String,

    /// Bus details.
    pub port_type: NativePortType,
}

impl From<serialport::SerialPortInfo> for NativePortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let port_type = match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => NativePortType::Usb {
                vid: usb.vid,
                pid: usb.pid,
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            serialport::SerialPortType::PciPort => NativePortType::Pci,
            serialport::SerialPortType::BluetoothPort => NativePortType::Bluetooth,
            serialport::SerialPortType::Unknown => NativePortType::Unknown,
        };

        Self {
            path: info.port_name,
            port_type,
        }
    }
}

/// Enumerates and opens serial lines.
pub trait SerialDriver: Send + Sync + Debug {
    /// The adapters currently present.
    fn available_ports(&self) -> Result<Vec<NativePortInfo>, Error>;

    /// Open a line. Does not block on anything but the OS call.
    fn open(&self, path: &str, settings: &LineSettings) -> Result<Box<dyn LineIo>, Error>;
}

/// Real serial lines via `tokio-serial`.
#[derive(Debug, Default)]
pub struct TokioSerialDriver;

impl SerialDriver for TokioSerialDriver {
    fn available_ports(&self) -> Result<Vec<NativePortInfo>, Error> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| Error::transport("<enumeration>", e))?;

        Ok(ports.into_iter().map(NativePortInfo::from).collect())
    }

    fn open(&self, path: &str, settings: &LineSettings) -> Result<Box<dyn LineIo>, Error> {
        debug!(%path, %settings, "Opening serial line");

        let stream = tokio_serial::new(path, settings.baud_rate)
            .data_bits(settings.byte_size.into())
            .parity(settings.parity.into())
            .stop_bits(settings.stop_bits.into())
            .open_native_async()
            .map_err(|e| Error::transport(path, e))?;

        Ok(Box::new(stream))
    }
}

#[derive(Debug)]
struct MemoryLine {
    plugged: bool,
    opens: usize,
    last_settings: Option<LineSettings>,
    device_ends: mpsc::UnboundedSender<DuplexStream>,
}

/// In-memory serial lines.
///
/// Each successful open creates a fresh duplex pipe.
/// The far end is handed to whoever plugged the line in,
/// so it can play the role of the attached hardware.
/// Dropping the far end looks like the hardware going away.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    lines: Mutex<BTreeMap<String, MemoryLine>>,
}

impl MemoryDriver {
    /// Make a line available at `path`.
    /// The receiver yields the hardware side of every open.
    pub fn plug(&self, path: &str) -> mpsc::UnboundedReceiver<DuplexStream> {
        let (tx, rx) = mpsc::unbounded_channel();

        info!(%path, "Plugging in memory line");
        self.lines.lock().insert(
            path.into(),
            MemoryLine {
                plugged: true,
                opens: 0,
                last_settings: None,
                device_ends: tx,
            },
        );

        rx
    }

    /// Make future opens of `path` fail.
    pub fn unplug(&self, path: &str) {
        if let Some(line) = self.lines.lock().get_mut(path) {
            line.plugged = false;
        }
    }

    /// Undo [`MemoryDriver::unplug`].
    pub fn replug(&self, path: &str) {
        if let Some(line) = self.lines.lock().get_mut(path) {
            line.plugged = true;
        }
    }

    /// How many times `path` was opened successfully.
    pub fn opens(&self, path: &str) -> usize {
        self.lines.lock().get(path).map_or(0, |line| line.opens)
    }

    /// The settings of the last successful open of `path`.
    pub fn last_settings(&self, path: &str) -> Option<LineSettings> {
        self.lines
            .lock()
            .get(path)
            .and_then(|line| line.last_settings.clone())
    }
}

impl SerialDriver for MemoryDriver {
    fn available_ports(&self) -> Result<Vec<NativePortInfo>, Error> {
        Ok(self
            .lines
            .lock()
            .iter()
            .filter(|(_, line)| line.plugged)
            .map(|(path, _)| NativePortInfo {
                path: path.clone(),
                port_type: NativePortType::Unknown,
            })
            .collect())
    }

    fn open(&self, path: &str, settings: &LineSettings) -> Result<Box<dyn LineIo>, Error> {
        let mut lines = self.lines.lock();

        let line = match lines.get_mut(path) {
            Some(line) if line.plugged => line,
            _ => return Err(Error::transport(path, "No such file or directory")),
        };

        let (ours, theirs) = tokio::io::duplex(4096);
        if line.device_ends.send(theirs).is_err() {
            return Err(Error::transport(path, "Nobody is attached to the line"));
        }

        line.opens += 1;
        line.last_settings = Some(settings.clone());

        Ok(Box::new(ours))
    }
}
