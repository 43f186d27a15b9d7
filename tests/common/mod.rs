#![allow(dead_code)]

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use color_eyre::{eyre::eyre, Result};
use serial_bridge::{
    config::{Config, DeviceConfig, NodeConfig},
    context::Context,
    gateway::Gateway,
    logging,
    node::Node,
    port::{driver::MemoryDriver, LineSettings},
};
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    net::{TcpSocket, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tracing::{info, Level};

pub const PATIENCE: Duration = Duration::from_secs(5);

pub async fn init_logging() {
    logging::init(Level::DEBUG, None).await;
}

/// A gateway on in-memory serial lines.
pub async fn start(driver: &Arc<MemoryDriver>, config: Config) -> Result<Gateway> {
    init_logging().await;

    Ok(Gateway::start(config, Context::new(driver.clone())).await?)
}

/// Mock devices, each with the given nodes.
pub fn mock_config(devices: &[(&str, &[&str])]) -> Config {
    Config {
        devices: devices
            .iter()
            .map(|(name, nodes)| {
                DeviceConfig::new(
                    name,
                    nodes.iter().map(|node| NodeConfig::mock(node, false)).collect(),
                )
            })
            .collect(),
        ..Config::default()
    }
}

/// "bench-1" with a "console" on `/dev/ttyMEM0`.
pub fn bench_config() -> Config {
    Config {
        devices: vec![DeviceConfig::new(
            "bench-1",
            vec![NodeConfig::serial(
                "console",
                "/dev/ttyMEM0",
                LineSettings::default(),
            )],
        )],
        ..Config::default()
    }
}

/// Poll until `condition` holds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) -> Result<()> {
    timeout(PATIENCE, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| eyre!("Timed out waiting for {what}"))
}

/// The TCP port clients of `node` connect to, once it is listening.
pub async fn tcp_port(node: &Node) -> Result<u16> {
    wait_until("listener", || node.tcp().local_port().is_some()).await?;
    node.tcp()
        .local_port()
        .ok_or_else(|| eyre!("Listener went away"))
}

pub async fn connect(port: u16) -> Result<TcpStream> {
    info!(%port, "Connecting");
    Ok(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?)
}

/// Connect from a specific loopback address.
pub async fn connect_from(source: Ipv4Addr, port: u16) -> Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::from((source, 0)))?;

    Ok(socket
        .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .await?)
}

/// The hardware side of the next open of a memory line.
pub async fn next_open(hardware: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Result<DuplexStream> {
    timeout(PATIENCE, hardware.recv())
        .await?
        .ok_or_else(|| eyre!("Memory line dropped"))
}

pub async fn read_exactly<R: AsyncReadExt + Unpin>(reader: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; n];
    timeout(PATIENCE, reader.read_exact(&mut buf)).await??;
    Ok(buf)
}

/// Read until the other side closes.
pub async fn read_to_end<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut buf = vec![];
    timeout(PATIENCE, reader.read_to_end(&mut buf)).await??;
    Ok(buf)
}

/// Nothing arrives for a little while.
pub async fn assert_silent<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<()> {
    let mut buf = [0; 64];
    match timeout(Duration::from_millis(200), reader.read(&mut buf)).await {
        Err(_) => Ok(()),
        Ok(read) => Err(eyre!("Expected silence, got {:?}", read.map(|n| buf[..n].to_vec()))),
    }
}

/// Write `config` to a fresh file.
pub fn config_file(config: &Config) -> Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("serial-bridge-{}.ron", uuid::Uuid::new_v4()));
    write_config(&path, config)?;
    Ok(path)
}

pub fn write_config(path: &PathBuf, config: &Config) -> Result<()> {
    std::fs::write(path, config.serialize_pretty()?)?;
    Ok(())
}
