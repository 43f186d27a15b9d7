use std::{net::Ipv4Addr, sync::Arc};

use color_eyre::Result;
use pretty_assertions::assert_eq;
use serial_bridge::{
    actions::Action,
    config::Config,
    node::NodeEvent,
    port::{driver::MemoryDriver, TransportExt},
};
use tokio::io::AsyncWriteExt;

mod common;
use common::*;

#[tokio::test]
async fn typing_reaches_other_clients_but_is_not_echoed() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let mut hardware = driver.plug("/dev/ttyMEM0");
    let gateway = start(&driver, bench_config()).await?;

    let mut line = next_open(&mut hardware).await?;
    let device = gateway.devices().get("bench-1")?;
    let node = device.node("console")?.clone();
    wait_until("console open", || node.port().is_open()).await?;

    let port = tcp_port(&node).await?;
    let mut x = connect(port).await?;
    let mut y = connect(port).await?;
    wait_until("both clients", || node.tcp_connections().len() == 2).await?;

    x.write_all(b"AT\r\n").await?;
    assert_eq!(read_exactly(&mut line, 4).await?, b"AT\r\n");
    assert_eq!(read_exactly(&mut y, 4).await?, b"AT\r\n");

    // The first thing X sees is the line's answer, not its own bytes.
    line.write_all(b"OK\r\n").await?;
    assert_eq!(read_exactly(&mut x, 4).await?, b"OK\r\n");
    assert_eq!(read_exactly(&mut y, 4).await?, b"OK\r\n");
    assert_silent(&mut x).await?;

    Ok(())
}

#[tokio::test]
async fn every_other_client_gets_writes() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let gateway = start(&driver, mock_config(&[("bench-1", &["console"])])).await?;
    let node = gateway.devices().get("bench-1")?.node("console")?.clone();

    let port = tcp_port(&node).await?;
    let mut clients = vec![];
    for _ in 0..4 {
        clients.push(connect(port).await?);
    }
    wait_until("all clients", || node.tcp_connections().len() == 4).await?;

    clients[0].write_all(b"reboot\r\n").await?;
    for other in &mut clients[1..] {
        assert_eq!(read_exactly(other, 8).await?, b"reboot\r\n");
    }
    assert_silent(&mut clients[0]).await?;

    let mock = node.port().as_mock().expect("mock line");
    assert_eq!(mock.written().concat(), b"reboot\r\n".to_vec());

    Ok(())
}

#[tokio::test]
async fn clients_are_forgotten_on_disconnect() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let gateway = start(&driver, mock_config(&[("bench-1", &["console"])])).await?;
    let node = gateway.devices().get("bench-1")?.node("console")?.clone();
    let mut events = node.subscribe();

    let port = tcp_port(&node).await?;
    let client = connect(port).await?;
    wait_until("client", || node.tcp_connections().len() == 1).await?;
    drop(client);
    wait_until("no clients", || node.tcp_connections().is_empty()).await?;

    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
        match event {
            NodeEvent::TcpConnect(_) => seen.push("connect"),
            NodeEvent::TcpDisconnect(_) => seen.push("disconnect"),
            _ => {}
        }
    }
    assert_eq!(seen, vec!["connect", "disconnect"]);

    Ok(())
}

#[tokio::test]
async fn removed_devices_drop_their_clients() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let gateway = start(&driver, mock_config(&[("bench-1", &["console"])])).await?;
    let node = gateway.devices().get("bench-1")?.node("console")?.clone();

    let port = tcp_port(&node).await?;
    let mut client = connect(port).await?;
    wait_until("client", || node.tcp_connections().len() == 1).await?;

    gateway.devices().remove("bench-1")?;
    assert_eq!(read_to_end(&mut client).await?, Vec::<u8>::new());

    Ok(())
}

// Other loopback addresses are only routable out of the box on Linux.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn blacklisted_hosts_are_refused() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let config = Config {
        blacklist: vec!["127.0.0.2".into()],
        ..mock_config(&[("bench-1", &["console"])])
    };
    let gateway = start(&driver, config).await?;
    let node = gateway.devices().get("bench-1")?.node("console")?.clone();
    let port = tcp_port(&node).await?;

    let mut refused = connect_from(Ipv4Addr::new(127, 0, 0, 2), port).await?;
    assert_eq!(
        read_to_end(&mut refused).await?,
        b"Connection refused: 127.0.0.2 is blacklisted\r\n".to_vec()
    );
    assert!(node.tcp_connections().is_empty());

    gateway
        .perform(Action::Blacklist {
            host: "127.0.0.3".into(),
        })
        .await?;
    let mut refused = connect_from(Ipv4Addr::new(127, 0, 0, 3), port).await?;
    assert!(!read_to_end(&mut refused).await?.is_empty());

    let _welcome = connect(port).await?;
    wait_until("unaffected client", || node.tcp_connections().len() == 1).await?;
    assert_eq!(node.tcp_connections().list()[0].host, "127.0.0.1");

    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn writers_on_different_hosts_collide() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let gateway = start(&driver, mock_config(&[("bench-1", &["console"])])).await?;
    let node = gateway.devices().get("bench-1")?.node("console")?.clone();
    let port = tcp_port(&node).await?;

    let mut a = connect_from(Ipv4Addr::new(127, 0, 0, 4), port).await?;
    let mut b = connect_from(Ipv4Addr::new(127, 0, 0, 5), port).await?;
    wait_until("both clients", || node.tcp_connections().len() == 2).await?;
    let mut events = node.subscribe();

    a.write_all(b"a").await?;
    read_exactly(&mut b, 1).await?;
    b.write_all(b"b").await?;
    read_exactly(&mut a, 1).await?;

    let users = loop {
        if let NodeEvent::WriteCollision { users } = events.recv().await? {
            break users;
        }
    };
    let hosts: Vec<_> = users.into_iter().map(|user| user.host).collect();
    assert_eq!(hosts, vec!["127.0.0.4".to_string(), "127.0.0.5".to_string()]);

    Ok(())
}
