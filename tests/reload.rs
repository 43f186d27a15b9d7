use std::{net::Ipv4Addr, sync::Arc};

use color_eyre::Result;
use pretty_assertions::assert_eq;
use serial_bridge::{
    actions::{Action, Response},
    config::{Config, DeviceConfig, NodeConfig},
    devices::DeviceChange,
    port::driver::MemoryDriver,
};
use tokio::net::TcpListener;

mod common;
use common::*;

#[tokio::test]
async fn planned_reload_from_file() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let before = mock_config(&[("a", &["x"]), ("b", &["x"]), ("c", &["x"])]);
    let path = config_file(&before)?;
    let gateway = start(&driver, before).await?.with_config_path(&path);
    let untouched = gateway.devices().get("a")?;

    let after = mock_config(&[("a", &["x"]), ("b", &["x", "y"]), ("d", &["x"])]);
    write_config(&path, &after)?;

    let first = gateway.plan_reload()?;
    let second = gateway.plan_reload()?;
    assert_eq!(first, second);

    let Response::Reload(done) = gateway
        .perform(Action::ApplyReload {
            spec: Some(first.clone()),
        })
        .await?
    else {
        panic!("Expected a reload");
    };
    assert_eq!(done, first);

    let config_of = |name: &str| after.devices.iter().find(|config| config.name == name);

    for (id, change) in &first.change {
        match change {
            DeviceChange::Remove => assert!(gateway.devices().get(id).is_err()),
            DeviceChange::Update => {
                let device = gateway.devices().get(id)?;
                assert!(device.matches_config(config_of(device.name()).expect("configured")));
            }
        }
    }
    for name in &first.add {
        let device = gateway
            .devices()
            .find(|device| device.name() == name)
            .expect("added");
        assert!(device.matches_config(config_of(name).expect("configured")));
    }

    assert!(Arc::ptr_eq(&untouched, &gateway.devices().get("a")?));
    assert!(gateway.plan_reload()?.is_empty());

    std::fs::remove_file(path)?;
    Ok(())
}

#[tokio::test]
async fn updated_devices_keep_id_sessions_build_and_port() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());

    let pinned = {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        listener.local_addr()?.port()
    };
    let device = |description: &str| DeviceConfig {
        description: Some(description.into()),
        ..DeviceConfig::new(
            "bench",
            vec![NodeConfig {
                tcp_port: Some(pinned),
                ..NodeConfig::mock("console", false)
            }],
        )
    };
    let before = Config {
        devices: vec![device("old")],
        ..Config::default()
    };
    let path = config_file(&before)?;
    let gateway = start(&driver, before).await?.with_config_path(&path);

    let old = gateway.devices().get("bench")?;
    let old_node = old.node("console")?.clone();
    assert_eq!(tcp_port(&old_node).await?, pinned);

    old.start_build("nightly", None, true);
    old.web_connections().add("10.0.0.9").await;
    let mut old_client = connect(pinned).await?;
    wait_until("old client", || old_node.tcp_connections().len() == 1).await?;

    write_config(
        &path,
        &Config {
            devices: vec![device("new")],
            ..Config::default()
        },
    )?;
    let Response::Reload(done) = gateway.perform(Action::ApplyReload { spec: None }).await? else {
        panic!("Expected a reload");
    };
    assert_eq!(done.change.get("bench"), Some(&DeviceChange::Update));

    let new = gateway.devices().get("bench")?;
    assert!(!Arc::ptr_eq(&old, &new));
    assert!(!old.is_alive());
    assert_eq!(new.config().description.as_deref(), Some("new"));
    assert_eq!(new.build().expect("build carried over").name, "nightly");
    assert_eq!(new.web_connections().len(), 1);

    // The old listener let go of the port, the new one has it.
    assert_eq!(read_to_end(&mut old_client).await?, Vec::<u8>::new());
    let new_node = new.node("console")?.clone();
    assert_eq!(tcp_port(&new_node).await?, pinned);
    let _new_client = connect(pinned).await?;
    wait_until("new client", || new_node.tcp_connections().len() == 1).await?;

    std::fs::remove_file(path)?;
    Ok(())
}

#[tokio::test]
async fn broken_config_changes_nothing() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let before = mock_config(&[("a", &["x"])]);
    let path = config_file(&before)?;
    let gateway = start(&driver, before).await?.with_config_path(&path);

    std::fs::write(&path, "this is not ron")?;
    assert!(gateway.perform(Action::PlanReload).await.is_err());

    write_config(&path, &mock_config(&[("a", &["x", "x"])]))?;
    assert!(gateway
        .perform(Action::ApplyReload { spec: None })
        .await
        .is_err());

    assert_eq!(gateway.devices().len(), 1);
    assert!(gateway.devices().get("a")?.is_alive());

    std::fs::remove_file(path)?;
    Ok(())
}
