use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serial_bridge::{
    actions::{Action, Response},
    command::{BoxError, Command, CommandApi, CommandSet, CommandStatus},
    config::{Config, DeviceConfig, NodeConfig},
    device::{build::BuildOp, DeviceEvent},
    port::driver::MemoryDriver,
};

mod common;
use common::*;

fn loopback_config() -> Config {
    Config {
        devices: vec![DeviceConfig::new(
            "bench-1",
            vec![NodeConfig::mock("console", true)],
        )],
        ..Config::default()
    }
}

fn commands() -> CommandSet {
    CommandSet::new(vec![
        Command::leaf("slow", "Slow", None, |_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<(), BoxError>(())
        }),
        Command::leaf("ping", "Ping", None, |api: CommandApi| async move {
            let mut lines = api.receive("console", true)?;
            api.send_line("console", "ping")?;

            match lines.recv().await {
                Some(line) if line == Bytes::from_static(b"ping\r\n") => Ok::<(), BoxError>(()),
                other => Err(format!("unexpected {other:?}").into()),
            }
        }),
        Command::submenu(
            "power",
            "Power",
            None,
            vec![Command::leaf("off", "Off", None, |_| async {
                Err::<(), BoxError>("relay stuck".into())
            })],
        ),
    ])
}

fn run(command: &str, origin: &str) -> Action {
    Action::RunCommand {
        device: "bench-1".into(),
        command: command.into(),
        origin: Some(origin.into()),
    }
}

#[tokio::test]
async fn concurrent_commands_take_turns() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let gateway = start(&driver, loopback_config())
        .await?
        .with_commands(commands());
    let mut events = gateway.devices().get("bench-1")?.subscribe();

    let (slow, ping) = tokio::join!(
        gateway.perform(run("slow", "session-a")),
        gateway.perform(run("ping", "session-b")),
    );
    slow?;
    ping?;

    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
        if let DeviceEvent::Command(progress) = event {
            seen.push((progress.command, progress.status));
        }
    }

    let position = |command: &str, status: CommandStatus| {
        seen.iter()
            .position(|entry| *entry == (command.to_string(), status.clone()))
            .expect("progress reported")
    };
    let (earlier, later) =
        if position("slow", CommandStatus::Running) < position("ping", CommandStatus::Running) {
            ("slow", "ping")
        } else {
            ("ping", "slow")
        };
    assert!(position(earlier, CommandStatus::Done) < position(later, CommandStatus::Running));

    Ok(())
}

#[tokio::test]
async fn failures_and_menus() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let gateway = start(&driver, loopback_config())
        .await?
        .with_commands(commands());

    let failed = gateway.perform(run("off", "session-a")).await;
    assert!(matches!(
        failed,
        Err(serial_bridge::error::Error::CommandFailed { .. })
    ));

    let menu = gateway.perform(run("power", "session-a")).await;
    assert!(matches!(
        menu,
        Err(serial_bridge::error::Error::NotRunnable(_))
    ));

    let Response::Commands(tree) = gateway.perform(Action::ListCommands).await? else {
        panic!("Expected commands");
    };
    let names: Vec<_> = tree.iter().map(|command| command.name.as_str()).collect();
    assert_eq!(names, vec!["slow", "ping", "power"]);
    assert_eq!(tree[2].submenu.as_ref().map(Vec::len), Some(1));

    // The device is free again.
    gateway.perform(run("ping", "session-a")).await?;

    Ok(())
}

#[tokio::test]
async fn smoke_test_build() -> Result<()> {
    let driver = Arc::new(MemoryDriver::default());
    let gateway = start(&driver, loopback_config()).await?;
    let patch = |op| Action::PatchBuild {
        device: "bench-1".into(),
        op,
    };

    gateway
        .perform(Action::StartBuild {
            device: "bench-1".into(),
            name: "smoke-test".into(),
            link: None,
            external: false,
        })
        .await?;
    gateway.perform(patch(BuildOp::PushStage("boot".into()))).await?;
    gateway.perform(patch(BuildOp::PushTask("flash".into()))).await?;
    gateway.perform(patch(BuildOp::PopTask)).await?;
    gateway.perform(patch(BuildOp::PopStage)).await?;

    let Response::Build(Some(build)) = gateway.perform(patch(BuildOp::Result(true))).await? else {
        panic!("Expected the final build");
    };
    assert_eq!(build.name, "smoke-test");
    assert_eq!(build.result, Some(true));
    assert_eq!(build.stage, None);
    assert_eq!(build.task, None);
    assert!(build.ended);

    let device = gateway.devices().get("bench-1")?;
    assert_eq!(device.build(), None);
    assert_eq!(device.snapshot().build, None);

    Ok(())
}
