use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::Level;

use crate::{
    actions::Action,
    config::Config,
    device::build::BuildOp,
    devices::{EphemeralNode, EphemeralRequest},
    error,
    port::LineSettings,
};

/// The command line interface for serial bridge.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Also log to daily rotated files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Log more to stdout
    #[arg(short, long)]
    pub verbose: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// How much to log to stdout.
    pub fn stdout_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON request listing devices.
    ListDevices,

    /// Show an example JSON request creating an ephemeral device.
    CreateDevice,

    /// Show an example JSON request moving a build into a new stage.
    PatchBuild,

    /// Show an example JSON request opening a native port.
    OpenNativePort,

    /// Show an example JSON response to a failed action.
    Error,
}

/// The text a command prints.
pub fn handle_command(command: Commands) -> Result<String> {
    let Commands::Examples(example) = command;

    let action = match example {
        Examples::Config => return Ok(Config::example().serialize_pretty()?),
        Examples::Error => {
            let response: crate::actions::ResponseResult =
                Err(error::Error::NoSuchDevice("bench-1".into()));
            return Ok(serde_json::to_string_pretty(&response)?);
        }
        Examples::ListDevices => Action::ListDevices,
        Examples::CreateDevice => Action::CreateDevice(EphemeralRequest {
            name: "flaky-board".into(),
            description: Some("Brought up by CI".into()),
            category: None,
            tags: vec![],
            nodes: vec![EphemeralNode {
                name: "console".into(),
                tcp_port: Some(7000),
            }],
        }),
        Examples::PatchBuild => Action::PatchBuild {
            device: "bench-1".into(),
            op: BuildOp::PushStage("flash".into()),
        },
        Examples::OpenNativePort => Action::OpenNativePort {
            path: "/dev/ttyUSB0".into(),
            settings: LineSettings::default(),
        },
    };

    Ok(serde_json::to_string_pretty(&action)?)
}
