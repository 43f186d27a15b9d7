//! Commands: named automation run against a device, one at a time.

use std::{fmt::Debug, future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    device::{Device, DeviceEvent},
    error::Error,
};

/// Handle for running commands on a device.
pub mod api;
/// Line-based codec for command I/O.
pub mod lines;

pub use api::{CommandApi, Subscription};

/// What a command body may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body of a leaf command.
pub type CommandFn =
    Arc<dyn Fn(CommandApi) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Where a command is in its life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum CommandStatus {
    /// Waiting for the device.
    Pending,
    /// Holding the device.
    Running,
    /// Finished.
    Done,
    /// The body returned an error.
    Failed {
        /// What went wrong.
        error: String,
    },
}

/// Progress of one invocation, addressed to the session which started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandProgress {
    /// The session to tell.
    pub to: String,
    /// Name of the command.
    pub command: String,
    /// Where it is at.
    #[serde(flatten)]
    pub status: CommandStatus,
}

/// Which end of a section a terminal marker is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerCaps {
    /// Opens a section.
    Start,
    /// Closes a section.
    End,
}

/// A row of a command dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalRow {
    /// Left column.
    pub key: String,
    /// Right column.
    pub value: String,
}

/// Either something to run, or a menu of more commands.
#[derive(Clone)]
pub enum CommandBody {
    /// Runnable.
    Leaf(CommandFn),
    /// Not runnable, holds children in display order.
    Submenu(Vec<Command>),
}

/// A named action on a device.
#[derive(Clone)]
pub struct Command {
    name: String,
    label: String,
    icon: Option<String>,
    body: CommandBody,
}

impl Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Command");
        debug.field("name", &self.name).field("label", &self.label);

        match &self.body {
            CommandBody::Leaf(_) => debug.field("body", &"<fn>"),
            CommandBody::Submenu(children) => debug.field("submenu", children),
        }
        .finish()
    }
}

/// A command as shown in menus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescription {
    /// Identifies the command.
    pub name: String,
    /// Shown to users.
    pub label: String,
    /// Icon name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Children, for submenus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submenu: Option<Vec<CommandDescription>>,
}

impl Command {
    /// A runnable command.
    pub fn leaf<F, Fut>(name: &str, label: &str, icon: Option<&str>, f: F) -> Self
    where
        F: Fn(CommandApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let function: CommandFn = Arc::new(move |api| f(api).boxed());
        Self::with_body(name, label, icon, CommandBody::Leaf(function))
    }

    /// A menu of commands.
    pub fn submenu(name: &str, label: &str, icon: Option<&str>, children: Vec<Command>) -> Self {
        Self::with_body(name, label, icon, CommandBody::Submenu(children))
    }

    /// A command from loose parts, e.g. a scripting layer.
    /// Exactly one of `function` and `submenu` must be given.
    pub fn from_parts(
        name: &str,
        label: &str,
        icon: Option<&str>,
        function: Option<CommandFn>,
        submenu: Option<Vec<Command>>,
    ) -> Result<Self, Error> {
        let body = match (function, submenu) {
            (Some(function), None) => CommandBody::Leaf(function),
            (None, Some(children)) => CommandBody::Submenu(children),
            (Some(_), Some(_)) => {
                return Err(Error::BadUsage(format!(
                    "Command `{name}` has both a function and a submenu"
                )))
            }
            (None, None) => {
                return Err(Error::BadUsage(format!(
                    "Command `{name}` has neither a function nor a submenu"
                )))
            }
        };

        Ok(Self::with_body(name, label, icon, body))
    }

    fn with_body(name: &str, label: &str, icon: Option<&str>, body: CommandBody) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            icon: icon.map(Into::into),
            body,
        }
    }

    /// Identifies the command.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shown to users.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Icon name.
    pub fn icon(&self) -> Option<&str> {
        self.icon.as_deref()
    }

    /// Children, if this is a submenu.
    pub fn children(&self) -> Option<&[Command]> {
        match &self.body {
            CommandBody::Leaf(_) => None,
            CommandBody::Submenu(children) => Some(children),
        }
    }

    /// True if [`Command::run`] may be called.
    pub fn is_runnable(&self) -> bool {
        matches!(self.body, CommandBody::Leaf(_))
    }

    /// The command tree as shown in menus.
    pub fn describe(&self) -> CommandDescription {
        CommandDescription {
            name: self.name.clone(),
            label: self.label.clone(),
            icon: self.icon.clone(),
            submenu: self
                .children()
                .map(|children| children.iter().map(Command::describe).collect()),
        }
    }

    /// Run the command on `device`, waiting for any other command on it to finish first.
    ///
    /// With an `origin`, progress is published as [`DeviceEvent::Command`] addressed to it.
    /// Receivers registered by the body are cancelled when it ends, however it ends.
    pub async fn run(&self, device: &Arc<Device>, origin: Option<&str>) -> Result<(), Error> {
        let CommandBody::Leaf(function) = &self.body else {
            return Err(Error::NotRunnable(format!("{} ({})", self.name, self.label)));
        };

        let progress = |status: CommandStatus| {
            if let Some(origin) = origin {
                device.publish(DeviceEvent::Command(CommandProgress {
                    to: origin.into(),
                    command: self.name.clone(),
                    status,
                }));
            }
        };

        progress(CommandStatus::Pending);
        let _exclusive = device.command_mutex().lock().await;
        progress(CommandStatus::Running);
        info!(device = %device.id(), command = %self.name, "Running command");

        let (api, _subscriptions) = CommandApi::new(device.clone(), origin.map(Into::into));

        match function(api).await {
            Ok(()) => {
                progress(CommandStatus::Done);
                Ok(())
            }
            Err(e) => {
                let problem = e.to_string();
                warn!(device = %device.id(), command = %self.name, %problem, "Command failed");
                progress(CommandStatus::Failed {
                    error: problem.clone(),
                });

                Err(Error::CommandFailed {
                    command: self.name.clone(),
                    problem,
                })
            }
        }
    }
}

/// Every command in the trees, depth first, submenus included.
pub fn iter_commands(commands: &[Command]) -> impl Iterator<Item = &Command> {
    let mut stack: Vec<&Command> = commands.iter().rev().collect();

    std::iter::from_fn(move || {
        let command = stack.pop()?;
        if let Some(children) = command.children() {
            stack.extend(children.iter().rev());
        }
        Some(command)
    })
}

/// The commands offered for devices.
#[derive(Debug, Clone, Default)]
pub struct CommandSet {
    commands: Vec<Command>,
}

impl CommandSet {
    /// A set of top level commands.
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// Top level commands.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Find a command anywhere in the tree.
    pub fn find(&self, name: &str) -> Result<&Command, Error> {
        iter_commands(&self.commands)
            .find(|command| command.name == name)
            .ok_or_else(|| Error::NoSuchCommand(name.into()))
    }

    /// The whole tree as shown in menus.
    pub fn describe(&self) -> Vec<CommandDescription> {
        self.commands.iter().map(Command::describe).collect()
    }
}
