//! Everything the process serves, and the actions users perform on it.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    actions::{Action, Response, ResponseResult},
    command::CommandSet,
    config::Config,
    context::Context,
    device::DeviceSnapshot,
    devices::{Devices, ReloadScope, ReloadSpec},
    error::Error,
    native_port::NativePortRegistry,
    remote::Remote,
};

/// The devices, native ports and peers of one process.
#[derive(Debug)]
pub struct Gateway {
    config_path: Option<PathBuf>,
    config: Mutex<Config>,
    context: Context,
    devices: Arc<Devices>,
    commands: CommandSet,
    native_ports: Arc<NativePortRegistry>,
    remotes: Vec<Remote>,
}

impl Gateway {
    /// Build everything `config` describes and open the devices.
    pub async fn start(config: Config, context: Context) -> Result<Self, Error> {
        config.validate()?;

        for host in &config.blacklist {
            context.blacklist.add_resolved(host).await;
        }

        let devices = Arc::new(Devices::new(context.clone()));
        devices
            .apply_reload(&config.devices, ReloadScope::All)
            .await?;
        info!("Serving {} device(s)", devices.len());

        Ok(Self {
            config_path: None,
            native_ports: NativePortRegistry::new(&config.ports_find, context.driver.clone()),
            remotes: config.remotes.iter().map(Remote::from).collect(),
            config: Mutex::new(config),
            context,
            devices,
            commands: CommandSet::default(),
        })
    }

    /// Re-read the configuration from this file on reload.
    pub fn with_config_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Commands offered on every device.
    pub fn with_commands(mut self, commands: CommandSet) -> Self {
        self.commands = commands;
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> Config {
        self.config.lock().clone()
    }

    /// The collaborators everything is built with.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The local devices.
    pub fn devices(&self) -> &Arc<Devices> {
        &self.devices
    }

    /// The commands offered on every device.
    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    /// The native ports.
    pub fn native_ports(&self) -> &Arc<NativePortRegistry> {
        &self.native_ports
    }

    /// The peer gateways.
    pub fn remotes(&self) -> &[Remote] {
        &self.remotes
    }

    /// Local devices followed by what the peers last reported.
    pub fn all_devices(&self) -> Vec<DeviceSnapshot> {
        let mut devices = self.devices.snapshots();
        for remote in &self.remotes {
            devices.extend(remote.devices());
        }
        devices
    }

    fn read_config(&self) -> Result<Config, Error> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| Error::BadUsage("No configuration file to reload from".into()))?;

        let config = Config::new_from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    /// What reloading the configuration file would do.
    pub fn plan_reload(&self) -> Result<ReloadSpec, Error> {
        let config = self.read_config()?;
        Ok(self.devices.plan_reload(&config.devices))
    }

    /// Re-read the configuration file and apply it.
    ///
    /// Blacklisted hosts from the file are added to the blacklist, never removed from it.
    pub async fn reload(&self, scope: ReloadScope) -> Result<ReloadSpec, Error> {
        let config = self.read_config()?;

        let done = self.devices.apply_reload(&config.devices, scope).await?;

        for host in &config.blacklist {
            if !self.context.blacklist.contains(host) {
                self.context.blacklist.add_resolved(host).await;
            }
        }

        if config.ports_find != self.config.lock().ports_find {
            warn!("Native port settings changed, restart to apply");
        }

        *self.config.lock() = config;
        Ok(done)
    }

    /// Perform an action.
    pub async fn perform(&self, action: Action) -> ResponseResult {
        debug!(?action, "Performing");

        match action {
            Action::ListDevices => Ok(Response::Devices(self.all_devices())),
            Action::GetDevice { id } => Ok(Response::Device(self.devices.get(&id)?.snapshot())),
            Action::CreateDevice(request) => {
                let device = self.devices.create_ephemeral(request)?;
                Ok(Response::Device(device.snapshot()))
            }
            Action::RunCommand {
                device,
                command,
                origin,
            } => {
                let device = self.devices.get(&device)?;
                self.commands
                    .find(&command)?
                    .run(&device, origin.as_deref())
                    .await?;
                Ok(Response::Ok)
            }
            Action::ListCommands => Ok(Response::Commands(self.commands.describe())),
            Action::LockAction {
                device,
                action,
                credentials,
            } => {
                let device = self.devices.get(&device)?;
                let owner = device.jenkins_lock_action(action, &credentials).await?;
                Ok(Response::LockOwner(owner))
            }
            Action::StartBuild {
                device,
                name,
                link,
                external,
            } => {
                let build = self
                    .devices
                    .get(&device)?
                    .start_build(&name, link, external);
                Ok(Response::Build(Some(build)))
            }
            Action::PatchBuild { device, op } => {
                let build = self.devices.get(&device)?.build_op(&op)?;
                Ok(Response::Build(Some(build)))
            }
            Action::RemoveBuild { device } => {
                let build = self.devices.get(&device)?.end_build();
                Ok(Response::Build(build.map(|build| build.snapshot())))
            }
            Action::SetLockOwner { device, owner } => {
                self.devices.get(&device)?.set_jenkins_lock_owner(owner);
                Ok(Response::Ok)
            }
            Action::PlanReload => Ok(Response::Reload(self.plan_reload()?)),
            Action::ApplyReload { spec } => {
                let scope = spec.map_or(ReloadScope::All, ReloadScope::Planned);
                Ok(Response::Reload(self.reload(scope).await?))
            }
            Action::ListNativePorts => Ok(Response::NativePorts(self.native_ports.list()?)),
            Action::OpenNativePort { path, settings } => Ok(Response::NativePort(
                self.native_ports.open(&path, settings).await?,
            )),
            Action::KeepAliveNativePort { path } => {
                self.native_ports.keep_alive(&path)?;
                Ok(Response::Ok)
            }
            Action::Blacklist { host } => {
                self.context.blacklist.add_resolved(&host).await;
                Ok(Response::Ok)
            }
            Action::ListBlacklist => Ok(Response::Hosts(self.context.blacklist.hosts())),
            Action::SetUserInfo {
                host,
                display_name,
                email,
            } => {
                let user = self
                    .context
                    .users
                    .set_user_info(&host, &display_name, email)
                    .await;
                Ok(Response::User(user))
            }
        }
    }

    /// Kill every device and close every native port.
    pub fn shutdown(&self) {
        info!("Shutting down");
        self.devices.clear();
        self.native_ports.reset();
    }
}
