use clap::Parser;
use color_eyre::Result;
use serial_bridge::{
    cli,
    config::Config,
    context::Context,
    devices::ReloadScope,
    gateway::Gateway,
    logging,
    user::UserDirectory,
};
use tracing::{debug, error, info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// SIGHUP where there is such a thing.
struct Hangups {
    #[cfg(unix)]
    signal: Signal,
}

impl Hangups {
    fn new() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            signal: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        self.signal.recv().await;

        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut cli = cli::Cli::parse();

    if let Some(command) = cli.command.take() {
        println!("{}", cli::handle_command(command)?);

        return Ok(());
    }

    logging::init(
        cli.stdout_level(),
        cli.log_dir.clone().map(|dir| (Level::DEBUG, dir)),
    )
    .await;

    let config = if let Some(config_path) = &cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };

    let context = Context::default().with_users(
        UserDirectory::default().with_avatar_template(config.user_directory.avatar_template.clone()),
    );

    let mut gateway = Gateway::start(config, context).await?;
    if let Some(config_path) = &cli.config {
        gateway = gateway.with_config_path(config_path);
    }

    let mut hangups = Hangups::new()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, quitting");
                break;
            }
            _ = hangups.recv() => {
                if !gateway.config().config_reloadable {
                    info!("Told to hang up, quitting");
                    break;
                }

                info!("Told to hang up, reloading");
                match gateway.reload(ReloadScope::All).await {
                    Ok(done) => info!(add = ?done.add, change = ?done.change, "Reloaded"),
                    Err(e) => error!(%e, "Could not reload"),
                }
            }
        }
    }

    gateway.shutdown();
    logging::shutdown();

    Ok(())
}
