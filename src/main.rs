use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use tapebridge::cli::{Cli, Commands};
use tapebridge::tape::FileTapeDrive;
use tapebridge::{logger, Config, Daemon, Result};

const DEFAULT_CONFIG: &str = "/etc/tapebridge/tapebridged.json";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse_args();

    // Initialize logging system
    logger::init(args.verbose, args.log_json)?;

    debug!("tapebridged starting");

    match run(args).await {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("Daemon failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    match args.command {
        Commands::CheckConfig => {
            let config = Config::load(&config_path)?;
            info!(
                drives = config.drives.len(),
                listen = %config.listen,
                "configuration is valid"
            );
            Ok(())
        }

        Commands::Run { listen } => {
            let mut config = Config::load(&config_path)?;
            if let Some(listen) = listen {
                config.listen = listen;
            }

            let drive_io = Arc::new(FileTapeDrive::new());
            let listener = TcpListener::bind(&config.listen).await?;
            let daemon = Daemon::new(config, drive_io)?;

            tokio::select! {
                result = daemon.listen(listener) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested, aborting active sessions");
                    daemon.shutdown();
                    Ok(())
                }
            }
        }
    }
}
