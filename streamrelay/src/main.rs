use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use streamrelay_core::config::Settings;
use tracing::{error, info};

mod cmdline;
mod setup_tracing;

/// How long blocked tasks get to finish once the relay has returned. Reading stdin parks a
/// blocking thread that cannot be interrupted, so the runtime must not wait for it forever.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    let matches = cmdline::root_cli().get_matches();
    let config = matches.get_one::<PathBuf>(cmdline::ARG_CONFIG).cloned();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(config));
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

    if let Err(e) = result {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run(config: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let settings = Settings::load(config.as_deref())?;
    info!(
        app = %settings.app.name,
        version = %settings.app.version,
        transformations = settings.transform.len(),
        "Starting relay"
    );

    streamrelay_core::run(settings)
        .await
        .map_err(|e| format!("Error running relay: {e:?}"))?;

    Ok(())
}
