use std::error::Error;
use std::io;
use std::sync::Arc;

use log::{error, info};

use webman::runtime::StdioRuntime;
use webman::{Config, Service};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    pretty_env_logger::init();

    let matches = Config::app().get_matches();
    let config = Config::from_matches(&matches)?;
    info!(
        "webhook on {}{}, outbound timeout {:?}",
        config.webhook_addr, config.webhook_endpoint, config.timeout
    );

    let service = Service::new(config, Arc::new(StdioRuntime::new()));
    let outcome: Result<(), Box<dyn Error + Send + Sync>> = tokio::select! {
        res = service.start() => res.map_err(Into::into),
        signal = shutdown_signal() => match signal {
            Ok(()) => {
                info!("received shutdown signal");
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    };

    if let Err(e) = service.close().await {
        error!("error while closing: {}", e);
    }
    outcome?;
    info!("gracefully stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
