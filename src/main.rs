use log::{error, info, warn};
use std::io;
use std::sync::Arc;

use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use gpiowatch::{AppConfig, GpioError, GpioManager, SysfsStorage, Watcher};

#[tokio::main]
async fn main() -> Result<(), GpioError> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIOWATCH_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(
        AppConfig::load_from_file(&config_path)
            .unwrap_or_else(|e| panic!("Failed to load config: {e}")),
    );

    let watcher =
        Arc::new(Watcher::new().unwrap_or_else(|e| panic!("Failed to create watcher: {e}")));
    let storage = Arc::new(SysfsStorage::new(&config.base_path));
    let manager = Arc::new(GpioManager::new(config.clone(), storage, watcher)?);

    let mut events = BroadcastStream::new(manager.subscribe());
    let mut watch = tokio::task::spawn_blocking({
        let manager = Arc::clone(&manager);
        move || manager.watch()
    });

    info!(
        "Watching {} pins under {}...",
        config.gpios.len(),
        config.base_path.display()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let finished = loop {
        tokio::select! {
            Some(event) = events.next() => {
                match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(text) => info!("{text}"),
                        Err(e) => warn!("Unable to encode event: {e}"),
                    },
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        warn!("Event stream lagged by {n} messages");
                    }
                }
            }
            joined = &mut watch => break Some(joined),
            _ = &mut ctrl_c => {
                info!("Shutting down...");
                break None;
            }
        }
    };

    let joined = match finished {
        Some(joined) => joined,
        None => {
            manager.shutdown()?;
            watch.await
        }
    };
    let watched = joined.map_err(io::Error::from)?;
    if let Err(e) = &watched {
        error!("Watch loop failed: {e}");
    }

    manager.unexport_all()?;
    watched
}
