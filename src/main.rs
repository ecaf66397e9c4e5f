use std::{env, error::Error};

use log::info;
use loris::{
    config::{LorisConfig, LorisConfigLoadError},
    harness::Harness,
};
use tokio::sync::broadcast;

#[cfg(feature = "mimalloc")]
mod alloc {
    use mimalloc::MiMalloc;

    #[global_allocator]
    static GLOBAL: MiMalloc = MiMalloc;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = dotenvy::dotenv();
    #[cfg(debug_assertions)]
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();
    #[cfg(not(debug_assertions))]
    env_logger::init();

    let current_dir = env::current_dir()?;
    let config_file = current_dir.join("loris.toml");

    let config = match LorisConfig::load(&config_file) {
        Ok(config) => {
            // Save config to fill missing fields
            let _ = config.save(&config_file);
            Ok(config)
        }
        Err(error) => match error {
            LorisConfigLoadError::Io(_) => {
                // If config loading fails we generate a default config
                let default_config = LorisConfig::default();
                let _ = default_config.save(&config_file);
                Ok(default_config)
            }
            LorisConfigLoadError::Parse(parse_error) => Err(parse_error),
        },
    }?;

    let (stop, _) = broadcast::channel(1);
    let harness = Harness::new(config.clone(), stop.clone());
    let mut run = tokio::spawn(async move { harness.run().await });

    let report = {
        use futures::future::{select_all, FutureExt};
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let sigint_fut = sigint.recv().boxed();
        let sigterm_fut = sigterm.recv().boxed();
        let mut signals = select_all([sigint_fut, sigterm_fut]);

        tokio::select! {
            result = &mut run => result??,
            _ = &mut signals => {
                info!("Received signal, stopping...");
                let _ = stop.send(());
                run.await??
            }
        }
    };

    print!("{report}");
    if let Some(path) = &config.report_path {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        info!("Report written to {path}");
    }
    Ok(())
}
