use std::{
    fs::OpenOptions,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber once. The `LOG` environment variable
/// overrides `default_level`; `logfile` switches the sink from stdout to an
/// append-mode file.
pub fn configure(name: impl Into<String>, logfile: Option<&Path>, default_level: Option<&str>) {
    if INITIALIZED.swap(true, Ordering::Acquire) {
        return;
    }

    LogTracer::builder()
        .with_max_level(log::LevelFilter::Debug)
        .init()
        .expect("Failed to create logger");

    let env_filter = EnvFilter::try_from_env("LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level.unwrap_or("info")));

    match logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("Opening log file");
            let formatting_layer = BunyanFormattingLayer::new(name.into(), move || {
                file.try_clone().expect("Cloning log file handle")
            });
            let subscriber = Registry::default()
                .with(env_filter)
                .with(JsonStorageLayer)
                .with(formatting_layer);
            set_global_default(subscriber).expect("Setting subscriber");
        }
        None => {
            let formatting_layer = BunyanFormattingLayer::new(name.into(), std::io::stdout);
            let subscriber = Registry::default()
                .with(env_filter)
                .with(JsonStorageLayer)
                .with(formatting_layer);
            set_global_default(subscriber).expect("Setting subscriber");
        }
    }
}
