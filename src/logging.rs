use std::{io, path::Path};

use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

pub const LOG_FILE: &str = "crawler.log";

/// Console verbosity for a `-v` count.
pub fn console_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Installs the console and file layers.
///
/// The file layer writes `crawler.log` under `root` at DEBUG. Keep the
/// returned guard alive until the run ends or buffered lines are lost.
pub fn init(root: &Path, verbose: u8) -> crate::Result<WorkerGuard> {
    let (file_writer, guard) = tracing_appender::non_blocking(rolling::never(root, LOG_FILE));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(console_level(verbose));

    let file_layer = fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    Ok(guard)
}
