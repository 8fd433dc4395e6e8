use std::path::Path;

use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoggerInitError {
    #[error(transparent)]
    LogError(#[from] log::SetLoggerError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Install the global logger. Lines go to stderr, and additionally to
/// `file` when given; the capture library points this at its log file so a
/// hooked host does not spray its own stderr.
pub fn init_logger(level: LevelFilter, file: Option<&Path>) -> Result<(), LoggerInitError> {
    let mut logger = Dispatch::new()
        .level(level)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} - [{}] - ({}) - {}",
                Local::now().format("%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(std::io::stderr());

    if let Some(path) = file {
        logger = logger.chain(fern::log_file(path)?);
    }

    logger.apply()?;
    Ok(())
}
