//! Logging.
//!
//! This module provides a simple logger that starts out writing to stderr
//! and can be switched to the target requested by the configuration once
//! that is available. It is installed via [`Logger::init`] which must be
//! called before any log output is produced.

use std::{fs, io, process};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use log::{LevelFilter, Log, Metadata, Record, error};
use crate::config::{Config, LogTarget};
use crate::error::Failed;


//------------ Logger --------------------------------------------------------

/// The logger for the entire process.
///
/// There is only ever one value of this type which is installed as the
/// global logger by [`Logger::init`]. Early on, it logs everything of
/// warning level or higher to stderr. After configuration is available,
/// [`Logger::switch`] moves logging to the configured target and level.
pub struct Logger {
    /// The currently active log target.
    target: Mutex<Target>,
}

/// The actual target of log output.
enum Target {
    /// Write to stderr.
    Stderr,

    /// Write to the given open file.
    File(fs::File),
}

/// The static logger instance.
///
/// This is a static rather than a `OnceLock` since we need it before
/// configuration parsing starts.
static LOGGER: Logger = Logger {
    target: Mutex::new(Target::Stderr),
};

impl Logger {
    /// Initializes logging to stderr.
    pub fn init() -> Result<(), Failed> {
        if log::set_logger(&LOGGER).is_err() {
            eprintln!("Failed to initialize logger. Aborting.");
            return Err(Failed)
        }
        log::set_max_level(LevelFilter::Warn);
        Ok(())
    }

    /// Switches logging to the target requested by the configuration.
    pub fn switch(config: &Config) -> Result<(), Failed> {
        let target = match config.log_target {
            LogTarget::Stderr => Target::Stderr,
            LogTarget::File(ref path) => {
                Target::File(Self::open_log_file(path)?)
            }
        };
        *LOGGER.target.lock().expect("poisoned lock") = target;
        log::set_max_level(config.log_level);
        Ok(())
    }

    /// Opens the log file, creating it if necessary.
    fn open_log_file(path: &PathBuf) -> Result<fs::File, Failed> {
        fs::OpenOptions::new().create(true).append(true).open(path)
        .map_err(|err| {
            error!(
                "Failed to open log file {}: {}", path.display(), err
            );
            Failed
        })
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return
        }
        let mut target = self.target.lock().expect("poisoned lock");
        let res = match *target {
            Target::Stderr => {
                writeln!(io::stderr().lock(), "{}", record.args())
            }
            Target::File(ref mut file) => {
                writeln!(
                    file, "[{}] [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(), record.args()
                )
            }
        };
        if res.is_err() {
            // There is nothing sensible left to log to, so bail out.
            eprintln!("Logging failed. Aborting.");
            process::exit(1)
        }
    }

    fn flush(&self) {
        if let Target::File(ref mut file)
            = *self.target.lock().expect("poisoned lock")
        {
            let _ = file.flush();
        }
    }
}
