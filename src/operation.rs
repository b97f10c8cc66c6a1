//! What the validator can do for you.
//!
//! This module implements all the commands users can ask the validator to
//! perform. They are encapsulated in the type [`Operation`] which can
//! determine the command from the command line arguments and then execute
//! it.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use clap::{ArgMatches, Command};
use log::{error, info};
use crate::config::{Config, LogTarget};
use crate::engine::Engine;
use crate::error::{ExitError, Failed};
use crate::log::Logger;


//------------ Configuration -------------------------------------------------

/// How long the server loop sleeps between scheduler ticks.
const SERVER_TICK: Duration = Duration::from_secs(10);


//------------ Operation -----------------------------------------------------

/// The command to execute.
///
/// You create a value from the command line arguments: first add all the
/// sub-commands to a clap `Command` via [`config_args`], then turn the
/// matches into a value via [`from_arg_matches`], and finally execute it
/// through [`run`].
///
/// [`config_args`]: #method.config_args
/// [`from_arg_matches`]: #method.from_arg_matches
/// [`run`]: #method.run
pub enum Operation {
    Init,
    Update,
    Server,
    PrintConfig,
}

impl Operation {
    /// Prepares everything.
    ///
    /// Call this before doing anything else.
    pub fn prepare() -> Result<(), Failed> {
        Logger::init()
    }

    /// Adds the sub-commands to a clap command.
    pub fn config_args(app: Command) -> Command {
        app
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new("init")
            .about("Initializes the local directories")
        )
        .subcommand(Command::new("update")
            .about("Validates all trust anchors once")
        )
        .subcommand(Command::new("server")
            .about("Periodically validates all trust anchors")
        )
        .subcommand(Command::new("config")
            .about("Prints the current configuration")
        )
    }

    /// Creates the operation from the command line matches.
    pub fn from_arg_matches(matches: &ArgMatches) -> Result<Self, Failed> {
        match matches.subcommand() {
            Some(("init", _)) => Ok(Operation::Init),
            Some(("update", _)) => Ok(Operation::Update),
            Some(("server", _)) => Ok(Operation::Server),
            Some(("config", _)) => Ok(Operation::PrintConfig),
            _ => {
                error!("Expected a command.");
                Err(Failed)
            }
        }
    }

    /// Runs the operation.
    pub fn run(self, config: Config) -> Result<(), ExitError> {
        match self {
            Operation::Init => Self::init(config),
            Operation::Update => Self::update(config),
            Operation::Server => Self::server(config),
            Operation::PrintConfig => Self::print_config(config),
        }
    }

    /// Creates the TAL and cache directories and the store.
    fn init(config: Config) -> Result<(), ExitError> {
        Logger::switch(&config)?;
        Engine::init(&config)?;
        println!(
            "Created {} and {}.\n\
             Place the TAL files of the trust anchors you want to \
             validate into the TAL directory.",
            config.tal_dir.display(), config.cache_dir.display()
        );
        Ok(())
    }

    /// Performs one validation pass over all enabled trust anchors.
    fn update(config: Config) -> Result<(), ExitError> {
        Logger::switch(&config)?;
        let engine = Engine::new(config)?;
        let metrics = engine.process_all();
        engine.cleanup()?;

        let stdout = io::stdout();
        let mut stdout = stdout.lock();
        if metrics.write(&mut stdout).is_err() {
            return Err(ExitError::Generic)
        }
        let _ = stdout.flush();

        if metrics.rsync_complete() {
            Ok(())
        }
        else {
            Err(ExitError::IncompleteUpdate)
        }
    }

    /// Runs the scheduler loop until interrupted.
    ///
    /// Each tick starts validation runs for all trust anchors whose next
    /// update is due. A shutdown signal stops scheduling new runs;
    /// whatever is in flight completes naturally.
    fn server(config: Config) -> Result<(), ExitError> {
        Logger::switch(&config)?;
        let engine = Engine::new(config)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        spawn_shutdown_listener(shutdown.clone())?;

        info!("Starting the validation scheduler.");
        while !shutdown.load(Ordering::Relaxed) {
            let metrics = engine.process_due();
            if !metrics.tals.is_empty() {
                engine.cleanup()?;
                log_metrics(&metrics);
            }

            let mut slept = Duration::from_secs(0);
            while slept < SERVER_TICK {
                if shutdown.load(Ordering::Relaxed) {
                    break
                }
                thread::sleep(Duration::from_secs(1));
                slept += Duration::from_secs(1);
            }
        }
        info!("Shutting down.");
        log::logger().flush();
        Ok(())
    }

    /// Prints the configuration in config file syntax.
    fn print_config(config: Config) -> Result<(), ExitError> {
        println!("cache-dir = {:?}", config.cache_dir.display().to_string());
        println!("tal-dir = {:?}", config.tal_dir.display().to_string());
        println!("rsync-command = {:?}", config.rsync_command);
        if let Some(ref args) = config.rsync_args {
            println!("rsync-args = {:?}", args);
        }
        println!("rsync-timeout = {}", config.rsync_timeout.as_secs());
        println!("strict = {}", config.strict);
        println!("max-stale-days = {}", config.max_stale_days);
        println!("max-ca-depth = {}", config.max_ca_depth);
        println!("validation-threads = {}", config.validation_threads);
        println!("refresh = {}", config.refresh.as_secs());
        println!("retry = {}", config.retry.as_secs());
        println!("log-level = {:?}", config.log_level.to_string());
        if let LogTarget::File(ref path) = config.log_target {
            println!("log-file = {:?}", path.display().to_string());
        }
        Ok(())
    }
}

/// Flips the flag once the process receives an interrupt signal.
fn spawn_shutdown_listener(
    shutdown: Arc<AtomicBool>
) -> Result<(), Failed> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(|err| {
            error!("Failed to set up signal handling: {}", err);
            Failed
        })?;
    thread::spawn(move || {
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            info!("Received interrupt. Finishing in-flight runs.");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

/// Writes the metrics of a scheduler tick to the log.
fn log_metrics(metrics: &crate::metrics::Metrics) {
    let mut buf = Vec::new();
    if metrics.write(&mut buf).is_ok() {
        for line in String::from_utf8_lossy(&buf).lines() {
            info!("{}", line);
        }
    }
}
