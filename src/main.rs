//! The Anchorite binary.
//!
//! All the heavy lifting lives in the library; this is only the command
//! line frontend gluing configuration and operation together.

use std::env;
use std::process::exit;
use clap::{Command, crate_version};
use anchorite::{Config, ExitError, Operation};

fn main() {
    if let Err(err) = run() {
        exit(err.exit_status())
    }
}

fn run() -> Result<(), ExitError> {
    Operation::prepare()?;
    let matches = Operation::config_args(Config::config_args(
        Command::new("anchorite")
            .version(crate_version!())
            .about("An RPKI relying-party validator")
    )).get_matches();
    let cur_dir = env::current_dir().map_err(|err| {
        eprintln!("Fatal: cannot get current directory: {}", err);
        ExitError::Generic
    })?;
    let config = Config::from_arg_matches(&matches, &cur_dir)?;
    let operation = Operation::from_arg_matches(&matches)?;
    operation.run(config)
}
