//! Configuration.
//!
//! This module primarily contains the type [`Config`] that holds all the
//! configuration used by the validator. It can be loaded both from a TOML
//! formatted config file and command line options.

use std::{fs, io};
use std::path::{Path, PathBuf};
use std::time::Duration;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{LevelFilter, error};
use crate::error::Failed;


//------------ Defaults for Some Values --------------------------------------

/// Are we doing strict validation by default?
const DEFAULT_STRICT: bool = false;

/// The default timeout for running rsync commands in seconds.
const DEFAULT_RSYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// The default number of days an object may sit in the store unrefreshed.
const DEFAULT_MAX_STALE_DAYS: u64 = 7;

/// The default maximum CA depth.
const DEFAULT_MAX_CA_DEPTH: usize = 32;

/// The default interval before revisiting a successfully validated anchor.
const DEFAULT_REFRESH: Duration = Duration::from_secs(4 * 3600);

/// The default interval before retrying a failed anchor.
const DEFAULT_RETRY: Duration = Duration::from_secs(3600);


//------------ Config --------------------------------------------------------

/// The validator configuration.
///
/// All values are public and can be accessed directly. A value is created
/// from command line matches via [`from_arg_matches`]. If a config file
/// is given there, it is read first and the remaining command line
/// options are applied on top.
///
/// [`from_arg_matches`]: #method.from_arg_matches
#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the directory that keeps all local state.
    ///
    /// The durable object store lives in its `store` sub-directory, the
    /// per-trust-anchor rsync working directories below `cache`.
    pub cache_dir: PathBuf,

    /// Path to the directory that holds the TAL files.
    pub tal_dir: PathBuf,

    /// The command to run for rsync.
    pub rsync_command: String,

    /// Arguments passed to rsync.
    ///
    /// If this is `None`, a default set of arguments is used.
    pub rsync_args: Option<Vec<String>>,

    /// Timeout for rsync commands.
    pub rsync_timeout: Duration,

    /// Whether to validate objects strictly following the standards.
    pub strict: bool,

    /// Number of days objects may go unrefreshed before they expire.
    ///
    /// This doubles as the grace window for objects past their validity:
    /// within the window a stale object gets a warning, beyond it a
    /// failure.
    pub max_stale_days: u64,

    /// The maximum length of a chain of CAs a walk will descend.
    pub max_ca_depth: usize,

    /// Number of trust anchors validated in parallel.
    pub validation_threads: usize,

    /// How long after a successful run the next one is scheduled.
    pub refresh: Duration,

    /// How long after a failed run the next one is scheduled.
    pub retry: Duration,

    /// Wipe all cached data before the first validation run.
    pub fresh: bool,

    /// The log levels to be logged.
    pub log_level: LevelFilter,

    /// Where to log to.
    pub log_target: LogTarget,
}

impl Config {
    /// Adds the basic arguments to a clap command.
    ///
    /// Returns the command with the arguments added.
    pub fn config_args(app: Command) -> Command {
        app
        .arg(Arg::new("config")
            .short('c')
            .long("config")
            .value_name("PATH")
            .help("Read base configuration from this file")
        )
        .arg(Arg::new("cache_dir")
            .long("cache-dir")
            .value_name("DIR")
            .help("Sets the directory for local state")
        )
        .arg(Arg::new("tal_dir")
            .long("tal-dir")
            .value_name("DIR")
            .help("Sets the directory containing the TAL files")
        )
        .arg(Arg::new("rsync_command")
            .long("rsync-command")
            .value_name("COMMAND")
            .help("The command to run for rsync")
        )
        .arg(Arg::new("rsync_timeout")
            .long("rsync-timeout")
            .value_name("SECONDS")
            .help("Timeout for rsync commands")
        )
        .arg(Arg::new("strict")
            .long("strict")
            .action(ArgAction::SetTrue)
            .help("Parse RPKI data in strict mode")
        )
        .arg(Arg::new("max_stale_days")
            .long("max-stale-days")
            .value_name("DAYS")
            .help("Days before unrefreshed objects expire")
        )
        .arg(Arg::new("max_ca_depth")
            .long("max-ca-depth")
            .value_name("COUNT")
            .help("The maximum length of a CA chain")
        )
        .arg(Arg::new("validation_threads")
            .long("validation-threads")
            .value_name("COUNT")
            .help("Number of trust anchors validated in parallel")
        )
        .arg(Arg::new("refresh")
            .long("refresh")
            .value_name("SECONDS")
            .help("Interval before revalidating a successful anchor")
        )
        .arg(Arg::new("retry")
            .long("retry")
            .value_name("SECONDS")
            .help("Interval before retrying a failed anchor")
        )
        .arg(Arg::new("fresh")
            .long("fresh")
            .action(ArgAction::SetTrue)
            .help("Delete cached data before starting")
        )
        .arg(Arg::new("verbose")
            .short('v')
            .long("verbose")
            .action(ArgAction::Count)
            .help("Log more information, twice for even more")
        )
        .arg(Arg::new("quiet")
            .short('q')
            .long("quiet")
            .action(ArgAction::Count)
            .conflicts_with("verbose")
            .help("Log less information, twice for no information")
        )
        .arg(Arg::new("logfile")
            .long("logfile")
            .value_name("PATH")
            .help("Log to this file instead of stderr")
        )
    }

    /// Creates a configuration from command line matches.
    ///
    /// If a config file was given, it is read first; all other arguments
    /// are applied on top of it. Relative paths are interpreted relative
    /// to `cur_dir`.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        let mut res = match matches.get_one::<String>("config") {
            Some(path) => {
                Self::from_config_file(ConfigFile::read(
                    &cur_dir.join(path)
                )?)?
            }
            None => Self::default()
        };
        res.apply_arg_matches(matches, cur_dir)?;
        Ok(res)
    }

    /// Applies the basic command line arguments to the configuration.
    fn apply_arg_matches(
        &mut self,
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<(), Failed> {
        if let Some(dir) = matches.get_one::<String>("cache_dir") {
            self.cache_dir = cur_dir.join(dir)
        }
        if let Some(dir) = matches.get_one::<String>("tal_dir") {
            self.tal_dir = cur_dir.join(dir)
        }
        if let Some(command) = matches.get_one::<String>("rsync_command") {
            self.rsync_command = command.clone()
        }
        if let Some(timeout) = matches.get_one::<String>("rsync_timeout") {
            self.rsync_timeout = Duration::from_secs(
                Self::parse_number(timeout, "--rsync-timeout")?
            )
        }
        if matches.get_flag("strict") {
            self.strict = true
        }
        if let Some(days) = matches.get_one::<String>("max_stale_days") {
            self.max_stale_days = Self::parse_number(
                days, "--max-stale-days"
            )?
        }
        if let Some(depth) = matches.get_one::<String>("max_ca_depth") {
            self.max_ca_depth = Self::parse_number(
                depth, "--max-ca-depth"
            )? as usize
        }
        if let Some(count)
            = matches.get_one::<String>("validation_threads")
        {
            self.validation_threads = Self::parse_number(
                count, "--validation-threads"
            )? as usize
        }
        if let Some(seconds) = matches.get_one::<String>("refresh") {
            self.refresh = Duration::from_secs(
                Self::parse_number(seconds, "--refresh")?
            )
        }
        if let Some(seconds) = matches.get_one::<String>("retry") {
            self.retry = Duration::from_secs(
                Self::parse_number(seconds, "--retry")?
            )
        }
        if matches.get_flag("fresh") {
            self.fresh = true
        }
        match (
            matches.get_count("verbose"), matches.get_count("quiet")
        ) {
            (0, 0) => { }
            (1, 0) => self.log_level = LevelFilter::Info,
            (_, 0) => self.log_level = LevelFilter::Debug,
            (0, 1) => self.log_level = LevelFilter::Error,
            _ => self.log_level = LevelFilter::Off,
        }
        if let Some(path) = matches.get_one::<String>("logfile") {
            self.log_target = LogTarget::File(cur_dir.join(path))
        }
        Ok(())
    }

    /// Parses a numeric command line value.
    fn parse_number(value: &str, arg: &str) -> Result<u64, Failed> {
        value.parse().map_err(|_| {
            error!("Invalid value for {}: {}", arg, value);
            Failed
        })
    }

    /// Creates a configuration from a config file.
    fn from_config_file(mut file: ConfigFile) -> Result<Self, Failed> {
        let res = Config {
            cache_dir: file.take_path("cache-dir")?
                .unwrap_or_else(|| PathBuf::from("tmp")),
            tal_dir: file.take_path("tal-dir")?
                .unwrap_or_else(|| PathBuf::from("tal")),
            rsync_command: file.take_string("rsync-command")?
                .unwrap_or_else(|| "rsync".into()),
            rsync_args: file.take_string_array("rsync-args")?,
            rsync_timeout: file.take_u64("rsync-timeout")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RSYNC_TIMEOUT),
            strict: file.take_bool("strict")?.unwrap_or(DEFAULT_STRICT),
            max_stale_days: file.take_u64("max-stale-days")?
                .unwrap_or(DEFAULT_MAX_STALE_DAYS),
            max_ca_depth: file.take_u64("max-ca-depth")?
                .map(|value| value as usize)
                .unwrap_or(DEFAULT_MAX_CA_DEPTH),
            validation_threads: file.take_u64("validation-threads")?
                .map(|value| value as usize)
                .unwrap_or_else(default_validation_threads),
            refresh: file.take_u64("refresh")?
                .map(Duration::from_secs).unwrap_or(DEFAULT_REFRESH),
            retry: file.take_u64("retry")?
                .map(Duration::from_secs).unwrap_or(DEFAULT_RETRY),
            fresh: false,
            log_level: match file.take_string("log-level")? {
                Some(value) => {
                    value.parse().map_err(|_| {
                        error!(
                            "Error in config file {}: invalid log-level.",
                            file.path.display()
                        );
                        Failed
                    })?
                }
                None => LevelFilter::Warn
            },
            log_target: match file.take_path("log-file")? {
                Some(path) => LogTarget::File(path),
                None => LogTarget::Stderr
            },
        };
        file.check_exhausted()?;
        Ok(res)
    }

    /// Returns the rsync working directory for the given TAL file name.
    pub fn tal_cache_dir(&self, tal_file_name: &str) -> PathBuf {
        self.cache_dir.join("cache").join(tal_file_name)
    }

    /// Returns the path of the object store database.
    pub fn store_dir(&self) -> PathBuf {
        self.cache_dir.join("store")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("tmp"),
            tal_dir: PathBuf::from("tal"),
            rsync_command: "rsync".into(),
            rsync_args: None,
            rsync_timeout: DEFAULT_RSYNC_TIMEOUT,
            strict: DEFAULT_STRICT,
            max_stale_days: DEFAULT_MAX_STALE_DAYS,
            max_ca_depth: DEFAULT_MAX_CA_DEPTH,
            validation_threads: default_validation_threads(),
            refresh: DEFAULT_REFRESH,
            retry: DEFAULT_RETRY,
            fresh: false,
            log_level: LevelFilter::Warn,
            log_target: LogTarget::Stderr,
        }
    }
}

/// Returns the default number of validation threads.
fn default_validation_threads() -> usize {
    std::thread::available_parallelism().map(|count| {
        count.get()
    }).unwrap_or(1)
}


//------------ LogTarget -----------------------------------------------------

/// Where to write log output to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogTarget {
    /// Write to stderr.
    Stderr,

    /// Append to the given file.
    File(PathBuf),
}


//------------ ConfigFile ----------------------------------------------------

/// The content of a config file.
///
/// This is a thin wrapper around a TOML table that tracks which keys
/// have been taken out so unknown keys can be flagged at the end.
struct ConfigFile {
    /// The content of the file.
    content: toml::value::Table,

    /// The path to the config file.
    path: PathBuf,

    /// The directory the file lives in, for relative paths.
    dir: PathBuf,
}

impl ConfigFile {
    /// Reads the file at the given path.
    fn read(path: &Path) -> Result<Self, Failed> {
        let content = fs::read_to_string(path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                error!("Missing config file {}.", path.display());
            }
            else {
                error!(
                    "Failed to read config file {}: {}",
                    path.display(), err
                );
            }
            Failed
        })?;
        Self::parse(&content, path)
    }

    /// Parses the content of the file at the given path.
    fn parse(content: &str, path: &Path) -> Result<Self, Failed> {
        let content = match content.parse::<toml::Value>() {
            Ok(toml::Value::Table(content)) => content,
            Ok(_) => {
                error!(
                    "Error in config file {}: not a mapping.",
                    path.display()
                );
                return Err(Failed)
            }
            Err(err) => {
                error!(
                    "Error in config file {}: {}", path.display(), err
                );
                return Err(Failed)
            }
        };
        let dir = path.parent().map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(ConfigFile {
            content,
            path: path.into(),
            dir,
        })
    }

    /// Takes a string value from the file.
    fn take_string(&mut self, key: &str) -> Result<Option<String>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::String(value)) => Ok(Some(value)),
            Some(_) => {
                error!(
                    "Error in config file {}: '{}' expected to be a string.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes a boolean value from the file.
    fn take_bool(&mut self, key: &str) -> Result<Option<bool>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::Boolean(value)) => Ok(Some(value)),
            Some(_) => {
                error!(
                    "Error in config file {}: '{}' expected to be a boolean.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes an unsigned integer value from the file.
    fn take_u64(&mut self, key: &str) -> Result<Option<u64>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::Integer(value)) if value >= 0 => {
                Ok(Some(value as u64))
            }
            Some(_) => {
                error!(
                    "Error in config file {}: \
                     '{}' expected to be a non-negative integer.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes a path value from the file.
    ///
    /// Relative paths are interpreted relative to the file’s directory.
    fn take_path(&mut self, key: &str) -> Result<Option<PathBuf>, Failed> {
        Ok(self.take_string(key)?.map(|path| self.dir.join(path)))
    }

    /// Takes an array of strings from the file.
    fn take_string_array(
        &mut self, key: &str
    ) -> Result<Option<Vec<String>>, Failed> {
        let array = match self.content.remove(key) {
            Some(toml::Value::Array(array)) => array,
            Some(_) => {
                error!(
                    "Error in config file {}: \
                     '{}' expected to be an array of strings.",
                    self.path.display(), key
                );
                return Err(Failed)
            }
            None => return Ok(None)
        };
        let mut res = Vec::with_capacity(array.len());
        for value in array {
            match value {
                toml::Value::String(value) => res.push(value),
                _ => {
                    error!(
                        "Error in config file {}: \
                         '{}' expected to be an array of strings.",
                        self.path.display(), key
                    );
                    return Err(Failed)
                }
            }
        }
        Ok(Some(res))
    }

    /// Complains about any keys nobody asked for.
    fn check_exhausted(&self) -> Result<(), Failed> {
        match self.content.keys().next() {
            Some(key) => {
                error!(
                    "Error in config file {}: unknown option '{}'.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(())
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn parse(content: &str) -> Result<Config, Failed> {
        Config::from_config_file(
            ConfigFile::parse(content, Path::new("/etc/test.conf")).unwrap()
        )
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.rsync_timeout, Duration::from_secs(300));
        assert_eq!(config.refresh, Duration::from_secs(4 * 3600));
        assert_eq!(config.retry, Duration::from_secs(3600));
        assert_eq!(config.max_ca_depth, 32);
        assert_eq!(config.log_target, LogTarget::Stderr);
    }

    #[test]
    fn config_file_values() {
        let config = parse(
            "cache-dir = \"/var/lib/anchorite\"\n\
             tal-dir = \"/etc/anchorite/tals\"\n\
             rsync-timeout = 60\n\
             max-stale-days = 3\n\
             strict = true\n\
             log-level = \"debug\"\n"
        ).unwrap();
        assert_eq!(config.cache_dir, Path::new("/var/lib/anchorite"));
        assert_eq!(config.tal_dir, Path::new("/etc/anchorite/tals"));
        assert_eq!(config.rsync_timeout, Duration::from_secs(60));
        assert_eq!(config.max_stale_days, 3);
        assert!(config.strict);
        assert_eq!(config.log_level, LevelFilter::Debug);

        assert_eq!(
            config.tal_cache_dir("example.tal"),
            Path::new("/var/lib/anchorite/cache/example.tal")
        );
        assert_eq!(
            config.store_dir(),
            Path::new("/var/lib/anchorite/store")
        );
    }

    #[test]
    fn config_file_relative_paths() {
        let config = parse("tal-dir = \"tals\"\n").unwrap();
        assert_eq!(config.tal_dir, Path::new("/etc/tals"));
    }

    #[test]
    fn config_file_rejects_unknown_keys() {
        assert!(parse("no-such-option = 1\n").is_err());
        assert!(parse("rsync-timeout = \"soon\"\n").is_err());
    }
}
