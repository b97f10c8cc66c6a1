//! Fetching objects from their publication points with rsync.
//!
//! The [`RemoteFetcher`] is the bottom layer of the fetcher chain. It maps
//! rsync URIs to paths below a per-trust-anchor working directory, runs
//! the rsync binary to bring those paths up to date, and reads the
//! resulting files back. Every invocation is recorded with its exit
//! status and duration for the metrics.
//!
//! The actual command invocation sits behind the [`RsyncRunner`] trait so
//! tests can substitute a mock that conjures up files without touching
//! the network.

use std::{fs, io};
use std::path::{Path, PathBuf};
use std::process::{Command as StdCommand, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, warn};
use rpki::uri;
use tokio::process::Command as AsyncCommand;
use crate::config::Config;
use crate::error::Failed;
use crate::metrics::{Metrics, RsyncEventMetrics, RsyncOp};
use crate::objects::FileContentSpec;
use crate::validation::{self, ValidationResult};


//------------ RsyncRunner ---------------------------------------------------

/// Something that can run an rsync transfer.
///
/// An exit status of zero means the transfer succeeded. Everything else,
/// including failing to run the command at all, is a failure.
pub trait RsyncRunner: Send + Sync {
    /// Transfers `source` into the local `destination` path.
    fn execute(
        &self,
        source: &uri::Rsync,
        destination: &Path,
        recursive: bool,
    ) -> Result<ExitStatus, io::Error>;
}


//------------ RsyncCommand --------------------------------------------------

/// The external rsync command.
#[derive(Debug)]
pub struct RsyncCommand {
    /// The actual command.
    command: String,

    /// The list of additional arguments.
    ///
    /// We will always add a few more when actually running.
    args: Vec<String>,

    /// The rsync timeout.
    timeout: Duration,
}

impl RsyncCommand {
    /// Creates a new rsync command from the config.
    ///
    /// Runs the command once to check that it is present and to detect
    /// which options it supports.
    pub fn new(config: &Config) -> Result<Self, Failed> {
        let command = config.rsync_command.clone();
        let output = match StdCommand::new(&command).arg("-h").output() {
            Ok(output) => output,
            Err(err) => {
                error!("Failed to run rsync: {}", err);
                return Err(Failed)
            }
        };
        if !output.status.success() {
            error!(
                "Running rsync failed with output: \n{}",
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(Failed);
        }
        let args = match config.rsync_args {
            Some(ref args) => args.clone(),
            None => {
                let mut args = vec![
                    "--update".into(),
                    "--times".into(),
                    "--copy-links".into(),
                ];
                let has_contimeout = output.stdout.windows(12).any(
                    |window| window == b"--contimeout"
                );
                if has_contimeout {
                    args.push("--contimeout=10".into());
                }
                args
            }
        };
        Ok(RsyncCommand {
            command,
            args,
            timeout: config.rsync_timeout,
        })
    }
}

impl RsyncRunner for RsyncCommand {
    fn execute(
        &self,
        source: &uri::Rsync,
        destination: &Path,
        recursive: bool,
    ) -> Result<ExitStatus, io::Error> {
        if recursive {
            fs::create_dir_all(destination)?;
        }
        else if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut destination = format!("{}", destination.display());
        if recursive && !destination.ends_with('/') {
            // Make sure the path ends in a slash or strange things happen.
            destination.push('/')
        }

        let mut cmd = AsyncCommand::new(&self.command);
        for item in &self.args {
            cmd.arg(item);
        }
        if recursive {
            cmd.arg("--recursive").arg("--delete");
        }
        cmd.arg(source.as_str()).arg(destination);
        debug!("running command {:?}", cmd);

        // Because we can’t have a timeout on a child process with just
        // std, we resort to Tokio here: we fire up a current-thread
        // runtime and use Tokio’s async process handling.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        runtime.block_on(async {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            cmd.kill_on_drop(true);
            let output = match tokio::time::timeout(
                self.timeout, cmd.output()
            ).await {
                Ok(output) => output?,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "rsync process reached time out"
                    ))
                }
            };
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                if !line.is_empty() {
                    warn!("rsync {}: {}", source, line);
                }
            }
            Ok(output.status)
        })
    }
}


//------------ UriToPathMapper -----------------------------------------------

/// Maps rsync URIs to paths below a base directory.
#[derive(Clone, Debug)]
pub struct UriToPathMapper {
    /// The base path.
    base: PathBuf,
}

impl UriToPathMapper {
    /// Creates a new mapper.
    ///
    /// Does not actually create the directory on disk.
    pub fn new(base: PathBuf) -> Self {
        UriToPathMapper { base }
    }

    /// Returns the base path of the mapper.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Returns the absolute path for the given URI.
    pub fn uri_path(&self, uri: &uri::Rsync) -> PathBuf {
        let mut res = self.base.clone();
        res.push(uri.canonical_authority().as_ref());
        res.push(uri.module_name());
        res.push(uri.path());
        res
    }

    /// Removes everything below the base directory.
    pub fn wipe(&self) -> Result<(), Failed> {
        if let Err(err) = fs::remove_dir_all(&self.base) {
            if err.kind() != io::ErrorKind::NotFound {
                error!(
                    "Failed to wipe rsync cache {}: {}",
                    self.base.display(), err
                );
                return Err(Failed)
            }
        }
        Ok(())
    }
}


//------------ RemoteFetcher -------------------------------------------------

/// The bottom layer of the fetcher chain: raw bytes via rsync.
pub struct RemoteFetcher {
    /// The runner executing the actual transfers.
    runner: Arc<dyn RsyncRunner>,

    /// Maps URIs into the per-trust-anchor working directory.
    mapper: UriToPathMapper,

    /// The metrics for the transfers run so far.
    metrics: Mutex<Vec<RsyncEventMetrics>>,
}

impl RemoteFetcher {
    /// Creates a new fetcher writing below the given working directory.
    pub fn new(
        runner: Arc<dyn RsyncRunner>,
        working_dir: PathBuf,
    ) -> Self {
        RemoteFetcher {
            runner,
            mapper: UriToPathMapper::new(working_dir),
            metrics: Mutex::new(Vec::new()),
        }
    }

    /// Returns the mapper used by the fetcher.
    pub fn mapper(&self) -> &UriToPathMapper {
        &self.mapper
    }

    /// Fetches the subtree at `uri` recursively.
    ///
    /// A failed transfer is recorded as a failure on `result` at the
    /// current location.
    pub fn prefetch(&self, uri: &uri::Rsync, result: &mut ValidationResult) {
        let status = self.run_transfer(uri, RsyncOp::Prefetch, true, result);
        if !status {
            warn!("rsync prefetch of {} failed.", uri);
            result.reject(validation::VALIDATOR_RSYNC_COMMAND);
        }
    }

    /// Fetches the single file at `uri` and returns its bytes.
    ///
    /// The bytes are checked against `spec`. All failures are recorded on
    /// `result` at the current location and lead to `None`.
    pub fn fetch_file(
        &self,
        uri: &uri::Rsync,
        spec: &FileContentSpec,
        result: &mut ValidationResult,
    ) -> Option<Bytes> {
        let status = self.run_transfer(
            uri, RsyncOp::FetchFile, false, result
        );
        if !status {
            warn!("rsync fetch of {} failed.", uri);
            result.reject(validation::VALIDATOR_RSYNC_COMMAND);
            return None
        }
        let path = self.mapper.uri_path(uri);
        let bytes = match fs::read(&path) {
            Ok(data) => Bytes::from(data),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    error!(
                        "Failed to read file '{}': {}", path.display(), err
                    );
                }
                result.reject(validation::VALIDATOR_READ_FILE);
                return None
            }
        };
        if !result.reject_if_false(
            spec.is_satisfied_by(&bytes),
            validation::VALIDATOR_FILE_CONTENT
        ) {
            warn!("{}: file has wrong manifest hash.", uri);
            return None
        }
        Some(bytes)
    }

    /// Runs a single transfer, recording metrics.
    ///
    /// Returns whether the transfer succeeded.
    fn run_transfer(
        &self,
        uri: &uri::Rsync,
        op: RsyncOp,
        recursive: bool,
        result: &mut ValidationResult,
    ) -> bool {
        let destination = self.mapper.uri_path(uri);
        let when = Utc::now();
        let start = SystemTime::now();
        let status = self.runner.execute(uri, &destination, recursive);
        let duration = SystemTime::now().duration_since(start);
        let success = matches!(status, Ok(ref status) if status.success());

        if let Ok(duration) = duration {
            result.add_metric(
                "rsync.elapsed.ms", duration.as_millis().to_string()
            );
        }
        self.metrics.lock().expect("poisoned lock").push(
            RsyncEventMetrics {
                op,
                uri: uri.clone(),
                when,
                status,
                duration,
            }
        );
        success
    }

    /// Finishes the fetcher’s part of a run.
    ///
    /// Moves the collected transfer metrics over into `metrics`.
    pub fn done(&self, metrics: &mut Metrics) {
        metrics.rsync.append(
            &mut self.metrics.lock().expect("poisoned lock")
        );
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn uri_to_path() {
        let mapper = UriToPathMapper::new(PathBuf::from("/tmp/cache/x.tal"));
        let uri = uri::Rsync::from_str(
            "rsync://Example.NET/module/sub/leaf.cer"
        ).unwrap();
        assert_eq!(
            mapper.uri_path(&uri),
            PathBuf::from("/tmp/cache/x.tal/example.net/module/sub/leaf.cer")
        );
    }
}
