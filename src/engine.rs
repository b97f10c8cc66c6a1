//! Updating and processing of RPKI data.
//!
//! This module provides the machinery that validates the data of all
//! configured trust anchors. The long-lived part is the [`Engine`]: it
//! owns the object store, the set of TALs, and the shared memory image,
//! and can run validation for all due anchors in parallel, one worker
//! per anchor.
//!
//! A single anchor is handled by a [`ValidationProcess`]. The process
//! guards itself through the shared image’s start transition, builds a
//! fresh fetcher chain, extracts the trust anchor certificate, lets the
//! [`TopDownWalker`] descend from it, and finishes by publishing the
//! outcome. Cross-cutting concerns hang off the process as
//! [`ProcessListener`] subscribers fed from a small set of lifecycle
//! events instead of being woven into the control flow.

use std::{fs, io};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use crossbeam_queue::SegQueue;
use crossbeam_utils::thread;
use log::{error, info, warn};
use rpki::repository::x509::Time;
use rpki::uri;
use crate::anchors::{RunOutcome, SharedImage, TrustAnchor};
use crate::config::Config;
use crate::error::Failed;
use crate::fetch::{
    self, Chain, FetchListener, ObjectFetcher, RemoteFetcher, RsyncCommand,
    RsyncRunner, UriToPathMapper
};
use crate::metrics::{Metrics, TalMetrics};
use crate::objects::{
    CaCertObject, FileContentSpec, ObjectPolicy, RepositoryObject,
    ValidatedObjects
};
use crate::output::{
    ObjectFetcherResultLogger, RoaCollector, ValidatedObjectCollector,
    ValidationSummaryCollector
};
use crate::store::Store;
use crate::tal::TrustAnchorLocator;
use crate::validation::{
    self, IssuerContext, ValidationContext, ValidationResult
};


//------------ Engine --------------------------------------------------------

/// The mechanism to update and process RPKI data.
///
/// An engine is created from the configuration via [`Engine::new`] which
/// loads the TALs and opens the store. If you only want to make sure
/// everything is initialized without running a validation,
/// [`Engine::init`] will suffice.
pub struct Engine {
    /// The configuration.
    config: Config,

    /// The durable object store shared by all runs.
    store: Store,

    /// The shared memory image with the trust anchor states.
    shared: SharedImage,

    /// The runner for rsync transfers.
    rsync: Arc<dyn RsyncRunner>,

    /// The subscribers to process lifecycle events.
    listeners: Vec<Arc<dyn ProcessListener>>,
}

impl Engine {
    /// Attempts to create the store database under the cache dir.
    fn open_db(config: &Config) -> Result<sled::Db, Failed> {
        if let Err(err) = fs::create_dir_all(&config.cache_dir) {
            error!(
                "Failed to create cache directory {}: {}",
                config.cache_dir.display(), err
            );
            return Err(Failed)
        }
        let db_path = config.store_dir();
        if config.fresh {
            if let Err(err) = fs::remove_dir_all(&db_path) {
                if err.kind() != io::ErrorKind::NotFound {
                    error!(
                        "Failed to delete store database at {}: {}",
                        db_path.display(), err
                    );
                    return Err(Failed)
                }
            }
        }
        sled::open(&db_path).map_err(|err| {
            error!(
                "Failed to open store database at {}: {}",
                db_path.display(), err
            );
            Failed
        })
    }

    /// Initializes the directories and the store without creating a value.
    pub fn init(config: &Config) -> Result<(), Failed> {
        if let Err(err) = fs::create_dir_all(&config.tal_dir) {
            error!(
                "Failed to create TAL directory {}: {}",
                config.tal_dir.display(), err
            );
            return Err(Failed)
        }
        Self::open_db(config).map(|_| ())
    }

    /// Creates a new engine from the configuration.
    ///
    /// Loads the TALs and errors out if that fails.
    pub fn new(config: Config) -> Result<Self, Failed> {
        let db = Self::open_db(&config)?;
        let store = Store::new(&db)?;
        let tals = TrustAnchorLocator::load_dir(&config.tal_dir)?;
        let shared = SharedImage::new(
            tals,
            duration_chrono(config.refresh),
            duration_chrono(config.retry),
        );
        let rsync: Arc<dyn RsyncRunner>
            = Arc::new(RsyncCommand::new(&config)?);
        if config.fresh {
            Self::wipe_all_rsync_caches(&config)?;
        }
        Ok(Engine {
            config,
            store,
            shared,
            rsync,
            listeners: vec![Arc::new(ProcessLogger)],
        })
    }

    /// Returns a reference to the shared memory image.
    pub fn shared(&self) -> &SharedImage {
        &self.shared
    }

    /// Returns the validation policy from the configuration.
    fn policy(&self) -> ObjectPolicy {
        ObjectPolicy {
            strict: self.config.strict,
            max_stale_days: self.config.max_stale_days,
        }
    }

    /// Runs validation for all anchors that are currently due.
    pub fn process_due(&self) -> Metrics {
        let now = Time::now();
        self.process(|anchor| anchor.is_due(now))
    }

    /// Runs validation for all enabled, idle anchors regardless of time.
    pub fn process_all(&self) -> Metrics {
        self.process(|anchor| {
            anchor.enabled() && anchor.status().is_idle()
        })
    }

    /// Runs validation for all anchors selected by `want` in parallel.
    fn process(&self, want: impl Fn(&TrustAnchor) -> bool) -> Metrics {
        let tasks = SegQueue::new();
        for anchor in self.shared.read().trust_anchors().iter() {
            if want(anchor) {
                tasks.push(anchor.locator().clone())
            }
        }
        if tasks.is_empty() {
            return Metrics::new()
        }

        let metrics = Mutex::new(Metrics::new());
        let res = thread::scope(|scope| {
            for _ in 0..self.config.validation_threads {
                scope.spawn(|_| {
                    while let Some(tal) = tasks.pop() {
                        let run = ValidationProcess::new(self, tal).run();
                        metrics.lock().expect("poisoned lock").merge(run);
                    }
                });
            }
        });
        if res.is_err() {
            error!(
                "Engine failed after a worker thread has panicked. \
                 This is most assuredly a bug."
            );
        }
        metrics.into_inner().expect("poisoned lock")
    }

    /// Removes expired data from the object store.
    pub fn cleanup(&self) -> Result<(), Failed> {
        self.store.purge_expired(self.config.max_stale_days)
    }

    /// Removes the rsync working directory of the given anchor.
    pub fn wipe_rsync_cache(
        &self, tal: &TrustAnchorLocator
    ) -> Result<(), Failed> {
        UriToPathMapper::new(
            self.config.tal_cache_dir(tal.file_name())
        ).wipe()
    }

    /// Removes the rsync working directories of all anchors.
    fn wipe_all_rsync_caches(config: &Config) -> Result<(), Failed> {
        let dir = config.cache_dir.join("cache");
        if let Err(err) = fs::remove_dir_all(&dir) {
            if err.kind() != io::ErrorKind::NotFound {
                error!(
                    "Failed to delete rsync caches at {}: {}",
                    dir.display(), err
                );
                return Err(Failed)
            }
        }
        Ok(())
    }
}


//------------ ValidationProcess ---------------------------------------------

/// The validation run for a single trust anchor.
pub struct ValidationProcess<'a> {
    /// The engine the run belongs to.
    engine: &'a Engine,

    /// The anchor being validated.
    tal: Arc<TrustAnchorLocator>,

    /// The subscribers to this run’s lifecycle events.
    listeners: Vec<Arc<dyn ProcessListener>>,
}

impl<'a> ValidationProcess<'a> {
    /// Creates a new process for the given anchor.
    pub fn new(engine: &'a Engine, tal: Arc<TrustAnchorLocator>) -> Self {
        ValidationProcess {
            engine,
            tal,
            listeners: engine.listeners.clone(),
        }
    }

    /// Dispatches an event to all subscribers.
    fn emit(&self, event: ProcessEvent) {
        for listener in &self.listeners {
            listener.on_event(&event)
        }
    }

    /// Runs the whole process and returns the metrics of the run.
    ///
    /// The run only goes ahead if the anchor is idle and enabled; if it
    /// is not, nothing is touched and the run reports itself as not
    /// started.
    pub fn run(mut self) -> Metrics {
        let mut metrics = Metrics::new();
        if !self.engine.shared.start_processing(
            &self.tal, "validating trust anchor"
        ) {
            info!(
                "Trust anchor {} not idle or enabled.", self.tal.ca_name()
            );
            let mut tal_metrics = TalMetrics::new(
                self.tal.certificate_location().clone()
            );
            tal_metrics.validation_outcome = Some(
                "failed: Trust anchor not idle or enabled".into()
            );
            metrics.tals.push(tal_metrics);
            return metrics
        }

        let recorder = Arc::new(TalMetricsRecorder::new(
            self.tal.certificate_location().clone()
        ));
        self.listeners.push(recorder.clone());
        self.emit(ProcessEvent::Started { tal: &self.tal });
        let start = Instant::now();

        let collector = Arc::new(ValidatedObjectCollector::new());
        let roas = Arc::new(RoaCollector::new());
        let summary = Arc::new(ValidationSummaryCollector::new());
        let listeners: Vec<Arc<dyn FetchListener>> = vec![
            Arc::new(ObjectFetcherResultLogger),
            collector.clone(),
            roas.clone(),
            summary.clone(),
        ];
        let chain = fetch::build_chain(
            RemoteFetcher::new(
                self.engine.rsync.clone(),
                self.engine.config.tal_cache_dir(self.tal.file_name()),
            ),
            self.engine.store.clone(),
            self.engine.policy(),
            listeners,
        );

        let mut result = ValidationResult::new();
        let outcome = match self.validate(
            &chain, &collector, &mut result
        ) {
            Ok(outcome) => outcome,
            Err(Failed) => {
                let message = "fatal error during validation, see the log";
                self.emit(ProcessEvent::Exception {
                    tal: &self.tal, message
                });
                RunOutcome::Failure(message.into())
            }
        };

        if let RunOutcome::Success(ref objects) = outcome {
            self.emit(ProcessEvent::ObjectsReady {
                tal: &self.tal,
                objects,
                result: &result,
            });
            info!("{}: {}", self.tal.ca_name(), summary.summary());
            let image = self.engine.shared.read();
            let published = roas.take().publish(
                image.filters(), image.whitelist()
            );
            info!(
                "{}: {} route origins published.",
                self.tal.ca_name(), published.len()
            );
        }
        self.emit(ProcessEvent::Finished {
            tal: &self.tal,
            outcome: &outcome,
            elapsed: start.elapsed(),
        });
        self.engine.shared.finish_processing(&self.tal, outcome);

        chain.inner().inner().inner().remote().done(&mut metrics);
        metrics.tals.push(recorder.take());
        metrics
    }

    /// Performs the actual validation.
    ///
    /// Returns the outcome to report to the scheduler. An error return
    /// means the store has failed underneath us.
    fn validate(
        &self,
        chain: &Chain,
        collector: &ValidatedObjectCollector,
        result: &mut ValidationResult,
    ) -> Result<RunOutcome, Failed> {
        for uri in self.tal.prefetch_uris() {
            result.push(uri);
            chain.prefetch(uri, result);
            result.pop();
        }

        let extraction = Instant::now();
        let anchor = self.extract_trust_anchor(chain, result)?;
        self.emit(ProcessEvent::AnchorFetched {
            tal: &self.tal,
            elapsed: extraction.elapsed(),
        });

        let (location, cert) = match anchor {
            AnchorOutcome::Valid(location, cert) => (location, cert),
            AnchorOutcome::Invalid => {
                // The run completed; it just didn't find anything valid.
                // The single-entry map documents why.
                warn!(
                    "No valid trust anchor certificate for {}.",
                    self.tal.ca_name()
                );
                return Ok(RunOutcome::Success(collector.take()))
            }
            AnchorOutcome::Unreachable => {
                return Ok(RunOutcome::Failure(
                    "rsync failed while retrieving the trust anchor \
                     certificate from all locations".into()
                ))
            }
        };

        let issuer = match IssuerContext::root(
            cert.cert().clone(), location
        ) {
            Ok(issuer) => issuer,
            Err(Failed) => {
                return Ok(RunOutcome::Failure(
                    "trust anchor certificate lacks repository \
                     information".into()
                ))
            }
        };
        let mut walker = TopDownWalker::new(
            chain.as_ref(), self.engine.config.max_ca_depth
        );
        walker.add_trust_anchor(
            ValidationContext::ca(self.tal.clone(), issuer)
        );
        walker.execute(result)?;

        Ok(RunOutcome::Success(collector.take()))
    }

    /// Fetches the trust anchor certificate through the chain.
    ///
    /// Tries the certificate locations in their configured order until
    /// one produces a validated certificate.
    fn extract_trust_anchor(
        &self,
        chain: &Chain,
        result: &mut ValidationResult,
    ) -> Result<AnchorOutcome, Failed> {
        let ctx = ValidationContext::root(self.tal.clone());
        for uri in self.tal.certificate_locations() {
            result.push(uri);
            let object = chain.object(
                uri, &FileContentSpec::unrestricted(), &ctx, result
            )?;
            result.pop();
            if let Some(RepositoryObject::CaCert(cert)) = object {
                return Ok(AnchorOutcome::Valid(uri.clone(), cert))
            }
        }

        // Nothing came back. If any location failed validation proper,
        // the run still counts as completed; if everything merely
        // couldn't be fetched, the run as a whole has failed.
        let validation_failure = self.tal.certificate_locations().iter()
            .any(|uri| {
                result.checks_at(uri).iter().any(|check| {
                    check.is_failure() && matches!(
                        check.key(),
                        validation::TRUST_ANCHOR_PUBLIC_KEY_MATCH
                        | validation::VALIDATOR_OBJECT_VALID
                        | validation::VALIDATOR_UNKNOWN_OBJECT
                    )
                })
            });
        if validation_failure {
            Ok(AnchorOutcome::Invalid)
        }
        else {
            Ok(AnchorOutcome::Unreachable)
        }
    }
}

/// What became of fetching the trust anchor certificate.
enum AnchorOutcome {
    /// A certificate was fetched and validated at the given location.
    Valid(uri::Rsync, CaCertObject),

    /// A certificate was fetched but did not validate.
    Invalid,

    /// No location delivered a certificate at all.
    Unreachable,
}


//------------ TopDownWalker -------------------------------------------------

/// The recursive descent from a trust anchor through its CAs.
///
/// CAs to process are kept in a queue seeded via
/// [`add_trust_anchor`][Self::add_trust_anchor] and drained by
/// [`execute`][Self::execute]. For every CA the walker fetches the
/// manifest, the CRL, and then every file the manifest lists; subordinate
/// CA certificates found on the way are queued up for their own descent.
pub struct TopDownWalker<'a> {
    /// The outermost fetcher of the chain.
    fetcher: &'a dyn ObjectFetcher,

    /// The maximum CA chain length we are willing to descend.
    max_ca_depth: usize,

    /// The CAs waiting to be processed.
    queue: VecDeque<ValidationContext>,
}

impl<'a> TopDownWalker<'a> {
    /// Creates a new walker with an empty queue.
    pub fn new(fetcher: &'a dyn ObjectFetcher, max_ca_depth: usize) -> Self {
        TopDownWalker {
            fetcher,
            max_ca_depth,
            queue: VecDeque::new(),
        }
    }

    /// Seeds the queue with a trust anchor context.
    pub fn add_trust_anchor(&mut self, ctx: ValidationContext) {
        self.queue.push_back(ctx)
    }

    /// Drains the queue.
    pub fn execute(
        &mut self, result: &mut ValidationResult
    ) -> Result<(), Failed> {
        while let Some(ctx) = self.queue.pop_front() {
            self.process_ca(ctx, result)?
        }
        Ok(())
    }

    /// Processes the publication point of a single CA.
    fn process_ca(
        &mut self,
        ctx: ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<(), Failed> {
        let issuer = match ctx.issuer() {
            Some(issuer) => issuer.clone(),
            None => return Ok(())
        };

        let manifest_uri = issuer.manifest_uri().clone();
        result.push(&manifest_uri);
        let manifest = self.fetcher.manifest(&manifest_uri, &ctx, result)?;
        result.pop();
        let manifest = match manifest {
            Some(manifest) => manifest,
            None => {
                warn!("{}: no valid manifest found.", manifest_uri);
                return Ok(())
            }
        };

        let crl_uri = manifest.crl_uri().clone();
        result.push(&crl_uri);
        let crl = self.fetcher.crl(&crl_uri, &ctx, result)?;
        result.pop();
        if crl.is_none() {
            warn!("{}: no valid CRL found.", crl_uri);
            return Ok(())
        }

        for (file, hash) in manifest.files() {
            let uri = match issuer.repository_uri().join(file.as_bytes()) {
                Ok(uri) => uri,
                Err(_) => {
                    warn!(
                        "{}: illegal file name {} in manifest.",
                        manifest_uri, file
                    );
                    continue
                }
            };
            let spec = FileContentSpec::from_hash(hash.clone());
            result.push(&uri);
            let object = self.fetcher.object(&uri, &spec, &ctx, result)?;
            result.pop();
            if let Some(RepositoryObject::CaCert(cert)) = object {
                self.push_child_ca(&ctx, uri, cert, result)
            }
        }
        Ok(())
    }

    /// Queues up the descent into a subordinate CA.
    fn push_child_ca(
        &mut self,
        ctx: &ValidationContext,
        uri: uri::Rsync,
        cert: CaCertObject,
        result: &mut ValidationResult,
    ) {
        let issuer = match ctx.issuer() {
            Some(issuer) => issuer,
            None => return
        };
        if issuer.depth() + 1 >= self.max_ca_depth {
            warn!("{}: maximum CA depth reached, not descending.", uri);
            result.push(&uri);
            result.warn(validation::VALIDATOR_CA_DEPTH);
            result.pop();
            return
        }
        let child = match IssuerContext::chain(
            issuer, uri, cert.cert().clone()
        ) {
            Ok(child) => child,
            Err(Failed) => return
        };
        self.queue.push_back(ValidationContext::ca(
            ctx.tal().clone(), child
        ));
    }
}


//------------ ProcessEvent --------------------------------------------------

/// A lifecycle event of a validation process.
///
/// Cross-cutting concerns – logging, metrics, inconsistency tracking –
/// subscribe to these events instead of being layered into the process
/// itself.
#[derive(Debug)]
pub enum ProcessEvent<'a> {
    /// The run got past the start guard.
    Started {
        tal: &'a TrustAnchorLocator,
    },

    /// The trust anchor certificate extraction finished.
    AnchorFetched {
        tal: &'a TrustAnchorLocator,
        elapsed: Duration,
    },

    /// The walk finished and the verdict map is complete.
    ObjectsReady {
        tal: &'a TrustAnchorLocator,
        objects: &'a ValidatedObjects,
        result: &'a ValidationResult,
    },

    /// The run reached its terminal state.
    Finished {
        tal: &'a TrustAnchorLocator,
        outcome: &'a RunOutcome,
        elapsed: Duration,
    },

    /// The run died on an internal error.
    Exception {
        tal: &'a TrustAnchorLocator,
        message: &'a str,
    },
}


//------------ ProcessListener -----------------------------------------------

/// A subscriber to process lifecycle events.
pub trait ProcessListener: Send + Sync {
    fn on_event(&self, event: &ProcessEvent);
}


//------------ ProcessLogger -------------------------------------------------

/// Logs the lifecycle of every validation process.
struct ProcessLogger;

impl ProcessListener for ProcessLogger {
    fn on_event(&self, event: &ProcessEvent) {
        match *event {
            ProcessEvent::Started { tal } => {
                info!("Started validating {}.", tal.ca_name());
            }
            ProcessEvent::AnchorFetched { tal, elapsed } => {
                info!(
                    "{}: trust anchor certificate extracted in {} ms.",
                    tal.ca_name(), elapsed.as_millis()
                );
            }
            ProcessEvent::ObjectsReady { tal, objects, .. } => {
                info!(
                    "{}: {} objects validated, {} valid.",
                    tal.ca_name(), objects.len(), objects.valid_count()
                );
            }
            ProcessEvent::Finished { tal, outcome, elapsed } => {
                match *outcome {
                    RunOutcome::Success(_) => {
                        info!(
                            "Finished validating {} in {} ms.",
                            tal.ca_name(), elapsed.as_millis()
                        );
                    }
                    RunOutcome::Failure(ref message) => {
                        warn!(
                            "Validating {} failed after {} ms: {}",
                            tal.ca_name(), elapsed.as_millis(), message
                        );
                    }
                }
            }
            ProcessEvent::Exception { tal, message } => {
                error!("{}: {}", tal.ca_name(), message);
            }
        }
    }
}


//------------ TalMetricsRecorder --------------------------------------------

/// Builds the per-anchor metrics of one run from its events.
struct TalMetricsRecorder {
    metrics: Mutex<TalMetrics>,
}

impl TalMetricsRecorder {
    fn new(uri: uri::Rsync) -> Self {
        TalMetricsRecorder {
            metrics: Mutex::new(TalMetrics::new(uri)),
        }
    }

    /// Takes the finished metrics out of the recorder.
    fn take(&self) -> TalMetrics {
        self.metrics.lock().expect("poisoned lock").clone()
    }
}

impl ProcessListener for TalMetricsRecorder {
    fn on_event(&self, event: &ProcessEvent) {
        let mut metrics = self.metrics.lock().expect("poisoned lock");
        match *event {
            ProcessEvent::Started { .. } => { }
            ProcessEvent::AnchorFetched { elapsed, .. } => {
                metrics.extraction_elapsed = Some(elapsed);
            }
            ProcessEvent::ObjectsReady { objects, result, .. } => {
                metrics.objects_total = objects.len() as u32;
                metrics.objects_valid = objects.valid_count() as u32;
                let (total, inconsistent) = count_repositories(result);
                metrics.repositories_total = total;
                metrics.repositories_inconsistent = inconsistent;
            }
            ProcessEvent::Finished { outcome, elapsed, .. } => {
                metrics.validation_elapsed = Some(elapsed);
                metrics.validation_outcome = Some(match *outcome {
                    RunOutcome::Success(_) => "OK".into(),
                    RunOutcome::Failure(ref message) => {
                        format!("failed: {}", message)
                    }
                });
            }
            ProcessEvent::Exception { .. } => { }
        }
    }
}

/// Counts the publication points seen by a run and how many misbehaved.
///
/// A publication point is represented by its manifest; a point counts as
/// inconsistent if an incomplete or inconsistent repository condition was
/// recorded anywhere in its directory.
fn count_repositories(result: &ValidationResult) -> (u32, u32) {
    let mut total = HashSet::new();
    let mut inconsistent = HashSet::new();
    for (uri, _) in result.iter_locations() {
        if uri.ends_with(".mft") {
            total.insert(directory_of(uri).to_string());
        }
    }
    for (uri, metric) in result.iter_metrics() {
        if metric.name == validation::VALIDATOR_REPOSITORY_INCOMPLETE
            || metric.name == validation::VALIDATOR_REPOSITORY_INCONSISTENT
        {
            inconsistent.insert(directory_of(uri).to_string());
        }
    }
    (total.len() as u32, inconsistent.len() as u32)
}

/// Returns the directory portion of a URI.
fn directory_of(uri: &uri::Rsync) -> &str {
    let s = uri.as_str();
    match s.rfind('/') {
        Some(pos) => &s[..pos],
        None => s
    }
}


//------------ Helper Functions ----------------------------------------------

/// Converts a std duration into a chrono one.
///
/// Saturates at the maximum should anybody configure an interval of a
/// few hundred billion years.
fn duration_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::max_value())
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use bytes::Bytes;
    use crate::objects::{ValidatedCrl, ValidatedManifest};
    use crate::tal;

    /// A fetcher that counts what the walker asks it for.
    #[derive(Default)]
    struct StubFetcher {
        objects: AtomicUsize,
        crls: AtomicUsize,
    }

    impl ObjectFetcher for StubFetcher {
        fn prefetch(
            &self, _uri: &uri::Rsync, _result: &mut ValidationResult
        ) {
        }

        fn object(
            &self,
            _uri: &uri::Rsync,
            _spec: &FileContentSpec,
            _ctx: &ValidationContext,
            _result: &mut ValidationResult,
        ) -> Result<Option<RepositoryObject>, Failed> {
            self.objects.fetch_add(1, Ordering::Relaxed);
            Ok(Some(RepositoryObject::Unknown(Bytes::new())))
        }

        fn manifest(
            &self,
            _uri: &uri::Rsync,
            _ctx: &ValidationContext,
            _result: &mut ValidationResult,
        ) -> Result<Option<ValidatedManifest>, Failed> {
            Ok(None)
        }

        fn crl(
            &self,
            _uri: &uri::Rsync,
            _ctx: &ValidationContext,
            _result: &mut ValidationResult,
        ) -> Result<Option<ValidatedCrl>, Failed> {
            self.crls.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    fn uri(s: &str) -> uri::Rsync {
        uri::Rsync::from_str(s).unwrap()
    }

    /// A walker context requires an issuer; without one nothing happens.
    #[test]
    fn root_context_is_not_walked() {
        let fetcher = StubFetcher::default();
        let mut walker = TopDownWalker::new(&fetcher, 32);
        walker.add_trust_anchor(
            ValidationContext::root(tal::test_locator())
        );
        let mut result = ValidationResult::new();
        walker.execute(&mut result).unwrap();
        assert_eq!(fetcher.objects.load(Ordering::Relaxed), 0);
        assert_eq!(fetcher.crls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn repository_counting() {
        let mft = uri("rsync://example.net/mod/x.mft");
        let roa = uri("rsync://example.net/mod/a.roa");
        let other_mft = uri("rsync://example.net/other/y.mft");

        let mut result = ValidationResult::with_location(&mft);
        result.push(&roa);
        result.add_metric(
            validation::VALIDATOR_REPOSITORY_INCONSISTENT, "true"
        );
        result.pop();
        result.push(&other_mft);
        result.pop();

        let (total, inconsistent) = count_repositories(&result);
        assert_eq!(total, 2);
        assert_eq!(inconsistent, 1);
    }
}
