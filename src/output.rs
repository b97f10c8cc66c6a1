//! Listeners digesting fetch outcomes.
//!
//! The notifying fetcher only dispatches events; the types here do
//! something with them. The [`ValidatedObjectCollector`] builds the
//! URI → verdict map that a validation run publishes, the
//! [`RoaCollector`] extracts the attested route origins, the
//! [`ValidationSummaryCollector`] keeps the counts printed at the end of
//! a run, and the [`ObjectFetcherResultLogger`] writes a line per object
//! to the log.

use std::fmt;
use std::mem;
use std::sync::Mutex;
use log::{debug, warn};
use rpki::uri;
use crate::fetch::FetchListener;
use crate::objects::{
    RepositoryObject, ValidatedObject, ValidatedObjects
};
use crate::origins::{RouteOrigin, RouteOrigins};
use crate::validation::ValidationResult;


//------------ ObjectFetcherResultLogger -------------------------------------

/// Logs the verdict for every fetched object.
#[derive(Debug, Default)]
pub struct ObjectFetcherResultLogger;

impl FetchListener for ObjectFetcherResultLogger {
    fn after_fetch_success(
        &self,
        uri: &uri::Rsync,
        _object: &RepositoryObject,
        _result: &ValidationResult,
    ) {
        debug!("{}: validated", uri);
    }

    fn after_fetch_failure(
        &self, uri: &uri::Rsync, _result: &ValidationResult
    ) {
        warn!("{}: validation rejected", uri);
    }

    fn after_prefetch_failure(
        &self, uri: &uri::Rsync, _result: &ValidationResult
    ) {
        warn!("{}: prefetch failed", uri);
    }
}


//------------ ValidatedObjectCollector --------------------------------------

/// Builds the URI → verdict map published at the end of a run.
#[derive(Debug, Default)]
pub struct ValidatedObjectCollector {
    objects: Mutex<ValidatedObjects>,
}

impl ValidatedObjectCollector {
    pub fn new() -> Self {
        Default::default()
    }

    /// Takes the collected map out of the collector.
    pub fn take(&self) -> ValidatedObjects {
        mem::take(&mut *self.objects.lock().expect("poisoned lock"))
    }
}

impl FetchListener for ValidatedObjectCollector {
    fn after_fetch_success(
        &self,
        uri: &uri::Rsync,
        object: &RepositoryObject,
        result: &ValidationResult,
    ) {
        self.objects.lock().expect("poisoned lock").insert(
            ValidatedObject::new(
                uri.clone(),
                result.checks_at(uri).to_vec(),
                Some(object.clone()),
            )
        );
    }

    fn after_fetch_failure(
        &self, uri: &uri::Rsync, result: &ValidationResult
    ) {
        self.objects.lock().expect("poisoned lock").insert(
            ValidatedObject::new(
                uri.clone(),
                result.checks_at(uri).to_vec(),
                None,
            )
        );
    }
}


//------------ RoaCollector --------------------------------------------------

/// Collects the route origins attested by validated ROAs.
#[derive(Debug, Default)]
pub struct RoaCollector {
    origins: Mutex<RouteOrigins>,
}

impl RoaCollector {
    pub fn new() -> Self {
        Default::default()
    }

    /// Takes the collected origins out of the collector.
    pub fn take(&self) -> RouteOrigins {
        mem::take(&mut *self.origins.lock().expect("poisoned lock"))
    }
}

impl FetchListener for RoaCollector {
    fn after_fetch_success(
        &self,
        _uri: &uri::Rsync,
        object: &RepositoryObject,
        _result: &ValidationResult,
    ) {
        let roa = match object.as_roa() {
            Some(roa) => roa,
            None => return
        };
        let mut origins = self.origins.lock().expect("poisoned lock");
        let asn = roa.route().as_id();
        for addr in roa.route().iter() {
            origins.push(RouteOrigin::from_roa(asn, &addr));
        }
    }
}


//------------ ValidationSummaryCollector ------------------------------------

/// Counts what a validation run encountered.
#[derive(Debug, Default)]
pub struct ValidationSummaryCollector {
    summary: Mutex<ValidationSummary>,
}

impl ValidationSummaryCollector {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns a copy of the current counts.
    pub fn summary(&self) -> ValidationSummary {
        self.summary.lock().expect("poisoned lock").clone()
    }
}

impl FetchListener for ValidationSummaryCollector {
    fn after_fetch_success(
        &self,
        _uri: &uri::Rsync,
        object: &RepositoryObject,
        _result: &ValidationResult,
    ) {
        let mut summary = self.summary.lock().expect("poisoned lock");
        match *object {
            RepositoryObject::CaCert(_) => summary.ca_certs += 1,
            RepositoryObject::EeCert(_) => summary.ee_certs += 1,
            RepositoryObject::Manifest(_) => summary.manifests += 1,
            RepositoryObject::Crl(_) => summary.crls += 1,
            RepositoryObject::Roa(_) => summary.roas += 1,
            RepositoryObject::Gbr(_) => summary.gbrs += 1,
            RepositoryObject::Unknown(_) => summary.unknown += 1,
        }
    }

    fn after_fetch_failure(
        &self, _uri: &uri::Rsync, _result: &ValidationResult
    ) {
        self.summary.lock().expect("poisoned lock").rejected += 1;
    }
}


//------------ ValidationSummary ---------------------------------------------

/// The counts of a validation run by object type.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ValidationSummary {
    pub ca_certs: u32,
    pub ee_certs: u32,
    pub manifests: u32,
    pub crls: u32,
    pub roas: u32,
    pub gbrs: u32,
    pub unknown: u32,
    pub rejected: u32,
}

impl fmt::Display for ValidationSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Validation summary:")?;
        writeln!(f, "  CA certificates:  {}", self.ca_certs)?;
        writeln!(f, "  EE certificates:  {}", self.ee_certs)?;
        writeln!(f, "  manifests:        {}", self.manifests)?;
        writeln!(f, "  CRLs:             {}", self.crls)?;
        writeln!(f, "  ROAs:             {}", self.roas)?;
        writeln!(f, "  GBRs:             {}", self.gbrs)?;
        writeln!(f, "  other objects:    {}", self.unknown)?;
        writeln!(f, "  rejected objects: {}", self.rejected)
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;
    use bytes::Bytes;

    fn uri(s: &str) -> uri::Rsync {
        uri::Rsync::from_str(s).unwrap()
    }

    #[test]
    fn collector_builds_verdict_map() {
        let collector = ValidatedObjectCollector::new();
        let good = uri("rsync://example.net/mod/a.bin");
        let bad = uri("rsync://example.net/mod/b.bin");

        let mut result = ValidationResult::with_location(&good);
        collector.after_fetch_success(
            &good, &RepositoryObject::Unknown(Bytes::new()), &result
        );
        result.push(&bad);
        result.reject(crate::validation::VALIDATOR_FILE_CONTENT);
        collector.after_fetch_failure(&bad, &result);

        let objects = collector.take();
        assert_eq!(objects.len(), 2);
        assert!(objects.get(&good).unwrap().is_valid());
        assert!(!objects.get(&bad).unwrap().is_valid());

        // Taking drains the collector.
        assert!(collector.take().is_empty());
    }

    #[test]
    fn summary_counts_by_type() {
        let collector = ValidationSummaryCollector::new();
        let target = uri("rsync://example.net/mod/a.bin");
        let result = ValidationResult::with_location(&target);

        collector.after_fetch_success(
            &target, &RepositoryObject::Unknown(Bytes::new()), &result
        );
        collector.after_fetch_success(
            &target, &RepositoryObject::Gbr(Bytes::new()), &result
        );
        collector.after_fetch_failure(&target, &result);

        let summary = collector.summary();
        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.gbrs, 1);
        assert_eq!(summary.rejected, 1);
    }
}
