//! Recording the outcome of validating repository objects.
//!
//! Every fetch and every walk carries a [`ValidationResult`] that collects
//! the checks performed for each location visited. A location is the rsync
//! URI of the object currently being looked at. Locations form a stack so
//! that nested validation – say, checking a manifest while validating a
//! CRL – can temporarily move to a different location and return.
//!
//! The checks themselves are identified by well-known string keys. The keys
//! for conditions detected by the fetcher pipeline are defined as constants
//! here; the object validators contribute their own keys through the same
//! mechanism.

use std::collections::HashMap;
use std::sync::Arc;
use log::error;
use rpki::repository::cert::{Cert, ResourceCert};
use rpki::repository::crypto::keys::KeyIdentifier;
use rpki::repository::x509::Time;
use rpki::uri;
use crate::error::Failed;
use crate::tal::TrustAnchorLocator;


//------------ Check keys ----------------------------------------------------

/// The trust anchor certificate’s key matches the TAL.
pub const TRUST_ANCHOR_PUBLIC_KEY_MATCH: &str
    = "trust.anchor.public.key.match";

/// A requested object was not present in the object store.
pub const VALIDATOR_REPOSITORY_OBJECT_NOT_IN_CACHE: &str
    = "validator.repository.object.not.in.cache";

/// Some files listed on a manifest could not be fetched.
pub const VALIDATOR_REPOSITORY_INCOMPLETE: &str
    = "validator.repository.incomplete";

/// A fetched file’s hash disagrees with its manifest entry.
pub const VALIDATOR_REPOSITORY_INCONSISTENT: &str
    = "validator.repository.inconsistent";

/// The rsync invocation itself failed.
pub const VALIDATOR_RSYNC_COMMAND: &str = "validator.rsync.command";

/// A fetched file could not be read back from disk.
pub const VALIDATOR_READ_FILE: &str = "validator.read.file";

/// A file’s content does not match its content specification.
pub const VALIDATOR_FILE_CONTENT: &str = "validator.file.content";

/// Catch-all for unmapped remote failures.
pub const VALIDATOR_REPOSITORY_UNKNOWN: &str = "validator.repository.unknown";

/// An object could not be decoded into a known repository object type.
pub const VALIDATOR_UNKNOWN_OBJECT: &str = "validator.unknown.object";

/// An object failed cryptographic validation in its parent context.
pub const VALIDATOR_OBJECT_VALID: &str = "validator.object.valid";

/// The manifest referring to a CRL could itself be validated.
pub const VALIDATOR_CRL_MANIFEST_VALID: &str = "validator.crl.manifest.valid";

/// A file expected on a manifest is missing or listed more than once.
pub const VALIDATOR_MANIFEST_DOES_NOT_CONTAIN_FILE: &str
    = "validator.manifest.does.not.contain.file";

/// An object’s validity window has been left behind.
pub const VALIDATOR_OBJECT_STALE: &str = "validator.object.stale";

/// A certificate has been revoked by its CRL.
pub const VALIDATOR_CERT_NOT_REVOKED: &str = "cert.not.revoked";

/// The maximum CA chain depth has been exceeded.
pub const VALIDATOR_CA_DEPTH: &str = "validator.ca.chain.depth";

/// A certificate chain loops back onto itself.
pub const VALIDATOR_CIRCULAR_REFERENCE: &str = "validator.circular.reference";


//------------ CheckStatus ---------------------------------------------------

/// The status of a single validation check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}


//------------ ValidationCheck -----------------------------------------------

/// A single check performed at some location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationCheck {
    /// The well-known key of the check.
    key: &'static str,

    /// Whether the check passed, warned, or failed.
    status: CheckStatus,

    /// Free-form parameters further describing the check.
    params: Vec<String>,
}

impl ValidationCheck {
    fn new(key: &'static str, status: CheckStatus, params: Vec<String>) -> Self {
        ValidationCheck { key, status, params }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn status(&self) -> CheckStatus {
        self.status
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn is_failure(&self) -> bool {
        self.status == CheckStatus::Failed
    }
}


//------------ ValidationMetric ----------------------------------------------

/// A free-form metric recorded at some location.
#[derive(Clone, Debug)]
pub struct ValidationMetric {
    /// The name of the metric.
    pub name: String,

    /// The value of the metric.
    pub value: String,

    /// When the metric was recorded.
    pub when: Time,
}


//------------ ValidationResult ----------------------------------------------

/// The accumulated outcome of a fetch or walk.
///
/// The result keeps a record for every location visited. The record for the
/// current location – the top of the location stack – is the one all the
/// recording methods apply to.
#[derive(Clone, Debug, Default)]
pub struct ValidationResult {
    /// The records in the order their locations were first visited.
    records: Vec<LocationRecord>,

    /// The index of a location’s record in `records`.
    index: HashMap<uri::Rsync, usize>,

    /// The stack of current locations as indexes into `records`.
    current: Vec<usize>,
}

/// The checks and metrics recorded for a single location.
#[derive(Clone, Debug)]
struct LocationRecord {
    uri: uri::Rsync,
    checks: Vec<ValidationCheck>,
    metrics: Vec<ValidationMetric>,
}

impl ValidationResult {
    /// Creates a new, empty result.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a new result with the given location already pushed.
    pub fn with_location(uri: &uri::Rsync) -> Self {
        let mut res = Self::new();
        res.push(uri);
        res
    }

    /// Pushes a location, making it current.
    pub fn push(&mut self, uri: &uri::Rsync) {
        let idx = match self.index.get(uri) {
            Some(idx) => *idx,
            None => {
                let idx = self.records.len();
                self.records.push(LocationRecord {
                    uri: uri.clone(),
                    checks: Vec::new(),
                    metrics: Vec::new(),
                });
                self.index.insert(uri.clone(), idx);
                idx
            }
        };
        self.current.push(idx);
    }

    /// Pops the current location, returning to the previous one.
    pub fn pop(&mut self) {
        self.current.pop();
    }

    /// Returns the current location if there is one.
    pub fn current_location(&self) -> Option<&uri::Rsync> {
        self.current.last().map(|idx| &self.records[*idx].uri)
    }

    /// Records a check at the current location.
    fn record(
        &mut self, key: &'static str, status: CheckStatus, params: Vec<String>
    ) {
        match self.current.last() {
            Some(idx) => {
                self.records[*idx].checks.push(
                    ValidationCheck::new(key, status, params)
                );
            }
            None => {
                // A result without a location is a programming error but
                // not worth crashing a validation run over.
                error!("validation check {} recorded without location", key);
            }
        }
    }

    /// Records a passed check.
    pub fn pass(&mut self, key: &'static str) {
        self.record(key, CheckStatus::Passed, Vec::new())
    }

    /// Records a warning.
    pub fn warn(&mut self, key: &'static str) {
        self.record(key, CheckStatus::Warning, Vec::new())
    }

    /// Records a warning with parameters.
    pub fn warn_with(&mut self, key: &'static str, params: Vec<String>) {
        self.record(key, CheckStatus::Warning, params)
    }

    /// Records a failure.
    pub fn reject(&mut self, key: &'static str) {
        self.record(key, CheckStatus::Failed, Vec::new())
    }

    /// Records a failure with parameters.
    pub fn reject_with(&mut self, key: &'static str, params: Vec<String>) {
        self.record(key, CheckStatus::Failed, params)
    }

    /// Records a passed check if `cond` is true, a failure otherwise.
    ///
    /// Returns `cond` for convenient chaining into `if` expressions.
    pub fn reject_if_false(&mut self, cond: bool, key: &'static str) -> bool {
        if cond {
            self.pass(key)
        }
        else {
            self.reject(key)
        }
        cond
    }

    /// Records a passed check if `cond` is true, a warning otherwise.
    pub fn warn_if_false(&mut self, cond: bool, key: &'static str) -> bool {
        if cond {
            self.pass(key)
        }
        else {
            self.warn(key)
        }
        cond
    }

    /// Records a metric at the current location.
    pub fn add_metric(&mut self, name: &str, value: impl Into<String>) {
        if let Some(idx) = self.current.last() {
            self.records[*idx].metrics.push(ValidationMetric {
                name: name.into(),
                value: value.into(),
                when: Time::now(),
            });
        }
    }

    /// Returns whether any location has a failed check.
    pub fn has_failures(&self) -> bool {
        self.records.iter().any(|record| {
            record.checks.iter().any(ValidationCheck::is_failure)
        })
    }

    /// Returns whether the current location has a failed check.
    pub fn has_failure_for_current_location(&self) -> bool {
        match self.current.last() {
            Some(idx) => {
                self.records[*idx].checks.iter().any(
                    ValidationCheck::is_failure
                )
            }
            None => false
        }
    }

    /// Returns whether the given location has a failed check.
    pub fn has_failure_at(&self, uri: &uri::Rsync) -> bool {
        match self.index.get(uri) {
            Some(idx) => {
                self.records[*idx].checks.iter().any(
                    ValidationCheck::is_failure
                )
            }
            None => false
        }
    }

    /// Returns the checks recorded for the given location.
    pub fn checks_at(&self, uri: &uri::Rsync) -> &[ValidationCheck] {
        match self.index.get(uri) {
            Some(idx) => &self.records[*idx].checks,
            None => &[]
        }
    }

    /// Returns the distinct keys of all failed checks anywhere.
    pub fn failure_keys(&self) -> Vec<&'static str> {
        let mut res = Vec::new();
        for record in &self.records {
            for check in &record.checks {
                if check.is_failure() && !res.contains(&check.key) {
                    res.push(check.key)
                }
            }
        }
        res
    }

    /// Iterates over all visited locations with their checks.
    pub fn iter_locations(
        &self
    ) -> impl Iterator<Item = (&uri::Rsync, &[ValidationCheck])> {
        self.records.iter().map(|record| {
            (&record.uri, record.checks.as_slice())
        })
    }

    /// Iterates over all metrics recorded anywhere with their locations.
    pub fn iter_metrics(
        &self
    ) -> impl Iterator<Item = (&uri::Rsync, &ValidationMetric)> {
        self.records.iter().flat_map(|record| {
            record.metrics.iter().map(move |metric| (&record.uri, metric))
        })
    }
}


//------------ ValidationContext ---------------------------------------------

/// The context an object is validated in.
///
/// For the trust anchor certificate itself, the context only carries the
/// TAL with its expected public key. Everything below the trust anchor is
/// validated in the context of its issuing CA.
#[derive(Clone, Debug)]
pub struct ValidationContext {
    /// The trust anchor this walk hangs off.
    tal: Arc<TrustAnchorLocator>,

    /// The issuing CA, if the object is below the trust anchor.
    issuer: Option<Arc<IssuerContext>>,
}

impl ValidationContext {
    /// Creates the context for fetching the trust anchor certificate.
    pub fn root(tal: Arc<TrustAnchorLocator>) -> Self {
        ValidationContext { tal, issuer: None }
    }

    /// Creates a context below the given issuing CA.
    pub fn ca(tal: Arc<TrustAnchorLocator>, issuer: Arc<IssuerContext>) -> Self {
        ValidationContext { tal, issuer: Some(issuer) }
    }

    /// Returns the trust anchor locator of the context.
    pub fn tal(&self) -> &Arc<TrustAnchorLocator> {
        &self.tal
    }

    /// Returns the issuing CA if there is one.
    pub fn issuer(&self) -> Option<&Arc<IssuerContext>> {
        self.issuer.as_ref()
    }
}


//------------ IssuerContext -------------------------------------------------

/// A validated CA certificate plus references to all its ancestors.
#[derive(Clone, Debug)]
pub struct IssuerContext {
    /// The resource certificate of this CA.
    cert: ResourceCert,

    /// The certificate’s location.
    location: uri::Rsync,

    /// The CA repository URI of the certificate.
    repository_uri: uri::Rsync,

    /// The manifest URI of the certificate.
    manifest_uri: uri::Rsync,

    /// The issuing CA.
    ///
    /// This is `None` for a trust anchor certificate.
    parent: Option<Arc<IssuerContext>>,

    /// The number of CAs above this one.
    depth: usize,
}

impl IssuerContext {
    /// Creates the context for a validated trust anchor certificate.
    pub fn root(
        cert: ResourceCert, location: uri::Rsync
    ) -> Result<Arc<Self>, Failed> {
        Self::new(cert, location, None, 0)
    }

    /// Creates the context for a CA certificate issued by `issuer`.
    pub fn chain(
        issuer: &Arc<Self>, location: uri::Rsync, cert: ResourceCert
    ) -> Result<Arc<Self>, Failed> {
        Self::new(cert, location, Some(issuer.clone()), issuer.depth + 1)
    }

    /// Creates a new context from its various parts.
    fn new(
        cert: ResourceCert,
        location: uri::Rsync,
        parent: Option<Arc<IssuerContext>>,
        depth: usize,
    ) -> Result<Arc<Self>, Failed> {
        let repository_uri = match cert.ca_repository() {
            Some(uri) => uri.clone(),
            None => {
                // This is checked during certificate validation, so it
                // should never happen.
                error!("CA cert {} has no repository URI.", location);
                return Err(Failed)
            }
        };
        let manifest_uri = match cert.rpki_manifest() {
            Some(uri) => uri.clone(),
            None => {
                error!("CA cert {} has no manifest URI.", location);
                return Err(Failed)
            }
        };
        Ok(Arc::new(IssuerContext {
            cert, location, repository_uri, manifest_uri, parent, depth,
        }))
    }

    /// Checks whether a child cert has appeared in the chain already.
    pub fn check_loop(&self, cert: &Cert) -> Result<(), Failed> {
        self._check_loop(cert.subject_key_identifier())
    }

    /// The actual recursive loop test.
    ///
    /// We are comparing certificates by comparing their subject key
    /// identifiers.
    fn _check_loop(&self, key_id: KeyIdentifier) -> Result<(), Failed> {
        if self.cert.subject_key_identifier() == key_id {
            Err(Failed)
        }
        else if let Some(ref parent) = self.parent {
            parent._check_loop(key_id)
        }
        else {
            Ok(())
        }
    }

    /// Returns a reference to the resource certificate.
    pub fn cert(&self) -> &ResourceCert {
        &self.cert
    }

    /// Returns the certificate’s location.
    pub fn location(&self) -> &uri::Rsync {
        &self.location
    }

    /// Returns the caRepository URI of the certificate.
    pub fn repository_uri(&self) -> &uri::Rsync {
        &self.repository_uri
    }

    /// Returns the rpkiManifest URI of the certificate.
    pub fn manifest_uri(&self) -> &uri::Rsync {
        &self.manifest_uri
    }

    /// Returns the number of CAs above this one.
    pub fn depth(&self) -> usize {
        self.depth
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    fn uri(s: &str) -> uri::Rsync {
        uri::Rsync::from_str(s).unwrap()
    }

    #[test]
    fn location_stack() {
        let mut result = ValidationResult::new();
        assert!(result.current_location().is_none());

        result.push(&uri("rsync://example.net/mod/a.cer"));
        result.push(&uri("rsync://example.net/mod/b.roa"));
        assert_eq!(
            result.current_location().unwrap().as_str(),
            "rsync://example.net/mod/b.roa"
        );
        result.pop();
        assert_eq!(
            result.current_location().unwrap().as_str(),
            "rsync://example.net/mod/a.cer"
        );
    }

    #[test]
    fn failure_is_per_location() {
        let a = uri("rsync://example.net/mod/a.cer");
        let b = uri("rsync://example.net/mod/b.roa");

        let mut result = ValidationResult::with_location(&a);
        result.pass(VALIDATOR_OBJECT_VALID);
        result.push(&b);
        result.reject(VALIDATOR_FILE_CONTENT);

        assert!(result.has_failures());
        assert!(result.has_failure_for_current_location());
        assert!(result.has_failure_at(&b));
        assert!(!result.has_failure_at(&a));

        result.pop();
        assert!(!result.has_failure_for_current_location());
    }

    #[test]
    fn reject_if_false_records_both_ways() {
        let a = uri("rsync://example.net/mod/a.cer");
        let mut result = ValidationResult::with_location(&a);

        assert!(result.reject_if_false(true, VALIDATOR_FILE_CONTENT));
        assert!(!result.reject_if_false(false, VALIDATOR_FILE_CONTENT));

        let checks = result.checks_at(&a);
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].status(), CheckStatus::Passed);
        assert_eq!(checks[1].status(), CheckStatus::Failed);
    }

    #[test]
    fn failure_keys_are_distinct() {
        let a = uri("rsync://example.net/mod/a.cer");
        let mut result = ValidationResult::with_location(&a);
        result.reject(VALIDATOR_RSYNC_COMMAND);
        result.reject(VALIDATOR_RSYNC_COMMAND);
        result.warn(VALIDATOR_REPOSITORY_INCOMPLETE);
        assert_eq!(result.failure_keys(), [VALIDATOR_RSYNC_COMMAND]);
    }
}
