//! Parsed and validated repository objects.
//!
//! This module is the boundary to the cryptographic machinery of the
//! [rpki crate][rpki]. The fetcher pipeline hands in raw bytes plus the
//! context they were found in; what comes back is either a
//! [`RepositoryObject`] that survived decoding and validation or nothing,
//! with the reasons recorded on the [`ValidationResult`].
//!
//! Since validating a certificate requires checking it against its CRL,
//! and CRLs are themselves repository objects, the functions here take a
//! [`CrlLocator`]. The fetcher chain implements that trait with its
//! outermost layer so CRL lookups enjoy caching and notification like any
//! other fetch.

use std::collections::HashMap;
use bytes::Bytes;
use log::warn;
use rpki::repository::cert::{Cert, KeyUsage, ResourceCert};
use rpki::repository::crl::Crl;
use rpki::repository::manifest::{Manifest, ManifestHash};
use rpki::repository::roa::{Roa, RouteOriginAttestation};
use rpki::repository::sigobj::SignedObject;
use rpki::repository::x509::{Serial, Time, ValidationError};
use rpki::uri;
use crate::error::Failed;
use crate::validation::{
    self, ValidationCheck, ValidationContext, ValidationResult
};


//------------ ObjectPolicy --------------------------------------------------

/// Knobs governing object validation.
#[derive(Clone, Copy, Debug)]
pub struct ObjectPolicy {
    /// Apply strict decoding rules?
    pub strict: bool,

    /// The grace window for objects past their validity in days.
    ///
    /// An object whose next-update time lies in the past is warned about
    /// while within the window and rejected beyond it.
    pub max_stale_days: u64,
}

impl Default for ObjectPolicy {
    fn default() -> Self {
        ObjectPolicy { strict: false, max_stale_days: 7 }
    }
}


//------------ CrlLocator ----------------------------------------------------

/// Access to the CRL needed while validating an object.
pub trait CrlLocator {
    /// Returns the validated CRL at the given URI.
    fn crl(
        &self,
        uri: &uri::Rsync,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedCrl>, Failed>;
}


//------------ FileContentSpec -----------------------------------------------

/// The expectation for the content of a fetched file.
///
/// For files listed on a manifest this carries the manifest’s hash for the
/// file; for anything fetched by plain URI it is unrestricted.
#[derive(Clone, Debug, Default)]
pub struct FileContentSpec {
    hash: Option<ManifestHash>,
}

impl FileContentSpec {
    /// Creates a specification that accepts any content.
    pub fn unrestricted() -> Self {
        Default::default()
    }

    /// Creates a specification requiring the given manifest hash.
    pub fn from_hash(hash: ManifestHash) -> Self {
        FileContentSpec { hash: Some(hash) }
    }

    /// Returns whether the specification restricts content at all.
    pub fn is_restricted(&self) -> bool {
        self.hash.is_some()
    }

    /// Returns the required SHA-256 digest if there is one.
    ///
    /// Returns `None` both for unrestricted specifications and for hashes
    /// using an algorithm other than SHA-256, since only the latter can be
    /// used as keys into the content-addressed store.
    pub fn sha256(&self) -> Option<&[u8]> {
        match self.hash {
            Some(ref hash) if hash.algorithm().is_sha256() => {
                Some(hash.as_slice())
            }
            _ => None
        }
    }

    /// Returns whether the given content satisfies the specification.
    pub fn is_satisfied_by(&self, content: &[u8]) -> bool {
        match self.hash {
            Some(ref hash) => hash.verify(content).is_ok(),
            None => true
        }
    }
}


//------------ RepositoryObject ----------------------------------------------

/// A repository object that survived decoding and validation.
#[derive(Clone, Debug)]
pub enum RepositoryObject {
    /// A CA certificate, including the trust anchor certificate.
    CaCert(CaCertObject),

    /// An end-entity certificate, e.g., a BGPsec router certificate.
    EeCert(Bytes),

    /// A manifest.
    Manifest(ValidatedManifest),

    /// A certificate revocation list.
    Crl(ValidatedCrl),

    /// A route origin attestation.
    Roa(RoaObject),

    /// A Ghostbuster record.
    Gbr(Bytes),

    /// An object of a type we don’t know.
    Unknown(Bytes),
}

impl RepositoryObject {
    /// Parses and validates an object fetched for `uri`.
    ///
    /// The object kind is determined from the URI’s file extension the way
    /// repositories publish them. Returns `None` if the object cannot be
    /// decoded or does not validate in the given context, with the checks
    /// recorded at the current location of `result`.
    pub fn validate_bytes(
        uri: &uri::Rsync,
        bytes: Bytes,
        ctx: &ValidationContext,
        crl_locator: &dyn CrlLocator,
        policy: ObjectPolicy,
        result: &mut ValidationResult,
    ) -> Result<Option<Self>, Failed> {
        if uri.ends_with(".cer") {
            validate_cert(uri, bytes, ctx, crl_locator, policy, result)
        }
        else if uri.ends_with(".mft") {
            // The revocation status of a manifest fetched through the
            // generic path is checked by the validating fetcher as part
            // of the mutual CRL/manifest dance.
            Ok(validate_manifest_with_crl(
                uri, bytes, ctx, None, policy, result
            ).map(RepositoryObject::Manifest))
        }
        else if uri.ends_with(".crl") {
            Ok(validate_crl_ignoring_hash(
                uri, bytes, ctx, policy, result
            ).map(RepositoryObject::Crl))
        }
        else if uri.ends_with(".roa") {
            validate_roa(uri, bytes, ctx, crl_locator, policy, result)
        }
        else if uri.ends_with(".gbr") {
            validate_gbr(uri, bytes, ctx, crl_locator, policy, result)
        }
        else {
            result.warn(validation::VALIDATOR_UNKNOWN_OBJECT);
            Ok(Some(RepositoryObject::Unknown(bytes)))
        }
    }

    /// Returns the CA certificate if the object is one.
    pub fn as_ca_cert(&self) -> Option<&CaCertObject> {
        match *self {
            RepositoryObject::CaCert(ref cert) => Some(cert),
            _ => None
        }
    }

    /// Returns the manifest if the object is one.
    pub fn as_manifest(&self) -> Option<&ValidatedManifest> {
        match *self {
            RepositoryObject::Manifest(ref manifest) => Some(manifest),
            _ => None
        }
    }

    /// Returns the CRL if the object is one.
    pub fn as_crl(&self) -> Option<&ValidatedCrl> {
        match *self {
            RepositoryObject::Crl(ref crl) => Some(crl),
            _ => None
        }
    }

    /// Returns the ROA if the object is one.
    pub fn as_roa(&self) -> Option<&RoaObject> {
        match *self {
            RepositoryObject::Roa(ref roa) => Some(roa),
            _ => None
        }
    }
}


//------------ CaCertObject --------------------------------------------------

/// A validated CA certificate together with its raw bytes.
#[derive(Clone, Debug)]
pub struct CaCertObject {
    /// The validated resource certificate.
    cert: ResourceCert,

    /// The raw bytes the certificate was decoded from.
    bytes: Bytes,
}

impl CaCertObject {
    pub fn cert(&self) -> &ResourceCert {
        &self.cert
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Returns the URI of the certificate’s manifest.
    pub fn manifest_uri(&self) -> Option<&uri::Rsync> {
        self.cert.rpki_manifest()
    }
}


//------------ ValidatedManifest ---------------------------------------------

/// The content of a manifest that passed validation.
#[derive(Clone, Debug)]
pub struct ValidatedManifest {
    /// The files listed on the manifest in listing order.
    files: Vec<(String, ManifestHash)>,

    /// The URI of the CRL covering the manifest’s publication point.
    crl_uri: uri::Rsync,

    /// The serial number of the manifest’s EE certificate.
    ee_serial: Serial,

    /// The time the next manifest update was promised.
    next_update: Time,

    /// The raw bytes of the manifest.
    bytes: Bytes,
}

impl ValidatedManifest {
    /// Creates a manifest from its parts.
    ///
    /// This is how the validating fetcher builds the value; it is public
    /// within the crate so fetcher tests can fabricate manifests.
    pub(crate) fn new(
        files: Vec<(String, ManifestHash)>,
        crl_uri: uri::Rsync,
        ee_serial: Serial,
        next_update: Time,
        bytes: Bytes,
    ) -> Self {
        ValidatedManifest { files, crl_uri, ee_serial, next_update, bytes }
    }

    /// Returns the serial number of the manifest’s EE certificate.
    pub fn ee_serial(&self) -> Serial {
        self.ee_serial
    }

    /// Returns the files listed on the manifest.
    pub fn files(&self) -> &[(String, ManifestHash)] {
        &self.files
    }

    /// Returns the URI of the publication point’s CRL.
    pub fn crl_uri(&self) -> &uri::Rsync {
        &self.crl_uri
    }

    /// Returns the promised time of the next update.
    pub fn next_update(&self) -> Time {
        self.next_update
    }

    /// Returns the raw bytes of the manifest.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Returns whether the manifest lists the given file name.
    pub fn contains_file(&self, name: &str) -> bool {
        self.files.iter().any(|(file, _)| file == name)
    }

    /// Returns the content specification for the given file name.
    pub fn file_content_spec(&self, name: &str) -> Option<FileContentSpec> {
        self.files.iter().find(|(file, _)| file == name).map(|(_, hash)| {
            FileContentSpec::from_hash(hash.clone())
        })
    }

    /// Returns whether `content` matches the hash listed for `name`.
    pub fn verify_file_contents(&self, name: &str, content: &[u8]) -> bool {
        self.files.iter().find(|(file, _)| file == name).map(|(_, hash)| {
            hash.verify(content).is_ok()
        }).unwrap_or(false)
    }
}


//------------ ValidatedCrl --------------------------------------------------

/// A CRL that passed signature validation.
#[derive(Clone, Debug)]
pub struct ValidatedCrl {
    /// The decoded CRL.
    crl: Crl,

    /// The raw bytes of the CRL.
    bytes: Bytes,
}

impl ValidatedCrl {
    pub fn crl(&self) -> &Crl {
        &self.crl
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Returns the time the next CRL update was promised.
    pub fn next_update(&self) -> Time {
        self.crl.next_update()
    }
}


//------------ RoaObject -----------------------------------------------------

/// A validated route origin attestation.
#[derive(Clone, Debug)]
pub struct RoaObject {
    /// The attested route origins.
    route: RouteOriginAttestation,

    /// The raw bytes of the ROA.
    bytes: Bytes,
}

impl RoaObject {
    pub fn route(&self) -> &RouteOriginAttestation {
        &self.route
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}


//------------ ValidatedObject -----------------------------------------------

/// The terminal verdict about one URI of a validation walk.
#[derive(Clone, Debug)]
pub struct ValidatedObject {
    /// The location of the object.
    uri: uri::Rsync,

    /// The checks recorded for the location.
    checks: Vec<ValidationCheck>,

    /// The object, if it survived validation.
    object: Option<RepositoryObject>,
}

impl ValidatedObject {
    /// Creates a new validated object.
    pub fn new(
        uri: uri::Rsync,
        checks: Vec<ValidationCheck>,
        object: Option<RepositoryObject>,
    ) -> Self {
        ValidatedObject { uri, checks, object }
    }

    pub fn uri(&self) -> &uri::Rsync {
        &self.uri
    }

    pub fn checks(&self) -> &[ValidationCheck] {
        &self.checks
    }

    /// Returns the object if the verdict was positive.
    pub fn object(&self) -> Option<&RepositoryObject> {
        self.object.as_ref()
    }

    /// Returns whether the object validated successfully.
    ///
    /// The checks may still contain warnings.
    pub fn is_valid(&self) -> bool {
        self.object.is_some()
            && !self.checks.iter().any(ValidationCheck::is_failure)
    }
}


//------------ ValidatedObjects ----------------------------------------------

/// The URI → verdict map produced by one validation walk.
#[derive(Clone, Debug, Default)]
pub struct ValidatedObjects {
    map: HashMap<uri::Rsync, ValidatedObject>,
}

impl ValidatedObjects {
    pub fn new() -> Self {
        Default::default()
    }

    /// Inserts a verdict, replacing any earlier one for the same URI.
    pub fn insert(&mut self, object: ValidatedObject) {
        self.map.insert(object.uri().clone(), object);
    }

    pub fn get(&self, uri: &uri::Rsync) -> Option<&ValidatedObject> {
        self.map.get(uri)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatedObject> {
        self.map.values()
    }

    /// Returns the number of objects with a positive verdict.
    pub fn valid_count(&self) -> usize {
        self.map.values().filter(|object| object.is_valid()).count()
    }
}


//------------ Validation functions ------------------------------------------

/// Checks an object’s next-update time against the grace window.
///
/// Returns whether the object is still acceptable. Within the window the
/// object gets a warning, beyond it a failure.
pub fn check_stale(
    next_update: Time,
    policy: ObjectPolicy,
    result: &mut ValidationResult,
) -> bool {
    let now = Time::now();
    if next_update >= now {
        return true
    }
    let grace = (policy.max_stale_days as i64).saturating_mul(86400);
    if next_update.timestamp().saturating_add(grace) >= now.timestamp() {
        result.warn(validation::VALIDATOR_OBJECT_STALE);
        true
    }
    else {
        result.reject(validation::VALIDATOR_OBJECT_STALE);
        false
    }
}

/// Validates a certificate fetched for `uri`.
///
/// Without an issuer in the context, the certificate is validated as the
/// trust anchor against the TAL’s public key. Otherwise it is validated
/// against the issuing CA and checked against the CA’s CRL.
fn validate_cert(
    uri: &uri::Rsync,
    bytes: Bytes,
    ctx: &ValidationContext,
    crl_locator: &dyn CrlLocator,
    policy: ObjectPolicy,
    result: &mut ValidationResult,
) -> Result<Option<RepositoryObject>, Failed> {
    let cert = match Cert::decode(bytes.clone()) {
        Ok(cert) => cert,
        Err(_) => {
            warn!("{}: failed to decode certificate.", uri);
            result.reject(validation::VALIDATOR_UNKNOWN_OBJECT);
            return Ok(None)
        }
    };

    let issuer = match ctx.issuer() {
        Some(issuer) => issuer,
        None => {
            // Trust anchor certificate: the key must match the TAL.
            let tal = ctx.tal();
            if !result.reject_if_false(
                cert.subject_public_key_info() == tal.key_info(),
                validation::TRUST_ANCHOR_PUBLIC_KEY_MATCH
            ) {
                warn!("{}: key doesn't match TAL.", uri);
                return Ok(None)
            }
            let cert = match cert.validate_ta(
                tal.info().clone(), policy.strict
            ) {
                Ok(cert) => cert,
                Err(_) => {
                    warn!("{}: trust anchor doesn't validate.", uri);
                    result.reject(validation::VALIDATOR_OBJECT_VALID);
                    return Ok(None)
                }
            };
            return Ok(Some(RepositoryObject::CaCert(
                CaCertObject { cert, bytes }
            )))
        }
    };

    if cert.key_usage() == KeyUsage::Ca {
        if issuer.check_loop(&cert).is_err() {
            warn!("{}: certificate loop detected.", uri);
            result.reject(validation::VALIDATOR_CIRCULAR_REFERENCE);
            return Ok(None)
        }
        let cert = match cert.validate_ca(issuer.cert(), policy.strict) {
            Ok(cert) => cert,
            Err(_) => {
                warn!("{}: CA certificate failed to validate.", uri);
                result.reject(validation::VALIDATOR_OBJECT_VALID);
                return Ok(None)
            }
        };
        if !check_revocation(
            uri, cert.crl_uri(), cert.serial_number(),
            ctx, crl_locator, result
        )? {
            return Ok(None)
        }
        Ok(Some(RepositoryObject::CaCert(CaCertObject { cert, bytes })))
    }
    else {
        if cert.validate_router(issuer.cert(), policy.strict).is_err() {
            warn!("{}: router certificate failed to validate.", uri);
            result.reject(validation::VALIDATOR_OBJECT_VALID);
            return Ok(None)
        }
        if !check_revocation(
            uri, cert.crl_uri(), cert.serial_number(),
            ctx, crl_locator, result
        )? {
            return Ok(None)
        }
        Ok(Some(RepositoryObject::EeCert(bytes)))
    }
}

/// Validates a manifest fetched for `uri`.
///
/// If `crl` is given, the manifest’s EE certificate is checked against it;
/// the validating fetcher leaves it out during the first step of the
/// mutual CRL/manifest validation.
pub fn validate_manifest_with_crl(
    uri: &uri::Rsync,
    bytes: Bytes,
    ctx: &ValidationContext,
    crl: Option<&ValidatedCrl>,
    policy: ObjectPolicy,
    result: &mut ValidationResult,
) -> Option<ValidatedManifest> {
    let issuer = match ctx.issuer() {
        Some(issuer) => issuer,
        None => {
            // A manifest directly below the TAL context cannot be
            // validated at all.
            result.reject(validation::VALIDATOR_OBJECT_VALID);
            return None
        }
    };
    let manifest = match Manifest::decode(bytes.clone(), policy.strict) {
        Ok(manifest) => manifest,
        Err(_) => {
            warn!("{}: failed to decode manifest.", uri);
            result.reject(validation::VALIDATOR_UNKNOWN_OBJECT);
            return None
        }
    };
    let (ee_cert, content) = match manifest.validate(
        issuer.cert(), policy.strict
    ) {
        Ok(some) => some,
        Err(_) => {
            warn!("{}: failed to validate manifest.", uri);
            result.reject(validation::VALIDATOR_OBJECT_VALID);
            return None
        }
    };
    if !check_stale(content.next_update(), policy, result) {
        warn!("{}: stale manifest.", uri);
        return None
    }
    if let Some(crl) = crl {
        if !result.reject_if_false(
            !crl.crl().contains(ee_cert.serial_number()),
            validation::VALIDATOR_CERT_NOT_REVOKED
        ) {
            warn!("{}: manifest certificate has been revoked.", uri);
            return None
        }
    }

    let crl_uri = match ee_cert.crl_uri() {
        Some(crl_uri) if crl_uri.ends_with(".crl") => crl_uri.clone(),
        _ => {
            warn!("{}: invalid CRL URI.", uri);
            result.reject(validation::VALIDATOR_OBJECT_VALID);
            return None
        }
    };
    let ee_serial = ee_cert.serial_number();

    let mut files = Vec::with_capacity(content.len());
    for item in content.iter() {
        let (file, hash) = item.into_pair();
        let file = match std::str::from_utf8(&file) {
            Ok(file) if file.is_ascii() => file.to_string(),
            _ => {
                warn!(
                    "{}: illegal file name {} in manifest.",
                    uri, String::from_utf8_lossy(&file)
                );
                result.reject(validation::VALIDATOR_OBJECT_VALID);
                return None
            }
        };
        if files.iter().any(|(seen, _)| *seen == file) {
            warn!("{}: duplicate file {} in manifest.", uri, file);
            result.reject_with(
                validation::VALIDATOR_MANIFEST_DOES_NOT_CONTAIN_FILE,
                vec![file, "duplicate".into()]
            );
            return None
        }
        files.push((
            file, ManifestHash::new(hash, content.file_hash_alg())
        ));
    }

    Some(ValidatedManifest::new(
        files, crl_uri, ee_serial, content.next_update(), bytes
    ))
}

/// Validates a CRL without checking it against any manifest hash.
///
/// This is the first step of the mutual CRL/manifest validation; the hash
/// is re-checked against the manifest once that is available.
pub fn validate_crl_ignoring_hash(
    uri: &uri::Rsync,
    bytes: Bytes,
    ctx: &ValidationContext,
    policy: ObjectPolicy,
    result: &mut ValidationResult,
) -> Option<ValidatedCrl> {
    let issuer = match ctx.issuer() {
        Some(issuer) => issuer,
        None => {
            result.reject(validation::VALIDATOR_OBJECT_VALID);
            return None
        }
    };
    let crl = match Crl::decode(bytes.clone()) {
        Ok(crl) => crl,
        Err(_) => {
            warn!("{}: failed to decode CRL.", uri);
            result.reject(validation::VALIDATOR_UNKNOWN_OBJECT);
            return None
        }
    };
    if crl.validate(
        issuer.cert().subject_public_key_info()
    ).is_err() {
        warn!("{}: failed to validate CRL.", uri);
        result.reject(validation::VALIDATOR_OBJECT_VALID);
        return None
    }
    if !check_stale(crl.next_update(), policy, result) {
        warn!("{}: stale CRL.", uri);
        return None
    }
    Some(ValidatedCrl { crl, bytes })
}

/// Validates a ROA fetched for `uri`.
fn validate_roa(
    uri: &uri::Rsync,
    bytes: Bytes,
    ctx: &ValidationContext,
    crl_locator: &dyn CrlLocator,
    policy: ObjectPolicy,
    result: &mut ValidationResult,
) -> Result<Option<RepositoryObject>, Failed> {
    let issuer = match ctx.issuer() {
        Some(issuer) => issuer,
        None => {
            result.reject(validation::VALIDATOR_OBJECT_VALID);
            return Ok(None)
        }
    };
    let roa = match Roa::decode(bytes.clone(), policy.strict) {
        Ok(roa) => roa,
        Err(_) => {
            warn!("{}: failed to decode ROA.", uri);
            result.reject(validation::VALIDATOR_UNKNOWN_OBJECT);
            return Ok(None)
        }
    };
    let mut verdict = Ok(true);
    match roa.process(issuer.cert(), policy.strict, |cert| {
        verdict = check_revocation(
            uri, cert.crl_uri(), cert.serial_number(),
            ctx, crl_locator, result
        );
        match verdict {
            Ok(true) => Ok(()),
            _ => Err(ValidationError)
        }
    }) {
        Ok((_, route)) => {
            Ok(Some(RepositoryObject::Roa(RoaObject { route, bytes })))
        }
        Err(_) => {
            verdict?;
            warn!("{}: ROA validation failed.", uri);
            if !result.has_failure_for_current_location() {
                result.reject(validation::VALIDATOR_OBJECT_VALID);
            }
            Ok(None)
        }
    }
}

/// Validates a Ghostbuster record fetched for `uri`.
fn validate_gbr(
    uri: &uri::Rsync,
    bytes: Bytes,
    ctx: &ValidationContext,
    crl_locator: &dyn CrlLocator,
    policy: ObjectPolicy,
    result: &mut ValidationResult,
) -> Result<Option<RepositoryObject>, Failed> {
    let issuer = match ctx.issuer() {
        Some(issuer) => issuer,
        None => {
            result.reject(validation::VALIDATOR_OBJECT_VALID);
            return Ok(None)
        }
    };
    let obj = match SignedObject::decode(bytes.clone(), policy.strict) {
        Ok(obj) => obj,
        Err(_) => {
            warn!("{}: failed to decode.", uri);
            result.reject(validation::VALIDATOR_UNKNOWN_OBJECT);
            return Ok(None)
        }
    };
    let mut verdict = Ok(true);
    match obj.process(issuer.cert(), policy.strict, |cert| {
        verdict = check_revocation(
            uri, cert.crl_uri(), cert.serial_number(),
            ctx, crl_locator, result
        );
        match verdict {
            Ok(true) => Ok(()),
            _ => Err(ValidationError)
        }
    }) {
        Ok((_, content)) => Ok(Some(RepositoryObject::Gbr(content))),
        Err(_) => {
            verdict?;
            warn!("{}: validation failed.", uri);
            if !result.has_failure_for_current_location() {
                result.reject(validation::VALIDATOR_OBJECT_VALID);
            }
            Ok(None)
        }
    }
}

/// Checks whether a certificate has been revoked by its CRL.
///
/// Returns whether the certificate is in the clear. The CRL is fetched
/// through the locator, i.e., through the outermost fetcher layer.
fn check_revocation(
    uri: &uri::Rsync,
    crl_uri: Option<&uri::Rsync>,
    serial: Serial,
    ctx: &ValidationContext,
    crl_locator: &dyn CrlLocator,
    result: &mut ValidationResult,
) -> Result<bool, Failed> {
    let crl_uri = match crl_uri {
        Some(crl_uri) => crl_uri.clone(),
        None => {
            warn!("{}: certificate has no CRL URI.", uri);
            result.reject(validation::VALIDATOR_OBJECT_VALID);
            return Ok(false)
        }
    };
    let crl = match crl_locator.crl(&crl_uri, ctx, result)? {
        Some(crl) => crl,
        None => {
            result.reject(validation::VALIDATOR_CERT_NOT_REVOKED);
            return Ok(false)
        }
    };
    if !result.reject_if_false(
        !crl.crl().contains(serial),
        validation::VALIDATOR_CERT_NOT_REVOKED
    ) {
        warn!("{}: certificate has been revoked.", uri);
        return Ok(false)
    }
    Ok(true)
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;
    use chrono::Utc;
    use ring::digest;
    use rpki::repository::crypto::digest::DigestAlgorithm;
    use crate::validation::VALIDATOR_OBJECT_STALE;

    fn sha256_spec(content: &[u8]) -> FileContentSpec {
        let hash = digest::digest(&digest::SHA256, content);
        FileContentSpec::from_hash(ManifestHash::new(
            Bytes::copy_from_slice(hash.as_ref()),
            DigestAlgorithm::sha256(),
        ))
    }

    #[test]
    fn content_spec() {
        let spec = sha256_spec(b"hello");
        assert!(spec.is_restricted());
        assert!(spec.sha256().is_some());
        assert!(spec.is_satisfied_by(b"hello"));
        assert!(!spec.is_satisfied_by(b"goodbye"));

        let any = FileContentSpec::unrestricted();
        assert!(!any.is_restricted());
        assert!(any.sha256().is_none());
        assert!(any.is_satisfied_by(b"anything"));
    }

    #[test]
    fn stale_grading() {
        let uri = uri::Rsync::from_str("rsync://example.net/m/x.mft").unwrap();
        let policy = ObjectPolicy { strict: false, max_stale_days: 7 };

        // Not yet stale.
        let mut result = ValidationResult::with_location(&uri);
        assert!(check_stale(
            (Utc::now() + chrono::Duration::hours(1)).into(),
            policy, &mut result
        ));
        assert!(!result.has_failures());

        // Within the grace window: warning only.
        let mut result = ValidationResult::with_location(&uri);
        assert!(check_stale(
            (Utc::now() - chrono::Duration::days(2)).into(),
            policy, &mut result
        ));
        assert!(!result.has_failures());
        assert!(result.checks_at(&uri).iter().any(|check| {
            check.key() == VALIDATOR_OBJECT_STALE && !check.is_failure()
        }));

        // Beyond the grace window: failure.
        let mut result = ValidationResult::with_location(&uri);
        assert!(!check_stale(
            (Utc::now() - chrono::Duration::days(30)).into(),
            policy, &mut result
        ));
        assert!(result.has_failure_for_current_location());
    }

    #[test]
    fn manifest_file_lookup() {
        let manifest = ValidatedManifest::new(
            vec![
                ("a.roa".into(), sha256_spec(b"roa").hash.unwrap()),
                ("b.cer".into(), sha256_spec(b"cer").hash.unwrap()),
            ],
            uri::Rsync::from_str("rsync://example.net/m/x.crl").unwrap(),
            Serial::from(12u64),
            Time::now(),
            Bytes::new(),
        );
        assert!(manifest.contains_file("a.roa"));
        assert!(!manifest.contains_file("c.gbr"));
        assert!(manifest.verify_file_contents("a.roa", b"roa"));
        assert!(!manifest.verify_file_contents("a.roa", b"other"));
        assert!(manifest.file_content_spec("b.cer").unwrap().is_restricted());
        assert!(manifest.file_content_spec("c.gbr").is_none());
    }

    #[test]
    fn validated_object_verdicts() {
        let uri = uri::Rsync::from_str("rsync://example.net/m/a.bin").unwrap();
        let mut result = ValidationResult::with_location(&uri);
        result.warn(crate::validation::VALIDATOR_REPOSITORY_INCOMPLETE);

        let valid = ValidatedObject::new(
            uri.clone(),
            result.checks_at(&uri).to_vec(),
            Some(RepositoryObject::Unknown(Bytes::new())),
        );
        assert!(valid.is_valid());

        result.reject(crate::validation::VALIDATOR_FILE_CONTENT);
        let invalid = ValidatedObject::new(
            uri.clone(), result.checks_at(&uri).to_vec(), None
        );
        assert!(!invalid.is_valid());

        let mut map = ValidatedObjects::new();
        map.insert(valid);
        map.insert(invalid);
        assert_eq!(map.len(), 1);
        assert_eq!(map.valid_count(), 0);
    }
}
