//! Cryptographic validation of fetched objects.
//!
//! The [`ValidatingFetcher`] runs every object coming out of the
//! consistent fetcher through validation in the context of its issuing
//! CA. Objects that do not validate are dropped; the fetch then returns
//! nothing and the reasons sit on the result.
//!
//! Validation needs CRLs, and CRL lookups should themselves go through
//! caching and notification. The fetcher therefore keeps a weak reference
//! to the outermost layer of the chain which is injected via
//! [`set_outermost`][ValidatingFetcher::set_outermost] once the chain has
//! been assembled.
//!
//! CRLs get special treatment because manifest and CRL refer to each
//! other: the CRL is first validated ignoring the manifest-declared hash,
//! then the manifest is validated using that very CRL, and finally the
//! CRL’s hash and file-name membership are re-checked against the
//! manifest.

use std::sync::{Arc, RwLock, Weak};
use rpki::uri;
use crate::error::Failed;
use crate::objects::{
    self, CrlLocator, FileContentSpec, ObjectPolicy, RepositoryObject,
    ValidatedCrl, ValidatedManifest
};
use crate::validation::{self, ValidationContext, ValidationResult};
use super::ObjectFetcher;
use super::consistent::ConsistentFetcher;


//------------ ValidatingFetcher ---------------------------------------------

/// A fetcher that only returns objects that validate.
pub struct ValidatingFetcher {
    /// The fetcher producing raw stored objects.
    inner: ConsistentFetcher,

    /// The knobs for object validation.
    policy: ObjectPolicy,

    /// The outermost layer of the chain, used for CRL lookups.
    ///
    /// This is empty until the chain has been assembled and the reference
    /// injected. Without it, CRL lookups bypass the outer layers.
    outermost: RwLock<Option<Weak<dyn ObjectFetcher>>>,
}

impl ValidatingFetcher {
    /// Creates a new fetcher atop the given consistent fetcher.
    pub fn new(inner: ConsistentFetcher, policy: ObjectPolicy) -> Self {
        ValidatingFetcher {
            inner,
            policy,
            outermost: RwLock::new(None),
        }
    }

    /// Returns a reference to the wrapped consistent fetcher.
    pub fn inner(&self) -> &ConsistentFetcher {
        &self.inner
    }

    /// Injects the outermost layer of the chain.
    pub fn set_outermost(&self, outer: Weak<dyn ObjectFetcher>) {
        *self.outermost.write().expect("poisoned lock") = Some(outer);
    }

    /// Returns the outermost layer if it is still around.
    fn outermost(&self) -> Option<Arc<dyn ObjectFetcher>> {
        self.outermost.read().expect("poisoned lock")
            .as_ref().and_then(Weak::upgrade)
    }
}

impl ObjectFetcher for ValidatingFetcher {
    fn prefetch(&self, uri: &uri::Rsync, result: &mut ValidationResult) {
        self.inner.prefetch(uri, result)
    }

    fn object(
        &self,
        uri: &uri::Rsync,
        spec: &FileContentSpec,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<RepositoryObject>, Failed> {
        let stored = match self.inner.fetch(uri, spec, result)? {
            Some(stored) => stored,
            None => return Ok(None)
        };
        let object = RepositoryObject::validate_bytes(
            uri, stored.into_content(), ctx,
            &OuterCrlLocator(self), self.policy, result
        )?;
        if result.has_failure_for_current_location() {
            return Ok(None)
        }
        Ok(object)
    }

    fn manifest(
        &self,
        uri: &uri::Rsync,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedManifest>, Failed> {
        let stored = match self.inner.fetch(
            uri, &FileContentSpec::unrestricted(), result
        )? {
            Some(stored) => stored,
            None => return Ok(None)
        };
        let manifest = match objects::validate_manifest_with_crl(
            uri, stored.into_content(), ctx, None, self.policy, result
        ) {
            Some(manifest) => manifest,
            None => return Ok(None)
        };

        // The manifest's EE certificate must not be revoked by the
        // publication point's CRL.
        match OuterCrlLocator(self).crl(manifest.crl_uri(), ctx, result)? {
            Some(crl) => {
                if !result.reject_if_false(
                    !crl.crl().contains(manifest.ee_serial()),
                    validation::VALIDATOR_CERT_NOT_REVOKED
                ) {
                    return Ok(None)
                }
            }
            None => {
                result.reject(validation::VALIDATOR_CERT_NOT_REVOKED);
                return Ok(None)
            }
        }

        if result.has_failure_for_current_location() {
            return Ok(None)
        }
        Ok(Some(manifest))
    }

    fn crl(
        &self,
        uri: &uri::Rsync,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedCrl>, Failed> {
        // Step 1: fetch the CRL and validate it ignoring the hash
        // declared for it on the manifest.
        let stored = match self.inner.fetch(
            uri, &FileContentSpec::unrestricted(), result
        )? {
            Some(stored) => stored,
            None => return Ok(None)
        };
        let crl = match objects::validate_crl_ignoring_hash(
            uri, stored.into_content(), ctx, self.policy, result
        ) {
            Some(crl) => crl,
            None => return Ok(None)
        };

        // Step 2: fetch the manifest and validate it using this very CRL.
        let manifest_uri = match ctx.issuer() {
            Some(issuer) => issuer.manifest_uri().clone(),
            None => {
                result.reject(validation::VALIDATOR_OBJECT_VALID);
                return Ok(None)
            }
        };
        let manifest = self.manifest_for_crl(
            &manifest_uri, ctx, &crl, result
        )?;
        if !result.reject_if_false(
            manifest.is_some(),
            validation::VALIDATOR_CRL_MANIFEST_VALID
        ) {
            return Ok(None)
        }
        let manifest = match manifest {
            Some(manifest) => manifest,
            None => return Ok(None)
        };

        // Step 3: re-check the CRL's hash and file-name membership
        // against the manifest.
        let name = crl_file_name(uri);
        if !result.reject_if_false(
            manifest.contains_file(name),
            validation::VALIDATOR_MANIFEST_DOES_NOT_CONTAIN_FILE
        ) {
            return Ok(None)
        }
        if !result.reject_if_false(
            manifest.verify_file_contents(name, crl.bytes()),
            validation::VALIDATOR_FILE_CONTENT
        ) {
            return Ok(None)
        }

        Ok(Some(crl))
    }
}

impl ValidatingFetcher {
    /// Fetches and validates the manifest using a fixed CRL.
    ///
    /// This deliberately uses the inner fetcher: going through the outer
    /// chain would ask for the CRL again and we would chase our own tail.
    fn manifest_for_crl(
        &self,
        manifest_uri: &uri::Rsync,
        ctx: &ValidationContext,
        crl: &ValidatedCrl,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedManifest>, Failed> {
        let stored = match self.inner.fetch(
            manifest_uri, &FileContentSpec::unrestricted(), result
        )? {
            Some(stored) => stored,
            None => return Ok(None)
        };
        result.push(manifest_uri);
        let manifest = objects::validate_manifest_with_crl(
            manifest_uri, stored.into_content(), ctx, Some(crl),
            self.policy, result
        );
        let failed = result.has_failure_for_current_location();
        result.pop();
        if failed {
            return Ok(None)
        }
        Ok(manifest)
    }
}


//------------ OuterCrlLocator -----------------------------------------------

/// The CRL locator handed to object validation.
///
/// Looks up CRLs through the outermost layer of the chain so they are
/// cached and notified about like any other fetch. Falls back to the
/// validating fetcher itself while the chain is not fully assembled.
struct OuterCrlLocator<'a>(&'a ValidatingFetcher);

impl CrlLocator for OuterCrlLocator<'_> {
    fn crl(
        &self,
        uri: &uri::Rsync,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedCrl>, Failed> {
        result.push(uri);
        let res = match self.0.outermost() {
            Some(outer) => outer.crl(uri, ctx, result),
            None => ObjectFetcher::crl(self.0, uri, ctx, result),
        };
        result.pop();
        res
    }
}


//------------ Helper Functions ----------------------------------------------

/// Returns the file name part of a CRL’s URI.
fn crl_file_name(uri: &uri::Rsync) -> &str {
    let path = uri.path();
    path.rsplit('/').next().unwrap_or(path)
}
