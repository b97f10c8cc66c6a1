//! Fetching repository objects.
//!
//! Turning a URI into a cryptographically verified repository object takes
//! several steps: running rsync, keeping the object store consistent,
//! validating signatures, telling everyone about the outcome, and not
//! doing any of this twice. Each step lives in its own layer wrapping the
//! previous one:
//!
//! ```text
//! CachingFetcher → NotifyingFetcher → ValidatingFetcher
//!     → ConsistentFetcher → RemoteFetcher
//! ```
//!
//! The outer three layers implement [`ObjectFetcher`]; the inner two deal
//! in raw bytes and stored objects and have their own interfaces. Since
//! certificate validation needs to look up CRLs – and those lookups should
//! enjoy caching and notification like any other fetch – the validating
//! layer holds a weak reference back to the outermost layer which is
//! injected after the chain has been built. Use [`build_chain`] to get the
//! wiring right.

pub use self::caching::CachingFetcher;
pub use self::consistent::ConsistentFetcher;
pub use self::notifying::{FetchListener, NotifyingFetcher};
pub use self::rsync::{
    RemoteFetcher, RsyncCommand, RsyncRunner, UriToPathMapper
};
pub use self::validating::ValidatingFetcher;

pub mod caching;
pub mod consistent;
pub mod notifying;
pub mod rsync;
pub mod validating;

use std::sync::{Arc, Weak};
use rpki::uri;
use crate::error::Failed;
use crate::objects::{
    FileContentSpec, ObjectPolicy, RepositoryObject, ValidatedCrl,
    ValidatedManifest
};
use crate::store::Store;
use crate::validation::{ValidationContext, ValidationResult};


//------------ ObjectFetcher -------------------------------------------------

/// A source of verified repository objects.
///
/// All methods expect the caller to have pushed the URI being fetched onto
/// the result’s location stack; checks are recorded at the current
/// location.
pub trait ObjectFetcher: Send + Sync {
    /// Makes the module containing `uri` available for later fetches.
    ///
    /// Failures are recorded on `result` but are not fatal – individual
    /// fetches will simply be slower or fail later.
    fn prefetch(&self, uri: &uri::Rsync, result: &mut ValidationResult);

    /// Fetches and validates the object at `uri`.
    ///
    /// Returns `None` if the object cannot be retrieved or does not
    /// validate, with the reasons recorded on `result`.
    fn object(
        &self,
        uri: &uri::Rsync,
        spec: &FileContentSpec,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<RepositoryObject>, Failed>;

    /// Fetches and validates the manifest at `uri`.
    fn manifest(
        &self,
        uri: &uri::Rsync,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedManifest>, Failed>;

    /// Fetches and validates the CRL at `uri`.
    fn crl(
        &self,
        uri: &uri::Rsync,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedCrl>, Failed>;
}


//------------ Chain ---------------------------------------------------------

/// The fully assembled fetcher chain for one trust-anchor run.
pub type Chain = Arc<CachingFetcher<NotifyingFetcher<ValidatingFetcher>>>;

/// Builds the fetcher chain bottom-up and wires the back-reference.
pub fn build_chain(
    remote: RemoteFetcher,
    store: Store,
    policy: ObjectPolicy,
    listeners: Vec<Arc<dyn FetchListener>>,
) -> Chain {
    let consistent = ConsistentFetcher::new(remote, store, policy.strict);
    let validating = ValidatingFetcher::new(consistent, policy);
    let notifying = NotifyingFetcher::new(validating, listeners);
    let chain = Arc::new(CachingFetcher::new(notifying));
    let dyn_chain: Arc<dyn ObjectFetcher> = chain.clone();
    let outer: Weak<dyn ObjectFetcher> = Arc::downgrade(&dyn_chain);
    chain.inner().inner().set_outermost(outer);
    chain
}
