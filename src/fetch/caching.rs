//! Memoizing fetches within a single walk.
//!
//! The same manifest, CRL, or object can be asked for many times during
//! one walk – most prominently the CRL, which every object of a
//! publication point is checked against. The [`CachingFetcher`] remembers
//! the outcome of every fetch, including the negative ones: a URI that
//! failed once stays failed for the rest of the walk. The cache lives
//! exactly as long as the chain it sits on top of; every trust-anchor run
//! builds a fresh chain and thus starts with an empty cache.

use std::collections::HashMap;
use std::sync::Mutex;
use rpki::uri;
use crate::error::Failed;
use crate::objects::{
    FileContentSpec, RepositoryObject, ValidatedCrl, ValidatedManifest
};
use crate::validation::{ValidationContext, ValidationResult};
use super::ObjectFetcher;


//------------ CachingFetcher ------------------------------------------------

/// A fetcher that remembers every answer for the duration of a walk.
pub struct CachingFetcher<F> {
    /// The fetcher doing the actual work.
    inner: F,

    /// The memoized object fetches.
    ///
    /// The key combines the URI with the SHA-256 digest of the content
    /// specification, so the same URI fetched under different
    /// expectations is treated as different fetches.
    objects: Mutex<HashMap<ObjectKey, Option<RepositoryObject>>>,

    /// The memoized manifest fetches.
    manifests: Mutex<HashMap<uri::Rsync, Option<ValidatedManifest>>>,

    /// The memoized CRL fetches.
    crls: Mutex<HashMap<uri::Rsync, Option<ValidatedCrl>>>,
}

/// The key of the object cache.
type ObjectKey = (uri::Rsync, Option<Vec<u8>>);

impl<F> CachingFetcher<F> {
    /// Creates a new caching fetcher with an empty cache.
    pub fn new(inner: F) -> Self {
        CachingFetcher {
            inner,
            objects: Mutex::new(HashMap::new()),
            manifests: Mutex::new(HashMap::new()),
            crls: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a reference to the wrapped fetcher.
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: ObjectFetcher> ObjectFetcher for CachingFetcher<F> {
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
        let key = (uri.clone(), spec.sha256().map(|hash| hash.to_vec()));
        if let Some(cached)
            = self.objects.lock().expect("poisoned lock").get(&key)
        {
            return Ok(cached.clone())
        }
        let res = self.inner.object(uri, spec, ctx, result)?;
        self.objects.lock().expect("poisoned lock").insert(
            key, res.clone()
        );
        Ok(res)
    }

    fn manifest(
        &self,
        uri: &uri::Rsync,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedManifest>, Failed> {
        if let Some(cached)
            = self.manifests.lock().expect("poisoned lock").get(uri)
        {
            return Ok(cached.clone())
        }
        let res = self.inner.manifest(uri, ctx, result)?;
        self.manifests.lock().expect("poisoned lock").insert(
            uri.clone(), res.clone()
        );
        Ok(res)
    }

    fn crl(
        &self,
        uri: &uri::Rsync,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedCrl>, Failed> {
        if let Some(cached)
            = self.crls.lock().expect("poisoned lock").get(uri)
        {
            return Ok(cached.clone())
        }
        let res = self.inner.crl(uri, ctx, result)?;
        self.crls.lock().expect("poisoned lock").insert(
            uri.clone(), res.clone()
        );
        Ok(res)
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use bytes::Bytes;
    use ring::digest;
    use rpki::repository::crypto::digest::DigestAlgorithm;
    use rpki::repository::manifest::ManifestHash;
    use crate::tal;

    #[derive(Default)]
    struct CountingFetcher {
        objects: AtomicUsize,
        manifests: AtomicUsize,
        crls: AtomicUsize,
    }

    impl ObjectFetcher for CountingFetcher {
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
            self.manifests.fetch_add(1, Ordering::Relaxed);
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

    fn spec_for(content: &[u8]) -> FileContentSpec {
        let hash = digest::digest(&digest::SHA256, content);
        FileContentSpec::from_hash(ManifestHash::new(
            Bytes::copy_from_slice(hash.as_ref()),
            DigestAlgorithm::sha256(),
        ))
    }

    #[test]
    fn repeated_object_fetches_hit_once() {
        let fetcher = CachingFetcher::new(CountingFetcher::default());
        let target = uri("rsync://example.net/mod/a.bin");
        let ctx = ValidationContext::root(tal::test_locator());
        let spec = spec_for(b"content");

        let mut result = ValidationResult::with_location(&target);
        for _ in 0..3 {
            assert!(fetcher.object(
                &target, &spec, &ctx, &mut result
            ).unwrap().is_some());
        }
        assert_eq!(fetcher.inner().objects.load(Ordering::Relaxed), 1);

        // A different content specification is a different fetch.
        fetcher.object(
            &target, &spec_for(b"other"), &ctx, &mut result
        ).unwrap();
        assert_eq!(fetcher.inner().objects.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn negative_answers_are_cached_too() {
        let fetcher = CachingFetcher::new(CountingFetcher::default());
        let mft = uri("rsync://example.net/mod/x.mft");
        let crl = uri("rsync://example.net/mod/x.crl");
        let ctx = ValidationContext::root(tal::test_locator());

        let mut result = ValidationResult::with_location(&mft);
        for _ in 0..3 {
            assert!(fetcher.manifest(&mft, &ctx, &mut result)
                .unwrap().is_none());
            assert!(fetcher.crl(&crl, &ctx, &mut result)
                .unwrap().is_none());
        }
        assert_eq!(fetcher.inner().manifests.load(Ordering::Relaxed), 1);
        assert_eq!(fetcher.inner().crls.load(Ordering::Relaxed), 1);
    }
}
