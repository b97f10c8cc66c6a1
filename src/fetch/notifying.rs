//! Telling interested parties about fetch outcomes.
//!
//! The [`NotifyingFetcher`] dispatches an event to a list of listeners
//! after every fetch and prefetch. The listeners – result loggers, object
//! collectors, summary counters – are registered when the chain is built
//! and are invoked in registration order. A listener that panics is
//! caught and logged; the remaining listeners still fire.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use log::error;
use rpki::uri;
use crate::error::Failed;
use crate::objects::{
    FileContentSpec, RepositoryObject, ValidatedCrl, ValidatedManifest
};
use crate::validation::{ValidationContext, ValidationResult};
use super::ObjectFetcher;


//------------ FetchListener -------------------------------------------------

/// A party interested in fetch outcomes.
///
/// All methods default to doing nothing so listeners only implement what
/// they care about. Listeners must not try to mutate the object or the
/// result – they only get to look.
#[allow(unused_variables)]
pub trait FetchListener: Send + Sync {
    /// A prefetch completed without failures.
    fn after_prefetch_success(
        &self, uri: &uri::Rsync, result: &ValidationResult
    ) {
    }

    /// A prefetch recorded at least one failure.
    fn after_prefetch_failure(
        &self, uri: &uri::Rsync, result: &ValidationResult
    ) {
    }

    /// A fetch produced a validated object.
    fn after_fetch_success(
        &self,
        uri: &uri::Rsync,
        object: &RepositoryObject,
        result: &ValidationResult,
    ) {
    }

    /// A fetch came up empty.
    fn after_fetch_failure(
        &self, uri: &uri::Rsync, result: &ValidationResult
    ) {
    }
}


//------------ NotifyingFetcher ----------------------------------------------

/// A fetcher that notifies listeners about every outcome.
pub struct NotifyingFetcher<F> {
    /// The fetcher doing the actual work.
    inner: F,

    /// The listeners in the order they are to be called.
    listeners: Vec<Arc<dyn FetchListener>>,
}

impl<F> NotifyingFetcher<F> {
    /// Creates a new fetcher with the given listeners.
    pub fn new(inner: F, listeners: Vec<Arc<dyn FetchListener>>) -> Self {
        NotifyingFetcher { inner, listeners }
    }

    /// Returns a reference to the wrapped fetcher.
    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Invokes `op` on every listener, isolating panics.
    fn each_listener(&self, op: impl Fn(&dyn FetchListener)) {
        for listener in &self.listeners {
            let listener = listener.as_ref();
            if panic::catch_unwind(
                AssertUnwindSafe(|| op(listener))
            ).is_err() {
                error!(
                    "A fetch listener panicked. \
                     Continuing with the remaining listeners."
                );
            }
        }
    }

    /// Dispatches the fetch outcome for `uri`.
    fn notify_fetch(
        &self,
        uri: &uri::Rsync,
        object: Option<&RepositoryObject>,
        result: &ValidationResult,
    ) {
        match object {
            Some(object) => {
                self.each_listener(|listener| {
                    listener.after_fetch_success(uri, object, result)
                })
            }
            None => {
                self.each_listener(|listener| {
                    listener.after_fetch_failure(uri, result)
                })
            }
        }
    }
}

impl<F: ObjectFetcher> ObjectFetcher for NotifyingFetcher<F> {
    fn prefetch(&self, uri: &uri::Rsync, result: &mut ValidationResult) {
        self.inner.prefetch(uri, result);
        if result.has_failure_for_current_location() {
            self.each_listener(|listener| {
                listener.after_prefetch_failure(uri, result)
            })
        }
        else {
            self.each_listener(|listener| {
                listener.after_prefetch_success(uri, result)
            })
        }
    }

    fn object(
        &self,
        uri: &uri::Rsync,
        spec: &FileContentSpec,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<RepositoryObject>, Failed> {
        let res = self.inner.object(uri, spec, ctx, result)?;
        self.notify_fetch(uri, res.as_ref(), result);
        Ok(res)
    }

    fn manifest(
        &self,
        uri: &uri::Rsync,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedManifest>, Failed> {
        let res = self.inner.manifest(uri, ctx, result)?;
        let as_object = res.clone().map(RepositoryObject::Manifest);
        self.notify_fetch(uri, as_object.as_ref(), result);
        Ok(res)
    }

    fn crl(
        &self,
        uri: &uri::Rsync,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> Result<Option<ValidatedCrl>, Failed> {
        let res = self.inner.crl(uri, ctx, result)?;
        let as_object = res.clone().map(RepositoryObject::Crl);
        self.notify_fetch(uri, as_object.as_ref(), result);
        Ok(res)
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;
    use std::sync::Mutex;
    use bytes::Bytes;
    use crate::tal;

    struct StubFetcher {
        object: Option<RepositoryObject>,
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
            Ok(self.object.clone())
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
            Ok(None)
        }
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FetchListener for Recorder {
        fn after_fetch_success(
            &self,
            uri: &uri::Rsync,
            _object: &RepositoryObject,
            _result: &ValidationResult,
        ) {
            self.log.lock().unwrap().push(
                format!("{} success {}", self.name, uri)
            );
        }

        fn after_fetch_failure(
            &self, uri: &uri::Rsync, _result: &ValidationResult
        ) {
            self.log.lock().unwrap().push(
                format!("{} failure {}", self.name, uri)
            );
        }
    }

    struct Panicker;

    impl FetchListener for Panicker {
        fn after_fetch_success(
            &self,
            _uri: &uri::Rsync,
            _object: &RepositoryObject,
            _result: &ValidationResult,
        ) {
            panic!("misbehaving listener")
        }
    }

    fn uri(s: &str) -> uri::Rsync {
        uri::Rsync::from_str(s).unwrap()
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fetcher = NotifyingFetcher::new(
            StubFetcher {
                object: Some(RepositoryObject::Unknown(Bytes::new())),
            },
            vec![
                Arc::new(Recorder { name: "first", log: log.clone() }),
                Arc::new(Recorder { name: "second", log: log.clone() }),
            ],
        );

        let target = uri("rsync://example.net/mod/a.bin");
        let ctx = ValidationContext::root(tal::test_locator());
        let mut result = ValidationResult::with_location(&target);
        fetcher.object(
            &target, &FileContentSpec::unrestricted(), &ctx, &mut result
        ).unwrap();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            [
                "first success rsync://example.net/mod/a.bin",
                "second success rsync://example.net/mod/a.bin",
            ]
        );
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fetcher = NotifyingFetcher::new(
            StubFetcher {
                object: Some(RepositoryObject::Unknown(Bytes::new())),
            },
            vec![
                Arc::new(Panicker),
                Arc::new(Recorder { name: "after", log: log.clone() }),
            ],
        );

        let target = uri("rsync://example.net/mod/a.bin");
        let ctx = ValidationContext::root(tal::test_locator());
        let mut result = ValidationResult::with_location(&target);
        fetcher.object(
            &target, &FileContentSpec::unrestricted(), &ctx, &mut result
        ).unwrap();

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn absent_object_is_a_failure_event() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fetcher = NotifyingFetcher::new(
            StubFetcher { object: None },
            vec![Arc::new(Recorder { name: "only", log: log.clone() })],
        );

        let target = uri("rsync://example.net/mod/a.bin");
        let ctx = ValidationContext::root(tal::test_locator());
        let mut result = ValidationResult::with_location(&target);
        fetcher.object(
            &target, &FileContentSpec::unrestricted(), &ctx, &mut result
        ).unwrap();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["only failure rsync://example.net/mod/a.bin"]
        );
    }
}
