//! The trust anchors and their lifecycle.
//!
//! Every configured TAL is represented by a [`TrustAnchor`] record that
//! moves between two states: idle, waiting for its next scheduled
//! validation, and running, while a validation is in flight. The records
//! live in a [`MemoryImage`] together with the published object maps and
//! the locally configured filters and whitelist. The image is immutable;
//! all updates go through [`SharedImage`] which swaps in a complete new
//! image under a lock. Taking the write lock for the idle-and-enabled
//! check and the transition to running in one go is what guarantees that
//! no trust anchor is ever validated twice concurrently.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use chrono::{Duration, Utc};
use rpki::repository::x509::Time;
use crate::objects::{
    CaCertObject, ValidatedCrl, ValidatedManifest, ValidatedObjects
};
use crate::origins::{Filters, Whitelist};
use crate::tal::TrustAnchorLocator;


//------------ TrustAnchorStatus ---------------------------------------------

/// Where a trust anchor is in its lifecycle.
#[derive(Clone, Debug)]
pub enum TrustAnchorStatus {
    /// Waiting for the next validation run.
    Idle {
        /// When the next validation run is due.
        next_update: Time,

        /// The message of the last failed run, if it failed.
        error: Option<String>,
    },

    /// A validation run is in flight.
    Running {
        /// What the run is doing, for display purposes.
        description: String,
    },
}

impl TrustAnchorStatus {
    /// Returns whether the anchor is idle.
    pub fn is_idle(&self) -> bool {
        matches!(*self, TrustAnchorStatus::Idle { .. })
    }

    /// Returns when the next update is due if the anchor is idle.
    pub fn next_update(&self) -> Option<Time> {
        match *self {
            TrustAnchorStatus::Idle { next_update, .. } => Some(next_update),
            TrustAnchorStatus::Running { .. } => None,
        }
    }

    /// Returns the error of the last run if there was one.
    pub fn error(&self) -> Option<&str> {
        match *self {
            TrustAnchorStatus::Idle { ref error, .. } => error.as_deref(),
            TrustAnchorStatus::Running { .. } => None,
        }
    }
}


//------------ TrustAnchor ---------------------------------------------------

/// The runtime state of a single configured trust anchor.
#[derive(Clone, Debug)]
pub struct TrustAnchor {
    /// The locator the anchor was created from.
    locator: Arc<TrustAnchorLocator>,

    /// Disabled anchors are skipped by the scheduler.
    enabled: bool,

    /// Where the anchor is in its lifecycle.
    status: TrustAnchorStatus,

    /// The most recently validated trust anchor certificate.
    certificate: Option<CaCertObject>,

    /// The top manifest of the most recent successful validation.
    ///
    /// This may be empty even with a certificate present if the manifest
    /// failed to validate.
    manifest: Option<ValidatedManifest>,

    /// The CRL belonging to the top manifest.
    crl: Option<ValidatedCrl>,

    /// When the anchor last finished a validation run.
    last_updated: Option<Time>,
}

impl TrustAnchor {
    /// Creates a new, enabled, immediately due trust anchor.
    fn new(locator: Arc<TrustAnchorLocator>) -> Self {
        TrustAnchor {
            locator,
            enabled: true,
            status: TrustAnchorStatus::Idle {
                next_update: Time::now(),
                error: None,
            },
            certificate: None,
            manifest: None,
            crl: None,
            last_updated: None,
        }
    }

    pub fn locator(&self) -> &Arc<TrustAnchorLocator> {
        &self.locator
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn status(&self) -> &TrustAnchorStatus {
        &self.status
    }

    pub fn certificate(&self) -> Option<&CaCertObject> {
        self.certificate.as_ref()
    }

    pub fn manifest(&self) -> Option<&ValidatedManifest> {
        self.manifest.as_ref()
    }

    pub fn crl(&self) -> Option<&ValidatedCrl> {
        self.crl.as_ref()
    }

    pub fn last_updated(&self) -> Option<Time> {
        self.last_updated
    }

    /// Returns whether a validation run is due at the given time.
    pub fn is_due(&self, now: Time) -> bool {
        self.enabled && match self.status.next_update() {
            Some(next_update) => next_update <= now,
            None => false
        }
    }
}


//------------ TrustAnchors --------------------------------------------------

/// The ordered collection of all configured trust anchors.
///
/// The collection has value semantics: any per-anchor update produces a
/// new collection.
#[derive(Clone, Debug, Default)]
pub struct TrustAnchors {
    anchors: Vec<TrustAnchor>,
}

impl TrustAnchors {
    /// Creates the collection for the given locators.
    pub fn new(locators: Vec<Arc<TrustAnchorLocator>>) -> Self {
        TrustAnchors {
            anchors: locators.into_iter().map(TrustAnchor::new).collect()
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrustAnchor> {
        self.anchors.iter()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Returns the anchor created from the given locator.
    pub fn get(&self, locator: &TrustAnchorLocator) -> Option<&TrustAnchor> {
        self.anchors.iter().find(|anchor| {
            *anchor.locator.as_ref() == *locator
        })
    }

    /// Returns a new collection with one anchor replaced by `op`’s result.
    fn with_updated(
        &self,
        locator: &TrustAnchorLocator,
        op: impl FnOnce(&TrustAnchor) -> TrustAnchor,
    ) -> Self {
        let mut op = Some(op);
        TrustAnchors {
            anchors: self.anchors.iter().map(|anchor| {
                if *anchor.locator.as_ref() == *locator {
                    (op.take().expect("locator matched more than once"))(anchor)
                }
                else {
                    anchor.clone()
                }
            }).collect()
        }
    }
}


//------------ MemoryImage ---------------------------------------------------

/// The complete shared state of the validator at one point in time.
///
/// Images are immutable. All reads see a consistent snapshot; updates
/// build a new image and swap it in.
#[derive(Clone, Debug, Default)]
pub struct MemoryImage {
    /// The trust anchors.
    trust_anchors: TrustAnchors,

    /// The locally configured ignore filters.
    filters: Filters,

    /// The locally asserted route origins.
    whitelist: Whitelist,

    /// The published object maps, keyed by TAL file name.
    validated_objects: HashMap<String, Arc<ValidatedObjects>>,
}

impl MemoryImage {
    pub fn trust_anchors(&self) -> &TrustAnchors {
        &self.trust_anchors
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Returns the published object map for a trust anchor.
    pub fn validated_objects(
        &self, locator: &TrustAnchorLocator
    ) -> Option<&Arc<ValidatedObjects>> {
        self.validated_objects.get(locator.file_name())
    }
}


//------------ RunOutcome ----------------------------------------------------

/// How a validation run for a trust anchor ended.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    /// The run completed and produced this verdict map.
    ///
    /// A completed run may still have found nothing valid at all.
    Success(ValidatedObjects),

    /// The run died. The object map is discarded.
    Failure(String),
}


//------------ SharedImage ---------------------------------------------------

/// Shared access to the memory image.
///
/// Reads return a snapshot. The state transitions of the trust anchors
/// happen under the write lock as a whole, which makes the
/// check-idle-then-run sequence of [`start_processing`] atomic.
///
/// [`start_processing`]: Self::start_processing
#[derive(Clone)]
pub struct SharedImage {
    /// The current image.
    image: Arc<RwLock<Arc<MemoryImage>>>,

    /// How long after a successful run the next one is scheduled.
    refresh: Duration,

    /// How long after a failed run the next one is scheduled.
    retry: Duration,
}

impl SharedImage {
    /// Creates the shared state for the given locators.
    pub fn new(
        locators: Vec<Arc<TrustAnchorLocator>>,
        refresh: Duration,
        retry: Duration,
    ) -> Self {
        SharedImage {
            image: Arc::new(RwLock::new(Arc::new(MemoryImage {
                trust_anchors: TrustAnchors::new(locators),
                ..Default::default()
            }))),
            refresh,
            retry,
        }
    }

    /// Returns the current snapshot.
    pub fn read(&self) -> Arc<MemoryImage> {
        self.image.read().expect("poisoned lock").clone()
    }

    /// Replaces the image with the result of `op` under the write lock.
    fn update(
        &self, op: impl FnOnce(&MemoryImage) -> Option<MemoryImage>
    ) -> bool {
        let mut image = self.image.write().expect("poisoned lock");
        match op(image.as_ref()) {
            Some(new_image) => {
                *image = Arc::new(new_image);
                true
            }
            None => false
        }
    }

    /// Tries to move a trust anchor from idle to running.
    ///
    /// Returns whether the run may go ahead. It may not if the anchor is
    /// unknown, disabled, or already running; the caller must then leave
    /// the anchor alone.
    pub fn start_processing(
        &self, locator: &TrustAnchorLocator, description: &str
    ) -> bool {
        self.update(|image| {
            let anchor = image.trust_anchors.get(locator)?;
            if !anchor.enabled || !anchor.status.is_idle() {
                return None
            }
            let mut image = image.clone();
            image.trust_anchors = image.trust_anchors.with_updated(
                locator,
                |anchor| {
                    let mut anchor = anchor.clone();
                    anchor.status = TrustAnchorStatus::Running {
                        description: description.into()
                    };
                    anchor
                }
            );
            Some(image)
        })
    }

    /// Records the end of a validation run.
    ///
    /// On success, the trust anchor certificate, manifest, and CRL are
    /// extracted from the verdict map and the map is published. A miss in
    /// any extraction step leaves that field empty but does not turn the
    /// run into a failure. On failure, the map is discarded and the next
    /// run is scheduled sooner, with the message kept for display.
    pub fn finish_processing(
        &self, locator: &TrustAnchorLocator, outcome: RunOutcome
    ) {
        let now = Time::now();
        self.update(|image| {
            let mut image = image.clone();
            match outcome {
                RunOutcome::Success(ref objects) => {
                    let (certificate, manifest, crl)
                        = extract_anchor_artifacts(locator, objects);
                    image.trust_anchors = image.trust_anchors.with_updated(
                        locator,
                        |anchor| {
                            let mut anchor = anchor.clone();
                            anchor.status = TrustAnchorStatus::Idle {
                                next_update:
                                    (Utc::now() + self.refresh).into(),
                                error: None,
                            };
                            anchor.certificate = certificate.clone();
                            anchor.manifest = manifest.clone();
                            anchor.crl = crl.clone();
                            anchor.last_updated = Some(now);
                            anchor
                        }
                    );
                    image.validated_objects.insert(
                        locator.file_name().into(),
                        Arc::new(objects.clone()),
                    );
                }
                RunOutcome::Failure(ref message) => {
                    image.trust_anchors = image.trust_anchors.with_updated(
                        locator,
                        |anchor| {
                            let mut anchor = anchor.clone();
                            anchor.status = TrustAnchorStatus::Idle {
                                next_update:
                                    (Utc::now() + self.retry).into(),
                                error: Some(message.clone()),
                            };
                            anchor.last_updated = Some(now);
                            anchor
                        }
                    );
                }
            }
            Some(image)
        });
    }

    /// Enables or disables a trust anchor.
    ///
    /// Disabling an anchor with a run in flight does not interrupt the
    /// run; the anchor is simply skipped from the next tick on.
    pub fn set_enabled(
        &self, locator: &TrustAnchorLocator, enabled: bool
    ) -> bool {
        self.update(|image| {
            image.trust_anchors.get(locator)?;
            let mut image = image.clone();
            image.trust_anchors = image.trust_anchors.with_updated(
                locator,
                |anchor| {
                    let mut anchor = anchor.clone();
                    anchor.enabled = enabled;
                    anchor
                }
            );
            Some(image)
        })
    }

    /// Replaces the ignore filters.
    pub fn set_filters(&self, filters: Filters) {
        self.update(|image| {
            let mut image = image.clone();
            image.filters = filters;
            Some(image)
        });
    }

    /// Replaces the whitelist.
    pub fn set_whitelist(&self, whitelist: Whitelist) {
        self.update(|image| {
            let mut image = image.clone();
            image.whitelist = whitelist;
            Some(image)
        });
    }
}


//------------ Helper Functions ----------------------------------------------

/// Extracts the anchor’s certificate, manifest, and CRL from a verdict map.
///
/// Each step only succeeds if the map has a positive verdict carrying the
/// right kind of object at the expected URI; otherwise the chain simply
/// stops and the remaining artifacts stay empty.
fn extract_anchor_artifacts(
    locator: &TrustAnchorLocator,
    objects: &ValidatedObjects,
) -> (
    Option<CaCertObject>,
    Option<ValidatedManifest>,
    Option<ValidatedCrl>,
) {
    let certificate = locator.certificate_locations().iter().find_map(|uri| {
        objects.get(uri)
            .filter(|object| object.is_valid())
            .and_then(|object| object.object())
            .and_then(|object| object.as_ca_cert())
            .cloned()
    });
    let manifest = certificate.as_ref()
        .and_then(|cert| cert.manifest_uri())
        .and_then(|uri| objects.get(uri))
        .filter(|object| object.is_valid())
        .and_then(|object| object.object())
        .and_then(|object| object.as_manifest())
        .cloned();
    let crl = manifest.as_ref()
        .map(|manifest| manifest.crl_uri())
        .and_then(|uri| objects.get(uri))
        .filter(|object| object.is_valid())
        .and_then(|object| object.object())
        .and_then(|object| object.as_crl())
        .cloned();
    (certificate, manifest, crl)
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::tal;

    fn shared() -> SharedImage {
        SharedImage::new(
            vec![tal::test_locator()],
            Duration::hours(4),
            Duration::hours(1),
        )
    }

    #[test]
    fn fresh_anchor_is_due() {
        let shared = shared();
        let image = shared.read();
        let anchor = image.trust_anchors().iter().next().unwrap();
        assert!(anchor.enabled());
        assert!(anchor.status().is_idle());
        assert!(anchor.is_due(Time::now()));
        assert!(anchor.last_updated().is_none());
    }

    #[test]
    fn start_requires_idle_and_enabled() {
        let shared = shared();
        let locator = tal::test_locator();

        assert!(shared.start_processing(&locator, "validating"));
        // A second start while running must be refused.
        assert!(!shared.start_processing(&locator, "again"));

        shared.finish_processing(
            &locator, RunOutcome::Failure("it broke".into())
        );
        assert!(shared.start_processing(&locator, "retry"));

        shared.finish_processing(
            &locator, RunOutcome::Failure("it broke again".into())
        );
        assert!(shared.set_enabled(&locator, false));
        assert!(!shared.start_processing(&locator, "disabled"));
    }

    #[test]
    fn exactly_one_concurrent_start_wins() {
        let shared = shared();
        let locator = tal::test_locator();
        let started = AtomicUsize::new(0);

        crossbeam_utils::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|_| {
                    if shared.start_processing(&locator, "race") {
                        started.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        }).unwrap();

        assert_eq!(started.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn success_schedules_later_than_failure() {
        let shared = shared();
        let locator = tal::test_locator();

        assert!(shared.start_processing(&locator, "run"));
        shared.finish_processing(
            &locator, RunOutcome::Success(Default::default())
        );
        let after_success = {
            let image = shared.read();
            let anchor = image.trust_anchors().get(&locator)
                .unwrap().clone();
            assert!(anchor.status().error().is_none());
            assert!(anchor.last_updated().is_some());
            assert!(
                anchor.status().next_update().unwrap()
                    > anchor.last_updated().unwrap()
            );
            anchor.status().next_update().unwrap()
        };

        assert!(shared.start_processing(&locator, "run"));
        shared.finish_processing(
            &locator, RunOutcome::Failure("rsync failed".into())
        );
        let image = shared.read();
        let anchor = image.trust_anchors().get(&locator).unwrap();
        assert_eq!(anchor.status().error(), Some("rsync failed"));
        assert!(anchor.status().next_update().unwrap() < after_success);
    }

    #[test]
    fn failure_keeps_previous_objects() {
        let shared = shared();
        let locator = tal::test_locator();

        assert!(shared.start_processing(&locator, "run"));
        shared.finish_processing(
            &locator, RunOutcome::Success(Default::default())
        );
        assert!(shared.read().validated_objects(&locator).is_some());

        assert!(shared.start_processing(&locator, "run"));
        shared.finish_processing(
            &locator, RunOutcome::Failure("boom".into())
        );
        // The previously published map is still there.
        assert!(shared.read().validated_objects(&locator).is_some());
    }

    #[test]
    fn last_updated_is_monotonic() {
        let shared = shared();
        let locator = tal::test_locator();

        assert!(shared.start_processing(&locator, "one"));
        shared.finish_processing(
            &locator, RunOutcome::Success(Default::default())
        );
        let first = shared.read().trust_anchors().get(&locator)
            .unwrap().last_updated().unwrap();

        assert!(shared.start_processing(&locator, "two"));
        shared.finish_processing(
            &locator, RunOutcome::Success(Default::default())
        );
        let second = shared.read().trust_anchors().get(&locator)
            .unwrap().last_updated().unwrap();

        assert!(second >= first);
    }
}
