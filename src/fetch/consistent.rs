//! Keeping fetched manifest sets internally consistent.
//!
//! A manifest commits to the hashes of every file at its publication
//! point. Fetching some but not all of those files would leave us with an
//! inconsistent view, and storing such a half-set would make later runs
//! conclude a file is missing when it was merely a transient failure. The
//! [`ConsistentFetcher`] therefore only ever commits a manifest together
//! with its complete file set to the store. If anything about the set
//! fails, nothing is written and the previously stored set remains the
//! authoritative version.
//!
//! Remote failures consequently never surface as errors here. They are
//! transcribed into warnings on the outer result since the store may
//! still be able to satisfy the request.

use std::str::FromStr;
use bytes::Bytes;
use log::warn;
use rpki::repository::manifest::{Manifest, ManifestHash};
use rpki::uri;
use crate::error::Failed;
use crate::objects::FileContentSpec;
use crate::store::{Store, StoredObject};
use crate::validation::{self, ValidationResult};
use super::rsync::RemoteFetcher;


//------------ ConsistentFetcher ---------------------------------------------

/// A fetcher that keeps the store consistent with fetched manifests.
pub struct ConsistentFetcher {
    /// The fetcher used to talk to the actual publication point.
    remote: RemoteFetcher,

    /// The durable object store.
    store: Store,

    /// Apply strict decoding rules when probing for manifests?
    strict: bool,
}

impl ConsistentFetcher {
    /// Creates a new fetcher from its parts.
    pub fn new(remote: RemoteFetcher, store: Store, strict: bool) -> Self {
        ConsistentFetcher { remote, store, strict }
    }

    /// Returns a reference to the remote fetcher.
    pub fn remote(&self) -> &RemoteFetcher {
        &self.remote
    }

    /// Makes the subtree at `uri` available for later fetches.
    ///
    /// Remote failures become warnings on `result`.
    pub fn prefetch(&self, uri: &uri::Rsync, result: &mut ValidationResult) {
        let mut fetch_results = ValidationResult::with_location(uri);
        self.remote.prefetch(uri, &mut fetch_results);
        Self::transcribe_failures(&fetch_results, result);
    }

    /// Fetches the object at `uri`, serving from the store if possible.
    ///
    /// If `spec` pins the object to a known hash, a store hit under that
    /// hash is returned without consulting the remote at all – the
    /// manifest has already cryptographically bound us to this exact
    /// content. In all other cases the remote is tried first and the
    /// freshest stored version for the URI is returned.
    pub fn fetch(
        &self,
        uri: &uri::Rsync,
        spec: &FileContentSpec,
        result: &mut ValidationResult,
    ) -> Result<Option<StoredObject>, Failed> {
        if let Some(hash) = spec.sha256() {
            if let Some(stored) = self.store.get_by_hash(hash)? {
                return Ok(Some(stored))
            }
        }
        self.fetch_and_store_object(uri, spec, result)?;
        let stored = self.store.get_latest_by_url(uri)?;
        if stored.is_none() {
            result.reject(
                validation::VALIDATOR_REPOSITORY_OBJECT_NOT_IN_CACHE
            );
        }
        Ok(stored)
    }

    /// Fetches the object at `uri` remotely and stores it.
    ///
    /// Remote failures become warnings on `result`; only store errors are
    /// fatal. If the fetched object turns out to be a manifest, its whole
    /// file set is fetched and stored as one consistent unit.
    fn fetch_and_store_object(
        &self,
        uri: &uri::Rsync,
        spec: &FileContentSpec,
        result: &mut ValidationResult,
    ) -> Result<(), Failed> {
        let mut fetch_results = ValidationResult::with_location(uri);
        let bytes = self.remote.fetch_file(uri, spec, &mut fetch_results);

        let res = match bytes {
            Some(bytes) => {
                if uri.ends_with(".mft") {
                    match Manifest::decode(bytes.clone(), self.strict) {
                        Ok(manifest) => {
                            self.fetch_and_store_consistent_set(
                                uri, &manifest, bytes, &mut fetch_results
                            )
                        }
                        Err(_) => {
                            // Not actually a manifest. Store the bytes as
                            // they are; validation will deal with them.
                            self.store.put(&[
                                StoredObject::new(uri.clone(), bytes)
                            ])
                        }
                    }
                }
                else {
                    self.store.put(&[StoredObject::new(uri.clone(), bytes)])
                }
            }
            None => Ok(())
        };
        Self::transcribe_failures(&fetch_results, result);
        res
    }

    /// Fetches and stores a manifest together with its file set.
    ///
    /// If any file of the set cannot be fetched or fails its hash check,
    /// nothing at all is written – the previously stored set stays the
    /// authoritative one.
    fn fetch_and_store_consistent_set(
        &self,
        manifest_uri: &uri::Rsync,
        manifest: &Manifest,
        bytes: Bytes,
        fetch_results: &mut ValidationResult,
    ) -> Result<(), Failed> {
        let stored_manifest = StoredObject::new(manifest_uri.clone(), bytes);
        if self.store.get_by_hash(stored_manifest.hash())?.is_some() {
            // We committed this manifest's file set in a prior run.
            return Ok(())
        }

        let mut batch = vec![stored_manifest];
        for item in manifest.content().iter() {
            let (file, hash) = item.into_pair();
            let file = match std::str::from_utf8(&file) {
                Ok(file) => file.to_string(),
                Err(_) => {
                    warn!(
                        "{}: illegal file name {} in manifest.",
                        manifest_uri, String::from_utf8_lossy(&file)
                    );
                    fetch_results.reject(validation::VALIDATOR_READ_FILE);
                    continue
                }
            };
            let child_uri = match resolve_sibling(manifest_uri, &file) {
                Some(uri) => uri,
                None => {
                    warn!(
                        "{}: illegal file name {} in manifest.",
                        manifest_uri, file
                    );
                    fetch_results.reject(validation::VALIDATOR_READ_FILE);
                    continue
                }
            };
            let spec = FileContentSpec::from_hash(ManifestHash::new(
                hash, manifest.content().file_hash_alg()
            ));
            fetch_results.push(&child_uri);
            if let Some(bytes) = self.remote.fetch_file(
                &child_uri, &spec, fetch_results
            ) {
                batch.push(StoredObject::new(child_uri.clone(), bytes));
            }
            fetch_results.pop();
        }

        if !fetch_results.has_failures() {
            self.store.put(&batch)?;
        }
        else {
            warn!(
                "{}: incomplete or inconsistent file set, \
                 keeping previously stored objects.",
                manifest_uri
            );
        }
        Ok(())
    }

    /// Transcribes remote failures into warnings on the outer result.
    ///
    /// Remote failures must never propagate as errors since the store may
    /// still satisfy the request; they are degradations, not verdicts.
    fn transcribe_failures(
        fetch_results: &ValidationResult,
        result: &mut ValidationResult,
    ) {
        for key in fetch_results.failure_keys() {
            match key {
                validation::VALIDATOR_RSYNC_COMMAND => {
                    result.warn(validation::VALIDATOR_RSYNC_COMMAND)
                }
                validation::VALIDATOR_READ_FILE => {
                    result.warn(validation::VALIDATOR_REPOSITORY_INCOMPLETE);
                    result.add_metric(
                        validation::VALIDATOR_REPOSITORY_INCOMPLETE, "true"
                    );
                }
                validation::VALIDATOR_FILE_CONTENT => {
                    result.warn(
                        validation::VALIDATOR_REPOSITORY_INCONSISTENT
                    );
                    result.add_metric(
                        validation::VALIDATOR_REPOSITORY_INCONSISTENT, "true"
                    );
                }
                _ => result.warn(validation::VALIDATOR_REPOSITORY_UNKNOWN),
            }
        }
    }
}


//------------ Helper Functions ----------------------------------------------

/// Resolves a file name listed on a manifest against the manifest’s URI.
fn resolve_sibling(uri: &uri::Rsync, file: &str) -> Option<uri::Rsync> {
    if file.contains('/') || file.starts_with('.') {
        return None
    }
    let s = uri.as_str();
    let dir = &s[..s.rfind('/')? + 1];
    uri::Rsync::from_str(&format!("{}{}", dir, file)).ok()
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::path::Path;
    use std::process::ExitStatus;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::fetch::rsync::RsyncRunner;

    /// An rsync runner that writes canned bytes instead of going remote.
    #[derive(Default)]
    struct MockRsync {
        /// The bytes to deliver, keyed by source URI.
        files: Mutex<HashMap<String, Bytes>>,

        /// The number of transfers run.
        calls: AtomicUsize,
    }

    impl MockRsync {
        fn insert(&self, uri: &str, content: &[u8]) {
            self.files.lock().unwrap().insert(
                uri.into(), Bytes::copy_from_slice(content)
            );
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl RsyncRunner for MockRsync {
        fn execute(
            &self,
            source: &uri::Rsync,
            destination: &Path,
            _recursive: bool,
        ) -> Result<ExitStatus, io::Error> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.files.lock().unwrap().get(source.as_str()) {
                Some(bytes) => {
                    if let Some(parent) = destination.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(destination, bytes)?;
                    Ok(ExitStatus::from_raw(0))
                }
                None => Ok(ExitStatus::from_raw(1 << 8))
            }
        }
    }

    fn test_fetcher(mock: Arc<MockRsync>) -> (ConsistentFetcher, Store) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = Store::new(&db).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteFetcher::new(mock, dir.into_path());
        (ConsistentFetcher::new(remote, store.clone(), false), store)
    }

    fn uri(s: &str) -> uri::Rsync {
        uri::Rsync::from_str(s).unwrap()
    }

    fn sha256_spec(content: &[u8]) -> FileContentSpec {
        let hash = ring::digest::digest(&ring::digest::SHA256, content);
        FileContentSpec::from_hash(ManifestHash::new(
            Bytes::copy_from_slice(hash.as_ref()),
            rpki::repository::crypto::digest::DigestAlgorithm::sha256(),
        ))
    }

    #[test]
    fn hash_hit_skips_remote() {
        let mock = Arc::new(MockRsync::default());
        let (fetcher, store) = test_fetcher(mock.clone());
        let target = uri("rsync://example.net/mod/a.bin");

        store.put(&[
            StoredObject::new(target.clone(), Bytes::from_static(b"known"))
        ]).unwrap();

        let mut result = ValidationResult::with_location(&target);
        let found = fetcher.fetch(
            &target, &sha256_spec(b"known"), &mut result
        ).unwrap().unwrap();
        assert_eq!(found.content().as_ref(), b"known");
        assert_eq!(mock.calls(), 0);
        assert!(!result.has_failures());
    }

    #[test]
    fn hash_miss_falls_back_to_remote() {
        let mock = Arc::new(MockRsync::default());
        mock.insert("rsync://example.net/mod/a.bin", b"fresh");
        let (fetcher, _) = test_fetcher(mock.clone());
        let target = uri("rsync://example.net/mod/a.bin");

        let mut result = ValidationResult::with_location(&target);
        let found = fetcher.fetch(
            &target, &sha256_spec(b"fresh"), &mut result
        ).unwrap().unwrap();
        assert_eq!(found.content().as_ref(), b"fresh");
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn absent_everywhere_is_not_in_cache() {
        let mock = Arc::new(MockRsync::default());
        let (fetcher, _) = test_fetcher(mock);
        let target = uri("rsync://example.net/mod/gone.bin");

        let mut result = ValidationResult::with_location(&target);
        let found = fetcher.fetch(
            &target, &FileContentSpec::unrestricted(), &mut result
        ).unwrap();
        assert!(found.is_none());
        assert!(result.has_failure_at(&target));
        assert!(result.checks_at(&target).iter().any(|check| {
            check.key()
                == validation::VALIDATOR_REPOSITORY_OBJECT_NOT_IN_CACHE
        }));
    }

    #[test]
    fn remote_failure_becomes_warning() {
        let mock = Arc::new(MockRsync::default());
        let (fetcher, store) = test_fetcher(mock);
        let target = uri("rsync://example.net/mod/a.bin");

        // A previous run stored an object for the URI.
        store.put(&[
            StoredObject::new(target.clone(), Bytes::from_static(b"old"))
        ]).unwrap();

        let mut result = ValidationResult::with_location(&target);
        let found = fetcher.fetch(
            &target, &FileContentSpec::unrestricted(), &mut result
        ).unwrap().unwrap();

        // The stored copy is served and the remote failure is only a
        // warning.
        assert_eq!(found.content().as_ref(), b"old");
        assert!(!result.has_failures());
        assert!(result.checks_at(&target).iter().any(|check| {
            check.key() == validation::VALIDATOR_RSYNC_COMMAND
        }));
    }

    #[test]
    fn plain_object_is_stored() {
        let mock = Arc::new(MockRsync::default());
        mock.insert("rsync://example.net/mod/a.bin", b"payload");
        let (fetcher, store) = test_fetcher(mock);
        let target = uri("rsync://example.net/mod/a.bin");

        let mut result = ValidationResult::with_location(&target);
        let found = fetcher.fetch(
            &target, &FileContentSpec::unrestricted(), &mut result
        ).unwrap().unwrap();
        assert_eq!(found.content().as_ref(), b"payload");
        assert!(store.get_latest_by_url(&target).unwrap().is_some());
    }

    #[test]
    fn content_mismatch_becomes_inconsistent_warning() {
        let mock = Arc::new(MockRsync::default());
        mock.insert("rsync://example.net/mod/a.bin", b"tampered");
        let (fetcher, _) = test_fetcher(mock);
        let target = uri("rsync://example.net/mod/a.bin");

        let mut result = ValidationResult::with_location(&target);
        let found = fetcher.fetch(
            &target, &sha256_spec(b"expected"), &mut result
        ).unwrap();

        // Nothing stored, nothing returned; the mismatch surfaces as the
        // repository-inconsistent warning plus the not-in-cache failure.
        assert!(found.is_none());
        let keys: Vec<_> = result.checks_at(&target).iter().map(|check| {
            check.key()
        }).collect();
        assert!(keys.contains(
            &validation::VALIDATOR_REPOSITORY_INCONSISTENT
        ));
        assert!(keys.contains(
            &validation::VALIDATOR_REPOSITORY_OBJECT_NOT_IN_CACHE
        ));
    }

    #[test]
    fn resolve_sibling_paths() {
        let mft = uri("rsync://example.net/mod/sub/x.mft");
        assert_eq!(
            resolve_sibling(&mft, "a.roa").unwrap().as_str(),
            "rsync://example.net/mod/sub/a.roa"
        );
        assert!(resolve_sibling(&mft, "../escape.roa").is_none());
        assert!(resolve_sibling(&mft, "deep/file.roa").is_none());
    }
}
