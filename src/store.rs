//! A durable store for repository objects.
//!
//! To be resistant against incomplete or inconsistent publication points,
//! we retain a copy of every object that was part of a fully fetched,
//! internally consistent manifest set in what we call the _store._ The
//! types in this module provide access to this store.
//!
//! The store is content addressed: objects are keyed by the SHA-256 digest
//! of their bytes and can be looked up via [`get_by_hash`]. A second index
//! maps an rsync URI to the hash of the object most recently stored for
//! it, served by [`get_latest_by_url`]. Both indexes are updated together
//! by [`put`] which commits a whole batch of objects atomically – either
//! all objects of a manifest set become visible or none do.
//!
//! # Error Handling
//!
//! Pretty much all methods and functions provided by this module can return
//! an error. This is because the underlying database may produce an error
//! at any time. The concrete error reason is logged and our generic
//! [`Failed`][crate::error::Failed] is returned. When this happens, the
//! store should be considered broken and not be used anymore.
//!
//! # Data Storage
//!
//! The store uses a [sled] database with two trees. The _object tree_,
//! named `"store:objects"`, maps the SHA-256 digest of an object to the
//! object’s URI and bytes. The _URI tree_, named `"store:uris"`, maps an
//! rsync URI to the digest of the most recent object stored for that URI
//! together with the time it was stored, which drives expiry.
//!
//! [`get_by_hash`]: Store::get_by_hash
//! [`get_latest_by_url`]: Store::get_latest_by_url
//! [`put`]: Store::put
//! [sled]: https://github.com/spacejam/sled

use std::{error, fmt, mem};
use std::convert::{TryFrom, TryInto};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use log::error;
use ring::digest;
use rpki::repository::x509::Time;
use rpki::uri;
use sled::Transactional;
use sled::transaction::TransactionError;
use crate::error::Failed;


//------------ Store ---------------------------------------------------------

/// A content-addressed store for repository objects.
///
/// A store is created via [`new`][Store::new] from an opened sled database.
/// It is cheap to clone and can be shared between the workers of a
/// validation run; writes are atomic at batch granularity.
#[derive(Clone, Debug)]
pub struct Store {
    /// The tree mapping object hashes to stored objects.
    objects: sled::Tree,

    /// The tree mapping URIs to the hash of their latest object.
    uris: sled::Tree,
}

impl Store {
    /// Creates a new store on the given database.
    pub fn new(db: &sled::Db) -> Result<Self, Failed> {
        Ok(Store {
            objects: db.open_tree("store:objects")?,
            uris: db.open_tree("store:uris")?,
        })
    }

    /// Returns the stored object with the given SHA-256 digest.
    pub fn get_by_hash(
        &self, hash: &[u8]
    ) -> Result<Option<StoredObject>, Failed> {
        match self.objects.get(hash)? {
            Some(value) => {
                StoredObject::try_from(value).map(Some).map_err(|err| {
                    error!("Failed to decode stored object: {}", err);
                    Failed
                })
            }
            None => Ok(None)
        }
    }

    /// Returns the most recently stored object for the given URI.
    pub fn get_latest_by_url(
        &self, uri: &uri::Rsync
    ) -> Result<Option<StoredObject>, Failed> {
        let entry = match self.uris.get(uri.as_slice())? {
            Some(value) => UriEntry::try_from(value).map_err(|err| {
                error!("Failed to decode stored URI entry: {}", err);
                Failed
            })?,
            None => return Ok(None)
        };
        self.get_by_hash(&entry.hash)
    }

    /// Stores a batch of objects.
    ///
    /// Either all objects of the batch become visible or none do. Storing
    /// an object whose hash is already present quietly overwrites the
    /// identical data, so the operation is idempotent.
    pub fn put(&self, batch: &[StoredObject]) -> Result<(), Failed> {
        let now = Time::now();
        (&self.objects, &self.uris).transaction(|(objects, uris)| {
            for item in batch {
                objects.insert(item.hash().as_slice(), item)?;
                uris.insert(
                    item.uri().as_slice(),
                    &UriEntry::new(*item.hash(), now)
                )?;
            }
            Ok(())
        }).map_err(|err: TransactionError<()>| {
            match err {
                TransactionError::Abort(()) => unreachable!(),
                TransactionError::Storage(err) => {
                    error!("Failed to update object store: {}", err);
                    Failed
                }
            }
        })
    }

    /// Removes all entries last stored more than `max_stale_days` ago.
    ///
    /// Objects no longer referenced from the URI index are removed as
    /// well. Applying the method twice has the same effect as applying it
    /// once.
    pub fn purge_expired(&self, max_stale_days: u64) -> Result<(), Failed> {
        let threshold: Time = (
            Utc::now() - chrono::Duration::days(max_stale_days as i64)
        ).into();

        for item in self.uris.iter() {
            let (key, value) = item?;
            let stale = match UriEntry::try_from(value) {
                Ok(entry) => entry.updated < threshold,
                Err(_) => true
            };
            if stale {
                self.uris.remove(key)?;
            }
        }

        let mut retained = std::collections::HashSet::new();
        for item in self.uris.iter() {
            let (_, value) = item?;
            if let Ok(entry) = UriEntry::try_from(value) {
                retained.insert(entry.hash);
            }
        }
        for item in self.objects.iter() {
            let (key, _) = item?;
            let keep = <[u8; 32]>::try_from(key.as_ref()).map(|hash| {
                retained.contains(&hash)
            }).unwrap_or(false);
            if !keep {
                self.objects.remove(key)?;
            }
        }

        Ok(())
    }
}


//------------ StoredObject --------------------------------------------------

/// A repository object as kept in the store.
///
/// The object consists of the raw bytes fetched from the repository, the
/// rsync URI it was fetched from, and the SHA-256 digest of the bytes. The
/// digest is computed when the value is created, so for every stored
/// object the content-addressing invariant holds by construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredObject {
    /// The URI the object was fetched from.
    uri: uri::Rsync,

    /// The raw bytes of the object.
    content: Bytes,

    /// The SHA-256 digest of `content`.
    hash: [u8; 32],
}

impl StoredObject {
    /// Creates a new stored object from its URI and bytes.
    pub fn new(uri: uri::Rsync, content: Bytes) -> Self {
        let digest = digest::digest(&digest::SHA256, &content);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(digest.as_ref());
        StoredObject { uri, content, hash }
    }

    /// Returns the URI of the object.
    pub fn uri(&self) -> &uri::Rsync {
        &self.uri
    }

    /// Returns the raw bytes of the object.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Converts the stored object into the object’s raw bytes.
    pub fn into_content(self) -> Bytes {
        self.content
    }

    /// Returns the SHA-256 digest of the object’s bytes.
    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }
}


//--- From and TryFrom

impl<'a> From<&'a StoredObject> for sled::IVec {
    fn from(object: &'a StoredObject) -> sled::IVec {
        // Encoding starts with a version number of 0u8. Then follows the
        // URI preceded by its length as a u32 in network byte order. The
        // content is the rest of the buffer. The hash is not encoded; it
        // is the key of the object tree and recomputed on decode.
        let uri_len = u32::try_from(
            object.uri.as_slice().len()
        ).expect("object URI exceeds size limit");

        let mut vec = Vec::new();
        vec.push(0u8);
        vec.extend_from_slice(&uri_len.to_be_bytes());
        vec.extend_from_slice(object.uri.as_slice());
        vec.extend_from_slice(object.content.as_ref());
        vec.into()
    }
}

impl TryFrom<sled::IVec> for StoredObject {
    type Error = ObjectError;

    fn try_from(stored: sled::IVec) -> Result<StoredObject, Self::Error> {
        let mut stored = Bytes::copy_from_slice(stored.as_ref());
        if stored.is_empty() || stored.split_to(1).as_ref() != b"\0" {
            return Err(ObjectError)
        }
        let len = take_encoded_len(&mut stored)?;
        if stored.len() < len {
            return Err(ObjectError)
        }
        let uri = uri::Rsync::from_bytes(
            stored.split_to(len)
        ).map_err(|_| ObjectError)?;
        Ok(StoredObject::new(uri, stored))
    }
}


//------------ UriEntry ------------------------------------------------------

/// The value of the URI index: latest hash plus the time it was stored.
#[derive(Clone, Debug, Eq, PartialEq)]
struct UriEntry {
    /// The hash of the most recent object stored for the URI.
    hash: [u8; 32],

    /// When that object was stored.
    updated: Time,
}

impl UriEntry {
    fn new(hash: [u8; 32], updated: Time) -> Self {
        UriEntry { hash, updated }
    }
}


//--- From and TryFrom

impl<'a> From<&'a UriEntry> for sled::IVec {
    fn from(entry: &'a UriEntry) -> sled::IVec {
        // Version 0u8, the update time as an i64 timestamp in network
        // byte order, then the 32 hash octets.
        let mut vec = Vec::with_capacity(1 + 8 + 32);
        vec.push(0u8);
        vec.extend_from_slice(&entry.updated.timestamp().to_be_bytes());
        vec.extend_from_slice(&entry.hash);
        vec.into()
    }
}

impl TryFrom<sled::IVec> for UriEntry {
    type Error = ObjectError;

    fn try_from(stored: sled::IVec) -> Result<UriEntry, Self::Error> {
        let mut stored = Bytes::copy_from_slice(stored.as_ref());
        if stored.is_empty() || stored.split_to(1).as_ref() != b"\0" {
            return Err(ObjectError)
        }
        let updated = take_time(&mut stored)?;
        let hash = <[u8; 32]>::try_from(
            stored.as_ref()
        ).map_err(|_| ObjectError)?;
        Ok(UriEntry { hash, updated })
    }
}


//------------ ObjectError ---------------------------------------------------

/// A stored value cannot be decoded correctly.
#[derive(Clone, Copy, Debug)]
pub struct ObjectError;

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("stored object cannot be decoded")
    }
}

impl error::Error for ObjectError { }


//------------ Helper Functions ----------------------------------------------

/// Takes an encoded `Time` value from the beginning of a bytes value.
fn take_time(bytes: &mut Bytes) -> Result<Time, ObjectError> {
    if bytes.len() < mem::size_of::<i64>() {
        return Err(ObjectError)
    }
    let int_bytes = bytes.split_to(mem::size_of::<i64>());
    let int = i64::from_be_bytes(int_bytes.as_ref().try_into().unwrap());
    Ok(Utc.timestamp_opt(int, 0).single().ok_or(ObjectError)?.into())
}

/// Takes an encoded sequence length from the beginning of a bytes value.
///
/// All lengths are encoded as `u32` in network byte order, even if we
/// return `usize` for convenience.
fn take_encoded_len(bytes: &mut Bytes) -> Result<usize, ObjectError> {
    if bytes.len() < mem::size_of::<u32>() {
        return Err(ObjectError)
    }
    let int_bytes = bytes.split_to(mem::size_of::<u32>());
    usize::try_from(
        u32::from_be_bytes(int_bytes.as_ref().try_into().unwrap())
    ).map_err(|_| ObjectError)
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    fn test_store() -> Store {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Store::new(&db).unwrap()
    }

    fn object(uri: &str, content: &[u8]) -> StoredObject {
        StoredObject::new(
            uri::Rsync::from_str(uri).unwrap(),
            Bytes::copy_from_slice(content),
        )
    }

    #[test]
    fn encoded_stored_object() {
        let orig = object("rsync://foo.bar/bla/blubb", b"foobar");
        let decoded = StoredObject::try_from(
            sled::IVec::from(&orig)
        ).unwrap();
        assert_eq!(orig, decoded);
    }

    #[test]
    fn encoded_uri_entry() {
        let orig = UriEntry::new(
            [7u8; 32], Time::utc(2021, 2, 18, 13, 22, 6)
        );
        let decoded = UriEntry::try_from(sled::IVec::from(&orig)).unwrap();
        assert_eq!(orig, decoded);
    }

    #[test]
    fn content_addressing() {
        let store = test_store();
        let obj = object("rsync://example.net/mod/a.roa", b"content");
        store.put(std::slice::from_ref(&obj)).unwrap();

        let found = store.get_by_hash(obj.hash()).unwrap().unwrap();
        let digest = digest::digest(&digest::SHA256, found.content());
        assert_eq!(digest.as_ref(), found.hash());
        assert_eq!(found, obj);

        assert!(store.get_by_hash(&[0u8; 32]).unwrap().is_none());
    }

    #[test]
    fn latest_by_url_wins() {
        let store = test_store();
        let first = object("rsync://example.net/mod/a.roa", b"one");
        let second = object("rsync://example.net/mod/a.roa", b"two");
        store.put(std::slice::from_ref(&first)).unwrap();
        store.put(std::slice::from_ref(&second)).unwrap();

        let found = store.get_latest_by_url(first.uri()).unwrap().unwrap();
        assert_eq!(found.content().as_ref(), b"two");

        // The earlier object stays reachable through its hash.
        assert!(store.get_by_hash(first.hash()).unwrap().is_some());
    }

    #[test]
    fn batch_is_visible_together() {
        let store = test_store();
        let batch = vec![
            object("rsync://example.net/mod/m.mft", b"manifest"),
            object("rsync://example.net/mod/a.roa", b"roa"),
            object("rsync://example.net/mod/b.cer", b"cert"),
        ];
        store.put(&batch).unwrap();
        for item in &batch {
            assert!(store.get_latest_by_url(item.uri()).unwrap().is_some());
            assert!(store.get_by_hash(item.hash()).unwrap().is_some());
        }

        // Putting the same batch again is fine.
        store.put(&batch).unwrap();
        assert_eq!(store.objects.len(), 3);
        assert_eq!(store.uris.len(), 3);
    }

    #[test]
    fn purge_expired_is_idempotent() {
        let store = test_store();
        let obj = object("rsync://example.net/mod/a.roa", b"fresh");
        store.put(std::slice::from_ref(&obj)).unwrap();

        // Fresh objects survive.
        store.purge_expired(7).unwrap();
        assert!(store.get_by_hash(obj.hash()).unwrap().is_some());

        // Backdate the URI entry past the threshold.
        let old = UriEntry::new(
            *obj.hash(),
            (Utc::now() - chrono::Duration::days(10)).into(),
        );
        store.uris.insert(obj.uri().as_slice(), &old).unwrap();

        store.purge_expired(7).unwrap();
        assert!(store.get_by_hash(obj.hash()).unwrap().is_none());
        assert!(store.get_latest_by_url(obj.uri()).unwrap().is_none());

        // A second application has nothing left to do.
        store.purge_expired(7).unwrap();
        assert_eq!(store.objects.len(), 0);
        assert_eq!(store.uris.len(), 0);
    }
}
