//! Trust Anchor Locators.
//!
//! A trust anchor locator, or TAL, identifies the root CA of a PKI tree by
//! the URIs its certificate can be fetched from and the public key the
//! certificate must carry. Two file formats are in circulation: the plain
//! format from RFC 7730 – a list of URIs, an empty line, and the base 64
//! encoded public key – and an extended key-value format that additionally
//! carries a human-readable CA name and a set of URIs worth prefetching.
//! Both are accepted here.

use std::{fmt, fs, io};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use log::{error, warn};
use rpki::repository::crypto::keys::PublicKey;
use rpki::repository::tal::TalInfo;
use rpki::uri;
use crate::error::Failed;


//------------ TrustAnchorLocator --------------------------------------------

/// A trust anchor locator.
///
/// Values are created by parsing a TAL file via [`read`][Self::read] and
/// are never modified afterwards. Equality is based on the file name the
/// locator was read from, which doubles as the name of the per-anchor
/// rsync cache directory.
#[derive(Clone, Debug)]
pub struct TrustAnchorLocator {
    /// The name of the file the TAL was read from.
    file_name: String,

    /// The name of the CA the TAL refers to.
    ca_name: String,

    /// The TAL info handed to certificate validation.
    info: Arc<TalInfo>,

    /// The URIs to fetch the trust anchor certificate from, in order.
    certificate_locations: Vec<uri::Rsync>,

    /// The public key the trust anchor certificate must carry.
    key_info: PublicKey,

    /// URIs worth bulk-fetching before the walk starts.
    prefetch_uris: Vec<uri::Rsync>,
}

impl TrustAnchorLocator {
    /// Reads a TAL from a reader.
    ///
    /// The `file_name` is used to derive the CA name if the TAL itself
    /// doesn’t carry one.
    pub fn read<R: io::Read>(
        file_name: String, reader: &mut R
    ) -> Result<Self, ReadError> {
        let mut data = String::new();
        reader.read_to_string(&mut data)?;

        let extended = data.lines().find(|line| {
            !line.trim().is_empty() && !line.starts_with('#')
        }).map(|line| line.contains('=')).unwrap_or(false);

        if extended {
            Self::read_extended(file_name, &data)
        }
        else {
            Self::read_plain(file_name, &data)
        }
    }

    /// Reads a TAL in the extended key-value format.
    fn read_extended(
        file_name: String, data: &str
    ) -> Result<Self, ReadError> {
        let mut ca_name = None;
        let mut locations = Vec::new();
        let mut prefetch = Vec::new();
        let mut key_base64 = String::new();

        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue
            }
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => {
                    // A continuation line of the base 64 key block.
                    key_base64.push_str(line);
                    continue
                }
            };
            match key {
                "ca.name" => ca_name = Some(value.to_string()),
                "certificate.location" => {
                    for item in value.split(',') {
                        locations.push(uri::Rsync::from_str(item.trim())?)
                    }
                }
                "prefetch.uris" => {
                    for item in value.split(',') {
                        prefetch.push(uri::Rsync::from_str(item.trim())?)
                    }
                }
                "public.key.info" => key_base64.push_str(value),
                _ => return Err(ReadError::UnknownKey(key.to_string()))
            }
        }

        Self::from_parts(file_name, ca_name, locations, prefetch, key_base64)
    }

    /// Reads a TAL in the plain RFC 7730 format.
    fn read_plain(file_name: String, data: &str) -> Result<Self, ReadError> {
        let mut locations = Vec::new();
        let mut key_base64 = String::new();
        let mut in_key = false;

        for line in data.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue
            }
            if line.is_empty() {
                if !locations.is_empty() {
                    in_key = true
                }
                continue
            }
            if in_key {
                key_base64.push_str(line)
            }
            else {
                locations.push(uri::Rsync::from_str(line)?)
            }
        }

        Self::from_parts(file_name, None, locations, Vec::new(), key_base64)
    }

    /// Creates the final value from the parsed pieces.
    fn from_parts(
        file_name: String,
        ca_name: Option<String>,
        certificate_locations: Vec<uri::Rsync>,
        prefetch_uris: Vec<uri::Rsync>,
        key_base64: String,
    ) -> Result<Self, ReadError> {
        if certificate_locations.is_empty() {
            return Err(ReadError::MissingLocation)
        }
        if key_base64.is_empty() {
            return Err(ReadError::MissingKeyInfo)
        }
        let der = base64::decode(&key_base64)?;
        let key_info = PublicKey::decode(der.as_slice()).map_err(|_| {
            ReadError::BadKeyInfo
        })?;
        let ca_name = ca_name.unwrap_or_else(|| {
            file_name.trim_end_matches(".tal").to_string()
        });
        let info = TalInfo::from_name(ca_name.clone()).into_arc();
        Ok(TrustAnchorLocator {
            file_name, ca_name, info,
            certificate_locations, key_info, prefetch_uris,
        })
    }

    /// Loads all TAL files from the given directory.
    ///
    /// All regular files with an extension of `tal` are treated as TAL
    /// files. An empty directory is not an error but gets a warning since
    /// the validator will have nothing to do.
    pub fn load_dir(dir: &Path) -> Result<Vec<Arc<Self>>, Failed> {
        let mut res = Vec::new();
        let entries = fs::read_dir(dir).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                error!(
                    "Missing TAL directory {}.\n\
                     You may have to initialize it via 'anchorite init'.",
                    dir.display()
                );
            }
            else {
                error!("Failed to open TAL directory: {}.", err);
            }
            Failed
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| {
                error!("Failed to iterate over TAL directory: {}", err);
                Failed
            })?;
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue
            }
            let path = entry.path();
            if path.extension().map(|ext| ext != "tal").unwrap_or(true) {
                continue
            }
            let file_name = match path.file_name().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => continue
            };
            let mut file = fs::File::open(&path).map_err(|err| {
                error!("Failed to open TAL {}: {}.", path.display(), err);
                Failed
            })?;
            let tal = Self::read(file_name, &mut file).map_err(|err| {
                error!("Failed to read TAL {}: {}.", path.display(), err);
                Failed
            })?;
            res.push(Arc::new(tal));
        }
        if res.is_empty() {
            warn!("No TALs found in TAL directory. Starting anyway.");
        }
        res.sort_by(|left, right| left.file_name.cmp(&right.file_name));
        Ok(res)
    }

    /// Returns the name of the file the TAL was read from.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Returns the name of the CA.
    pub fn ca_name(&self) -> &str {
        &self.ca_name
    }

    /// Returns the TAL info for certificate validation.
    pub fn info(&self) -> &Arc<TalInfo> {
        &self.info
    }

    /// Returns the certificate locations in the order they should be tried.
    pub fn certificate_locations(&self) -> &[uri::Rsync] {
        &self.certificate_locations
    }

    /// Returns the first certificate location.
    pub fn certificate_location(&self) -> &uri::Rsync {
        &self.certificate_locations[0]
    }

    /// Returns the expected public key of the trust anchor certificate.
    pub fn key_info(&self) -> &PublicKey {
        &self.key_info
    }

    /// Returns the URIs worth prefetching before a walk.
    pub fn prefetch_uris(&self) -> &[uri::Rsync] {
        &self.prefetch_uris
    }
}


//--- PartialEq and Eq

impl PartialEq for TrustAnchorLocator {
    fn eq(&self, other: &Self) -> bool {
        self.file_name == other.file_name
    }
}

impl Eq for TrustAnchorLocator { }


//------------ ReadError -----------------------------------------------------

/// A TAL file could not be parsed.
#[derive(Debug)]
pub enum ReadError {
    /// Reading the file failed.
    Io(io::Error),

    /// The extended format contained an unexpected key.
    UnknownKey(String),

    /// There was no certificate location at all.
    MissingLocation,

    /// There was no public key.
    MissingKeyInfo,

    /// A URI was malformed.
    BadUri(uri::Error),

    /// The public key was not proper base 64.
    BadBase64(base64::DecodeError),

    /// The public key did not decode as SubjectPublicKeyInfo.
    BadKeyInfo,
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> ReadError {
        ReadError::Io(err)
    }
}

impl From<uri::Error> for ReadError {
    fn from(err: uri::Error) -> ReadError {
        ReadError::BadUri(err)
    }
}

impl From<base64::DecodeError> for ReadError {
    fn from(err: base64::DecodeError) -> ReadError {
        ReadError::BadBase64(err)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReadError::Io(ref err) => err.fmt(f),
            ReadError::UnknownKey(ref key) => {
                write!(f, "unknown key '{}'", key)
            }
            ReadError::MissingLocation => {
                f.write_str("no certificate location")
            }
            ReadError::MissingKeyInfo => f.write_str("no public key info"),
            ReadError::BadUri(ref err) => err.fmt(f),
            ReadError::BadBase64(ref err) => err.fmt(f),
            ReadError::BadKeyInfo => {
                f.write_str("invalid subject public key info")
            }
        }
    }
}


//============ Test Helpers ==================================================

/// A syntactically valid RSA SubjectPublicKeyInfo in base 64.
#[cfg(test)]
pub(crate) fn test_key_info() -> String {
    let mut der = vec![
        0x30, 0x82, 0x01, 0x22, 0x30, 0x0d, 0x06, 0x09, 0x2a,
        0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05,
        0x00, 0x03, 0x82, 0x01, 0x0f, 0x00,
    ];
    der.extend(std::iter::repeat(0xab).take(270));
    base64::encode(der)
}

/// A locator for use in tests all over the crate.
#[cfg(test)]
pub(crate) fn test_locator() -> Arc<TrustAnchorLocator> {
    let data = format!(
        "rsync://example.net/ta/root.cer\n\n{}\n", test_key_info()
    );
    Arc::new(
        TrustAnchorLocator::read("test.tal".into(), &mut data.as_bytes())
            .unwrap()
    )
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn key_info() -> String {
        test_key_info()
    }

    #[test]
    fn read_extended_format() {
        let data = format!(
            "# Example trust anchor\n\
             ca.name = Example CA\n\
             certificate.location = rsync://example.net/ta/root.cer, \
             rsync://mirror.example.net/ta/root.cer\n\
             prefetch.uris = rsync://example.net/repo/\n\
             public.key.info = {}\n",
            key_info()
        );
        let tal = TrustAnchorLocator::read(
            "example.tal".into(), &mut data.as_bytes()
        ).unwrap();
        assert_eq!(tal.ca_name(), "Example CA");
        assert_eq!(tal.certificate_locations().len(), 2);
        assert_eq!(
            tal.certificate_location().as_str(),
            "rsync://example.net/ta/root.cer"
        );
        assert_eq!(tal.prefetch_uris().len(), 1);
    }

    #[test]
    fn read_plain_format() {
        let data = format!(
            "rsync://example.net/ta/root.cer\n\n{}\n", key_info()
        );
        let tal = TrustAnchorLocator::read(
            "example.tal".into(), &mut data.as_bytes()
        ).unwrap();
        assert_eq!(tal.ca_name(), "example");
        assert_eq!(tal.certificate_locations().len(), 1);
        assert!(tal.prefetch_uris().is_empty());
    }

    #[test]
    fn read_errors() {
        assert!(matches!(
            TrustAnchorLocator::read(
                "x.tal".into(),
                &mut format!(
                    "ca.name = X\npublic.key.info = {}\n", key_info()
                )
                    .as_bytes()
            ),
            Err(ReadError::MissingLocation)
        ));
        assert!(matches!(
            TrustAnchorLocator::read(
                "x.tal".into(),
                &mut "rsync://example.net/ta/root.cer\n\n!!!not-base64\n"
                    .as_bytes()
            ),
            Err(ReadError::BadBase64(_))
        ));
        assert!(matches!(
            TrustAnchorLocator::read(
                "x.tal".into(),
                &mut "certificate.location = rsync://example.net/r.cer\n\
                      unexpected.key = 1\n".as_bytes()
            ),
            Err(ReadError::UnknownKey(_))
        ));
    }
}
