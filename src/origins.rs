//! Route origins attested by validated ROAs.
//!
//! Every validated ROA authorizes one AS to originate routes for a set of
//! prefixes. The types in this module carry that payload around: the
//! [`RouteOrigin`] itself, the collection of all origins produced by a
//! run, and the locally configured [`Filters`] and [`Whitelist`] that are
//! applied when the origins are published.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use rpki::repository::resources::AsId as Asn;
use rpki::repository::roa::FriendlyRoaIpAddress;


//------------ RouteOrigin ---------------------------------------------------

/// A single route origin authorization.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RouteOrigin {
    /// The origin AS number.
    asn: Asn,

    /// The authorized IP address prefix.
    prefix: AddressPrefix,

    /// The maximum authorized route prefix length.
    max_length: u8,
}

impl RouteOrigin {
    /// Creates a new route origin from its components.
    pub fn new(asn: Asn, prefix: AddressPrefix, max_length: u8) -> Self {
        RouteOrigin { asn, prefix, max_length }
    }

    /// Creates a new route origin from ROA content.
    pub fn from_roa(asn: Asn, addr: &FriendlyRoaIpAddress) -> Self {
        RouteOrigin {
            asn,
            prefix: AddressPrefix::from(addr),
            max_length: addr.max_length(),
        }
    }

    /// Returns the origin AS number.
    pub fn asn(&self) -> Asn {
        self.asn
    }

    /// Returns the IP address prefix.
    pub fn prefix(&self) -> AddressPrefix {
        self.prefix
    }

    /// Returns the maximum authorized route prefix length.
    pub fn max_length(&self) -> u8 {
        self.max_length
    }
}

impl fmt::Display for RouteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} => {}-{}", self.prefix, self.max_length, self.asn)
    }
}


//------------ RouteOrigins --------------------------------------------------

/// The collection of route origins produced by a validation run.
#[derive(Clone, Debug, Default)]
pub struct RouteOrigins {
    /// The origins in the order they were encountered.
    origins: Vec<RouteOrigin>,
}

impl RouteOrigins {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends an origin to the collection.
    pub fn push(&mut self, origin: RouteOrigin) {
        self.origins.push(origin)
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteOrigin> {
        self.origins.iter()
    }

    /// Returns the origins that survive the filters plus the whitelist.
    pub fn publish(
        &self, filters: &Filters, whitelist: &Whitelist
    ) -> Vec<RouteOrigin> {
        let mut res: Vec<_> = self.origins.iter().filter(|origin| {
            filters.keep_origin(origin)
        }).cloned().collect();
        for origin in whitelist.iter() {
            if !res.contains(origin) {
                res.push(*origin)
            }
        }
        res
    }
}


//------------ AddressPrefix -------------------------------------------------

/// An IP address prefix: an IP address and a prefix length.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AddressPrefix {
    addr: IpAddr,
    len: u8,
}

impl AddressPrefix {
    /// Creates a new prefix from an address and a length.
    pub fn new(addr: IpAddr, len: u8) -> Self {
        AddressPrefix { addr, len }
    }

    /// Returns the IP address part of a prefix.
    pub fn address(self) -> IpAddr {
        self.addr
    }

    /// Returns the length part of a prefix.
    pub fn address_length(self) -> u8 {
        self.len
    }

    /// Returns whether `self` covers `other`.
    pub fn covers(self, other: Self) -> bool {
        match (self.addr, other.addr) {
            (IpAddr::V4(left), IpAddr::V4(right)) => {
                if self.len > other.len {
                    return false
                }
                if self.len == 0 {
                    return true
                }
                let left = u32::from(left)
                    >> (32u8.saturating_sub(self.len));
                let right = u32::from(right)
                    >> (32u8.saturating_sub(self.len));
                left == right
            }
            (IpAddr::V6(left), IpAddr::V6(right)) => {
                if self.len > other.len {
                    return false
                }
                if self.len == 0 {
                    return true
                }
                let left = u128::from(left)
                    >> (128u8.saturating_sub(self.len));
                let right = u128::from(right)
                    >> (128u8.saturating_sub(self.len));
                left == right
            }
            _ => false
        }
    }
}

impl<'a> From<&'a FriendlyRoaIpAddress> for AddressPrefix {
    fn from(addr: &'a FriendlyRoaIpAddress) -> Self {
        AddressPrefix {
            addr: addr.address(),
            len: addr.address_length(),
        }
    }
}

impl FromStr for AddressPrefix {
    type Err = FromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut iter = s.splitn(2, '/');
        let addr = iter.next().ok_or(FromStrError)?;
        let len = iter.next().ok_or(FromStrError)?;
        let addr = IpAddr::from_str(addr).map_err(|_| FromStrError)?;
        let len = u8::from_str(len).map_err(|_| FromStrError)?;
        let max_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max_len {
            return Err(FromStrError)
        }
        Ok(AddressPrefix { addr, len })
    }
}

impl fmt::Display for AddressPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}


//------------ Filters -------------------------------------------------------

/// Locally configured filters removing origins from the published set.
///
/// The collection has value semantics: adding or removing a filter
/// produces a new collection, matching how the whole memory image is
/// swapped atomically.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Filters {
    filters: Vec<PrefixFilter>,
}

impl Filters {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns a new collection with the given filter added.
    pub fn with(&self, filter: PrefixFilter) -> Self {
        let mut filters = self.filters.clone();
        if !filters.contains(&filter) {
            filters.push(filter)
        }
        Filters { filters }
    }

    /// Returns a new collection with the given filter removed.
    pub fn without(&self, filter: &PrefixFilter) -> Self {
        Filters {
            filters: self.filters.iter().filter(|item| {
                *item != filter
            }).cloned().collect()
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrefixFilter> {
        self.filters.iter()
    }

    /// Returns whether an origin survives all filters.
    pub fn keep_origin(&self, origin: &RouteOrigin) -> bool {
        !self.filters.iter().any(|filter| filter.matches(origin))
    }
}


//------------ PrefixFilter --------------------------------------------------

/// A single filter dropping origins by prefix, ASN, or both.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrefixFilter {
    prefix: Option<AddressPrefix>,
    asn: Option<Asn>,
}

impl PrefixFilter {
    /// Creates a new filter.
    ///
    /// A filter with neither a prefix nor an ASN matches nothing.
    pub fn new(prefix: Option<AddressPrefix>, asn: Option<Asn>) -> Self {
        PrefixFilter { prefix, asn }
    }

    /// Returns whether the filter matches the given origin.
    fn matches(&self, origin: &RouteOrigin) -> bool {
        match (self.prefix, self.asn) {
            (Some(prefix), Some(asn)) => {
                prefix.covers(origin.prefix()) && asn == origin.asn()
            }
            (Some(prefix), None) => prefix.covers(origin.prefix()),
            (None, Some(asn)) => asn == origin.asn(),
            (None, None) => false,
        }
    }
}


//------------ Whitelist -----------------------------------------------------

/// Locally asserted route origins added to the published set.
///
/// Like [`Filters`], the collection has value semantics.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Whitelist {
    origins: Vec<RouteOrigin>,
}

impl Whitelist {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns a new collection with the given origin added.
    pub fn with(&self, origin: RouteOrigin) -> Self {
        let mut origins = self.origins.clone();
        if !origins.contains(&origin) {
            origins.push(origin)
        }
        Whitelist { origins }
    }

    /// Returns a new collection with the given origin removed.
    pub fn without(&self, origin: &RouteOrigin) -> Self {
        Whitelist {
            origins: self.origins.iter().filter(|item| {
                *item != origin
            }).cloned().collect()
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteOrigin> {
        self.origins.iter()
    }
}


//------------ FromStrError --------------------------------------------------

/// A string does not form a valid address prefix.
#[derive(Clone, Copy, Debug)]
pub struct FromStrError;

impl fmt::Display for FromStrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid address prefix")
    }
}

impl std::error::Error for FromStrError { }


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn prefix(s: &str) -> AddressPrefix {
        AddressPrefix::from_str(s).unwrap()
    }

    fn origin(asn: u32, pfx: &str, max_length: u8) -> RouteOrigin {
        RouteOrigin::new(Asn::from(asn), prefix(pfx), max_length)
    }

    #[test]
    fn prefix_parsing() {
        let pfx = prefix("192.0.2.0/24");
        assert_eq!(pfx.address_length(), 24);
        assert_eq!(pfx.to_string(), "192.0.2.0/24");

        assert!(AddressPrefix::from_str("192.0.2.0").is_err());
        assert!(AddressPrefix::from_str("192.0.2.0/33").is_err());
        assert!(AddressPrefix::from_str("2001:db8::/129").is_err());
        assert!(AddressPrefix::from_str("not-an-addr/8").is_err());
    }

    #[test]
    fn prefix_covers() {
        assert!(prefix("10.0.0.0/8").covers(prefix("10.1.0.0/16")));
        assert!(!prefix("10.1.0.0/16").covers(prefix("10.0.0.0/8")));
        assert!(!prefix("10.0.0.0/8").covers(prefix("11.0.0.0/16")));
        assert!(prefix("2001:db8::/32").covers(prefix("2001:db8:1::/48")));
        assert!(!prefix("10.0.0.0/8").covers(prefix("2001:db8::/32")));
        assert!(prefix("0.0.0.0/0").covers(prefix("203.0.113.0/24")));
    }

    #[test]
    fn filters_and_whitelist() {
        let origins = {
            let mut res = RouteOrigins::new();
            res.push(origin(64496, "192.0.2.0/24", 24));
            res.push(origin(64497, "198.51.100.0/24", 24));
            res
        };

        let filters = Filters::new().with(
            PrefixFilter::new(None, Some(Asn::from(64497)))
        );
        let whitelist = Whitelist::new().with(
            origin(64511, "203.0.113.0/24", 24)
        );

        let published = origins.publish(&filters, &whitelist);
        assert_eq!(published.len(), 2);
        assert!(published.contains(&origin(64496, "192.0.2.0/24", 24)));
        assert!(published.contains(&origin(64511, "203.0.113.0/24", 24)));

        // Value semantics: the originals are untouched.
        assert_eq!(filters.iter().count(), 1);
        let fewer = filters.without(
            &PrefixFilter::new(None, Some(Asn::from(64497)))
        );
        assert_eq!(fewer.iter().count(), 0);
        assert_eq!(filters.iter().count(), 1);
    }
}
