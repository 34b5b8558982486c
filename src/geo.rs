use log::{debug, warn};
use maxminddb::{MaxMindDBError, Reader, geoip2};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

/// Offline address-to-country lookup.
pub trait GeoLookup {
    /// Upper-case ISO 3166 code, or `None` when the address cannot be resolved.
    fn country(&self, addr: IpAddr) -> Option<String>;
}

/// MaxMind country database. A missing or unreadable file resolves nothing.
pub struct MaxMindGeo {
    reader: Option<Reader<Vec<u8>>>,
}

impl MaxMindGeo {
    pub fn open(path: &Path) -> Self {
        let reader = match Reader::open_readfile(path) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!(
                    "GeoIP database {} unavailable ({}). Geo-blocking disabled for this run.",
                    path.display(),
                    e
                );
                None
            }
        };
        Self { reader }
    }
}

impl GeoLookup for MaxMindGeo {
    fn country(&self, addr: IpAddr) -> Option<String> {
        let reader = self.reader.as_ref()?;
        match reader.lookup::<geoip2::Country>(addr) {
            Ok(record) => record
                .country
                .and_then(|c| c.iso_code)
                .map(str::to_ascii_uppercase),
            Err(MaxMindDBError::AddressNotFoundError(_)) => None,
            Err(e) => {
                debug!("GeoIP lookup for {} failed: {}", addr, e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoVerdict {
    /// No country could be resolved; never grounds for a block.
    Unknown,
    Allowed(String),
    Disallowed(String),
}

pub struct GeoPolicy<G> {
    lookup: G,
    allowed: HashSet<String>,
}

impl<G: GeoLookup> GeoPolicy<G> {
    pub fn new(lookup: G, allowed: HashSet<String>) -> Self {
        Self { lookup, allowed }
    }

    pub fn evaluate(&self, addr: IpAddr) -> GeoVerdict {
        match self.lookup.country(addr) {
            None => GeoVerdict::Unknown,
            Some(code) if self.allowed.contains(&code) => GeoVerdict::Allowed(code),
            Some(code) => GeoVerdict::Disallowed(code),
        }
    }
}
