//! Country lookup using a MaxMind GeoLite2/GeoIP2 MMDB
//!
//! Used to fill in the country of records whose source did not report one.

use anyhow::{Context, Result};
use maxminddb::{geoip2, Mmap, Reader};
use std::net::IpAddr;
use std::sync::Arc;

/// Thread-safe country resolver backed by a memory-mapped database
#[derive(Clone)]
pub struct GeoIpService {
    reader: Option<Arc<Reader<Mmap>>>,
}

impl GeoIpService {
    /// Open the Country (or City) database at `path`; `None` disables lookups.
    pub fn new(path: Option<&str>) -> Result<Self> {
        let reader = match path {
            Some(path) => {
                let reader = unsafe { Reader::open_mmap(path) }
                    .with_context(|| format!("Failed to open GeoIP database at {}", path))?;
                Some(Arc::new(reader))
            }
            None => None,
        };

        Ok(Self { reader })
    }

    pub fn is_enabled(&self) -> bool {
        self.reader.is_some()
    }

    /// ISO country code for `ip`, if the database knows it.
    ///
    /// The Country decoder works against City databases too, since City is a
    /// superset of Country data.
    pub fn country_code(&self, ip: IpAddr) -> Option<String> {
        let reader = self.reader.as_ref()?;
        let result = reader.lookup(ip).ok()?;
        let country = result.decode::<geoip2::Country>().ok()??;
        country.country.iso_code.map(|s| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geoip_service_creation_invalid_path() {
        let result = GeoIpService::new(Some("/nonexistent/path.mmdb"));
        assert!(result.is_err());
    }

    #[test]
    fn test_disabled_service_returns_no_country() {
        let service = GeoIpService::new(None).unwrap();
        assert!(!service.is_enabled());
        assert_eq!(service.country_code("203.0.113.5".parse().unwrap()), None);
    }
}
