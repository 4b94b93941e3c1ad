//! IP geolocation using a MaxMind GeoLite2 database
//!
//! This module resolves session IP addresses to city/region/country and
//! coordinates. Private and loopback addresses never hit the database; they
//! resolve to a "Local Network" sentinel with no coordinates so they can not
//! take part in distance-based detection.

pub mod distance;
pub mod network;

pub use distance::{distance_km, is_impossible_travel, speed_kmh, GeoLocation};
pub use network::{is_private_address, is_private_ip};

use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// City name used for addresses on a private network
pub const LOCAL_NETWORK: &str = "Local Network";

/// Errors that can occur during geolocation lookups
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("Failed to open database: {0}")]
    DatabaseOpen(#[from] maxminddb::MaxMindDBError),

    #[error("IP address not found in database")]
    NotFound,

    #[error("Database file not found: {0}")]
    FileNotFound(String),
}

/// Resolved location details attached to a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoInfo {
    pub city: Option<String>,
    pub region: Option<String>,
    /// ISO 3166-1 alpha-2 country code
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl GeoInfo {
    /// Sentinel for private-range addresses
    pub fn local() -> Self {
        GeoInfo {
            city: Some(LOCAL_NETWORK.to_string()),
            ..GeoInfo::default()
        }
    }

    pub fn unknown() -> Self {
        GeoInfo::default()
    }

    pub fn location(&self) -> GeoLocation {
        GeoLocation {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    pub fn is_local(&self) -> bool {
        self.city.as_deref() == Some(LOCAL_NETWORK) && self.latitude.is_none()
    }

    /// Get a human-readable location string
    pub fn display_location(&self) -> String {
        match (&self.city, &self.country) {
            (Some(city), Some(country)) => format!("{}, {}", city, country),
            (None, Some(country)) => country.clone(),
            (Some(city), None) => city.clone(),
            (None, None) => "Unknown".to_string(),
        }
    }
}

/// Anything that can turn an address string into a [`GeoInfo`]
///
/// Resolution never fails; unknown addresses produce [`GeoInfo::unknown`].
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> GeoInfo;
}

/// Resolver used when no GeoIP database is configured
///
/// Still applies the private-network sentinel.
#[derive(Debug, Default, Clone)]
pub struct NoopResolver;

impl GeoResolver for NoopResolver {
    fn resolve(&self, ip: &str) -> GeoInfo {
        if is_private_address(ip) {
            GeoInfo::local()
        } else {
            GeoInfo::unknown()
        }
    }
}

/// GeoIP lookup service using MaxMind GeoLite2-City database
pub struct GeoIpService {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoIpService {
    /// Create a new GeoIP service from a MaxMind database file
    ///
    /// # Errors
    ///
    /// Returns an error if the database file cannot be opened or is invalid.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, GeoError> {
        let path = db_path.as_ref();
        if !path.exists() {
            return Err(GeoError::FileNotFound(path.display().to_string()));
        }

        let reader = Reader::open_readfile(path)?;
        Ok(GeoIpService {
            reader: Arc::new(reader),
        })
    }

    /// Look up full location details for a public IP address
    pub fn lookup(&self, ip: &IpAddr) -> Result<GeoInfo, GeoError> {
        let city: geoip2::City = self.reader.lookup(*ip).map_err(|e| match e {
            maxminddb::MaxMindDBError::AddressNotFoundError(_) => GeoError::NotFound,
            other => GeoError::DatabaseOpen(other),
        })?;

        let location = city.location.as_ref();

        Ok(GeoInfo {
            city: city
                .city
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|n| n.get("en").copied())
                .map(String::from),
            region: city
                .subdivisions
                .as_ref()
                .and_then(|s| s.first())
                .and_then(|s| s.names.as_ref())
                .and_then(|n| n.get("en").copied())
                .map(String::from),
            country: city
                .country
                .as_ref()
                .and_then(|c| c.iso_code)
                .map(String::from),
            latitude: location.and_then(|l| l.latitude),
            longitude: location.and_then(|l| l.longitude),
        })
    }
}

impl GeoResolver for GeoIpService {
    fn resolve(&self, ip: &str) -> GeoInfo {
        let addr = match ip.trim().parse::<IpAddr>() {
            Ok(addr) => addr,
            Err(_) => return GeoInfo::unknown(),
        };

        if is_private_ip(&addr) {
            return GeoInfo::local();
        }

        match self.lookup(&addr) {
            Ok(info) => info,
            Err(GeoError::NotFound) => GeoInfo::unknown(),
            Err(e) => {
                log::debug!("GeoIP lookup failed for {}: {}", ip, e);
                GeoInfo::unknown()
            }
        }
    }
}

/// GeoIP-backed resolver when a database is configured and opens, otherwise
/// the private-range-only fallback
pub fn open_resolver(db_path: Option<&Path>) -> Arc<dyn GeoResolver> {
    match db_path {
        Some(path) => match GeoIpService::new(path) {
            Ok(service) => {
                log::info!("GeoIP database loaded from {}", path.display());
                Arc::new(service)
            }
            Err(e) => {
                log::warn!("GeoIP disabled, sessions will have no location: {}", e);
                Arc::new(NoopResolver)
            }
        },
        None => Arc::new(NoopResolver),
    }
}

impl Clone for GeoIpService {
    fn clone(&self) -> Self {
        GeoIpService {
            reader: Arc::clone(&self.reader),
        }
    }
}
