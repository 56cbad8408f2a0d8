use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use dashmap::DashMap;
use log::warn;
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;
const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolved location for a source IP. `latitude`/`longitude` may be absent
/// when the upstream source knows the country but not the coordinates;
/// rules that need coordinates abstain in that case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub city: Option<String>,
    pub country_name: Option<String>,
}

/// Maps an IPv4 address to a location. Implementations must never block
/// longer than their own configured timeout and must never fail loudly:
/// an unknown location is `None`.
pub trait LocationResolver: Send + Sync {
    fn get_location(&self, ip: &str) -> Option<GeoInfo>;
}

/// Production resolver: private ranges short-circuit to `None`, then the
/// local GeoIP database (when configured), then one HTTP GET against
/// ip-api.com with a hard 2-second timeout. Successful network lookups are
/// cached for the process lifetime.
pub struct GeoLocator {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
    http: reqwest::blocking::Client,
    cache: DashMap<String, GeoInfo>,
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    city: Option<String>,
    country: Option<String>,
}

impl GeoLocator {
    /// Must be called outside the async runtime (the blocking HTTP client
    /// owns its own worker thread).
    pub fn new(maxmind_db_path: Option<&str>) -> Result<GeoLocator, reqwest::Error> {
        let reader = maxmind_db_path.and_then(|path| {
            match maxminddb::Reader::open_readfile(path) {
                Ok(reader) => Some(reader),
                Err(e) => {
                    warn!("could not open GeoIP database {}: {}", path, e);
                    None
                }
            }
        });

        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;

        Ok(GeoLocator {
            reader,
            http,
            cache: DashMap::new(),
        })
    }

    fn lookup_database(&self, ip: IpAddr) -> Option<GeoInfo> {
        let reader = self.reader.as_ref()?;
        let city: maxminddb::geoip2::City = reader.lookup(ip).ok()?;
        let english = |names: &std::collections::BTreeMap<&str, &str>| {
            names.get("en").map(|n| n.to_string())
        };
        Some(GeoInfo {
            country_code: city
                .country
                .as_ref()
                .and_then(|c| c.iso_code)
                .map(str::to_string),
            latitude: city.location.as_ref().and_then(|l| l.latitude),
            longitude: city.location.as_ref().and_then(|l| l.longitude),
            city: city
                .city
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(english),
            country_name: city
                .country
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(english),
        })
    }

    fn lookup_http(&self, ip: &str) -> Option<GeoInfo> {
        let url = format!("http://ip-api.com/json/{}", ip);
        let response = self.http.get(&url).send().ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: IpApiResponse = response.json().ok()?;
        if body.status != "success" {
            return None;
        }
        Some(GeoInfo {
            country_code: body.country_code,
            latitude: body.lat,
            longitude: body.lon,
            city: body.city,
            country_name: body.country,
        })
    }
}

impl LocationResolver for GeoLocator {
    fn get_location(&self, ip: &str) -> Option<GeoInfo> {
        // Internal traffic carries no useful geolocation; skip any lookup.
        if is_private_ip(ip) {
            return None;
        }

        let addr: IpAddr = ip.parse().ok()?;

        if let Some(info) = self.lookup_database(addr) {
            return Some(info);
        }

        if let Some(cached) = self.cache.get(ip) {
            return Some(cached.value().clone());
        }

        let info = self.lookup_http(ip)?;
        self.cache.insert(ip.to_string(), info.clone());
        Some(info)
    }
}

/// Fixed-table resolver. Used by the test suites and usable for air-gapped
/// deployments where every watched egress IP is known ahead of time.
#[derive(Debug, Default)]
pub struct StaticResolver {
    table: HashMap<String, GeoInfo>,
}

impl StaticResolver {
    pub fn new(table: HashMap<String, GeoInfo>) -> Self {
        StaticResolver { table }
    }
}

impl LocationResolver for StaticResolver {
    fn get_location(&self, ip: &str) -> Option<GeoInfo> {
        if is_private_ip(ip) {
            return None;
        }
        self.table.get(ip).cloned()
    }
}

/// True for 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16 and 127.0.0.0/8.
/// Anything that does not parse as IPv4 is treated as non-private.
pub fn is_private_ip(ip: &str) -> bool {
    let Ok(addr) = ip.parse::<Ipv4Addr>() else {
        return false;
    };
    let [a, b, _, _] = addr.octets();
    a == 10 || a == 127 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
}

/// Great-circle distance between two coordinates in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // New York to Los Angeles: ~3944 km
        let d = haversine_km(40.7128, -74.0060, 34.0522, -118.2437);
        assert!((d - 3944.0).abs() < 50.0, "NYC to LA should be ~3944 km, got {}", d);
    }

    #[test]
    fn haversine_is_symmetric() {
        let d1 = haversine_km(37.77, -122.42, 35.68, 139.69);
        let d2 = haversine_km(35.68, 139.69, 37.77, -122.42);
        assert!((d1 - d2).abs() < 1e-6);
    }

    #[test]
    fn haversine_zero_for_same_point() {
        assert_eq!(haversine_km(51.5074, -0.1278, 51.5074, -0.1278), 0.0);
    }

    #[test]
    fn private_ranges_are_detected() {
        assert!(is_private_ip("10.1.2.3"));
        assert!(is_private_ip("127.0.0.1"));
        assert!(is_private_ip("172.16.0.1"));
        assert!(is_private_ip("172.31.255.254"));
        assert!(is_private_ip("192.168.1.1"));

        assert!(!is_private_ip("172.15.0.1"));
        assert!(!is_private_ip("172.32.0.1"));
        assert!(!is_private_ip("8.8.8.8"));
        assert!(!is_private_ip("not-an-ip"));
    }

    #[test]
    fn static_resolver_short_circuits_private_ips() {
        // Even with a table entry, a private IP must resolve to None
        // without any lookup.
        let mut table = HashMap::new();
        table.insert(
            "10.0.0.5".to_string(),
            GeoInfo { latitude: Some(1.0), longitude: Some(2.0), ..GeoInfo::default() },
        );
        let resolver = StaticResolver::new(table);
        assert!(resolver.get_location("10.0.0.5").is_none());
    }
}
