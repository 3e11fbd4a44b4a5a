//! Geo-anomaly detection
//!
//! Compares each login's geolocation against the user's last known sample.
//! Travel implying a physically implausible velocity flags impossible
//! travel; a first-ever login from a configured high-risk region flags on
//! its own. Private and loopback sources are exempt — office VPNs and local
//! development would otherwise drown the signal in false positives.
//!
//! Location history is process-local here; the storage layer owns the
//! durable per-user history and can back the same interface.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::GeoConfig;

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A resolved login location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocationSample {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Region code (ISO country or provider region string).
    pub region: String,
    /// When the login happened.
    pub timestamp: DateTime<Utc>,
}

/// Why a login was flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "anomaly")]
pub enum AnomalyKind {
    /// Distance over elapsed time implies impossible velocity.
    ImpossibleTravel {
        /// Great-circle distance from the previous sample.
        distance_km: f64,
        /// Minutes since the previous sample.
        elapsed_minutes: f64,
        /// Implied speed.
        speed_kmh: f64,
    },
    /// First-ever login, from a configured high-risk region.
    HighRiskRegion {
        /// The region that matched.
        region: String,
    },
}

/// A computed geo-anomaly verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyFinding {
    /// The user whose login was flagged.
    pub user: String,
    /// What kind of anomaly.
    pub kind: AnomalyKind,
    /// The sample that triggered the finding.
    pub sample: GeoLocationSample,
}

/// IP-to-location resolver. The GeoIP database is a collaborator;
/// [`StaticGeoResolver`] ships for development and tests.
pub trait GeoResolver: Send + Sync {
    /// Locate an address, if known.
    fn locate(&self, ip: IpAddr) -> Option<GeoLocationSample>;
}

/// Table-backed resolver for development and tests.
pub struct StaticGeoResolver {
    table: HashMap<IpAddr, (f64, f64, String)>,
}

impl StaticGeoResolver {
    /// Empty table.
    pub fn new() -> Self {
        Self { table: HashMap::new() }
    }

    /// Map an address to a location.
    pub fn insert(&mut self, ip: IpAddr, latitude: f64, longitude: f64, region: &str) {
        self.table.insert(ip, (latitude, longitude, region.to_string()));
    }
}

impl Default for StaticGeoResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoResolver for StaticGeoResolver {
    fn locate(&self, ip: IpAddr) -> Option<GeoLocationSample> {
        self.table.get(&ip).map(|(lat, lon, region)| GeoLocationSample {
            latitude: *lat,
            longitude: *lon,
            region: region.clone(),
            timestamp: Utc::now(),
        })
    }
}

/// Resolver that knows nothing — geo detection degrades to a no-op when no
/// GeoIP collaborator is configured.
pub struct NullGeoResolver;

impl GeoResolver for NullGeoResolver {
    fn locate(&self, _ip: IpAddr) -> Option<GeoLocationSample> {
        None
    }
}

/// Great-circle distance between two coordinates (haversine).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Impossible-travel and high-risk-region detector.
pub struct GeoAnomalyDetector {
    config: GeoConfig,
    resolver: std::sync::Arc<dyn GeoResolver>,
    high_risk_regions: Vec<String>,
    history: RwLock<HashMap<String, GeoLocationSample>>,
}

impl GeoAnomalyDetector {
    /// Detector over a resolver and the configured high-risk region list.
    pub fn new(
        config: GeoConfig,
        resolver: std::sync::Arc<dyn GeoResolver>,
        high_risk_regions: Vec<String>,
    ) -> Self {
        Self {
            config,
            resolver,
            high_risk_regions: high_risk_regions
                .into_iter()
                .map(|r| r.to_uppercase())
                .collect(),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Observe a login and return a finding when it looks anomalous. The
    /// sample becomes the user's new last-known location either way.
    pub async fn observe_login(
        &self,
        user: &str,
        ip: IpAddr,
        at: DateTime<Utc>,
    ) -> Option<AnomalyFinding> {
        if !crate::request_guard::is_public_ip(&ip) {
            return None;
        }

        let mut sample = self.resolver.locate(ip)?;
        sample.timestamp = at;

        let previous = {
            let mut history = self.history.write().await;
            history.insert(user.to_string(), sample.clone())
        };

        match previous {
            Some(previous) => self.check_travel(user, &previous, &sample),
            None => self.check_first_login(user, &sample),
        }
    }

    fn check_travel(
        &self,
        user: &str,
        previous: &GeoLocationSample,
        sample: &GeoLocationSample,
    ) -> Option<AnomalyFinding> {
        let distance_km = haversine_km(
            previous.latitude,
            previous.longitude,
            sample.latitude,
            sample.longitude,
        );
        if distance_km < self.config.min_distance_km {
            return None;
        }

        let elapsed = (sample.timestamp - previous.timestamp).num_seconds().max(1) as f64;
        let speed_kmh = distance_km / (elapsed / 3600.0);

        if speed_kmh <= self.config.max_speed_kmh {
            return None;
        }

        Some(AnomalyFinding {
            user: user.to_string(),
            kind: AnomalyKind::ImpossibleTravel {
                distance_km,
                elapsed_minutes: elapsed / 60.0,
                speed_kmh,
            },
            sample: sample.clone(),
        })
    }

    fn check_first_login(&self, user: &str, sample: &GeoLocationSample) -> Option<AnomalyFinding> {
        let region = sample.region.to_uppercase();
        if !self.high_risk_regions.contains(&region) {
            return None;
        }

        Some(AnomalyFinding {
            user: user.to_string(),
            kind: AnomalyKind::HighRiskRegion { region },
            sample: sample.clone(),
        })
    }

    /// Last known sample for a user.
    pub async fn last_sample(&self, user: &str) -> Option<GeoLocationSample> {
        self.history.read().await.get(user).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    const LONDON: (f64, f64) = (51.5074, -0.1278);
    const NEW_YORK: (f64, f64) = (40.7128, -74.0060);
    const LONDON_SUBURB: (f64, f64) = (51.5250, -0.1340);

    fn resolver() -> StaticGeoResolver {
        let mut resolver = StaticGeoResolver::new();
        resolver.insert("81.2.69.142".parse().unwrap(), LONDON.0, LONDON.1, "GB");
        resolver.insert("72.229.28.185".parse().unwrap(), NEW_YORK.0, NEW_YORK.1, "US");
        resolver.insert("81.2.69.200".parse().unwrap(), LONDON_SUBURB.0, LONDON_SUBURB.1, "GB");
        resolver.insert("203.0.113.77".parse().unwrap(), 35.6762, 139.6503, "JP");
        resolver
    }

    fn detector(high_risk: Vec<String>) -> GeoAnomalyDetector {
        GeoAnomalyDetector::new(GeoConfig::default(), Arc::new(resolver()), high_risk)
    }

    #[test]
    fn test_haversine_known_distances() {
        let london_ny = haversine_km(LONDON.0, LONDON.1, NEW_YORK.0, NEW_YORK.1);
        assert!((5500.0..5650.0).contains(&london_ny), "got {}", london_ny);

        let zero = haversine_km(LONDON.0, LONDON.1, LONDON.0, LONDON.1);
        assert!(zero < 0.001);
    }

    #[tokio::test]
    async fn test_impossible_travel_is_flagged() {
        let detector = detector(Vec::new());
        let start = Utc::now();

        assert!(detector
            .observe_login("ada", "81.2.69.142".parse().unwrap(), start)
            .await
            .is_none());

        // Across the Atlantic ten minutes later.
        let finding = detector
            .observe_login("ada", "72.229.28.185".parse().unwrap(), start + Duration::minutes(10))
            .await
            .expect("should flag impossible travel");

        match finding.kind {
            AnomalyKind::ImpossibleTravel { distance_km, speed_kmh, .. } => {
                assert!(distance_km > 4000.0);
                assert!(speed_kmh > GeoConfig::default().max_speed_kmh);
            }
            other => panic!("unexpected finding: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_hop_is_not_flagged() {
        let detector = detector(Vec::new());
        let start = Utc::now();

        detector.observe_login("ada", "81.2.69.142".parse().unwrap(), start).await;
        let finding = detector
            .observe_login("ada", "81.2.69.200".parse().unwrap(), start + Duration::minutes(10))
            .await;
        assert!(finding.is_none());
    }

    #[tokio::test]
    async fn test_plausible_long_travel_is_not_flagged() {
        let detector = detector(Vec::new());
        let start = Utc::now();

        detector.observe_login("ada", "81.2.69.142".parse().unwrap(), start).await;
        // Same route with a realistic flight time.
        let finding = detector
            .observe_login("ada", "72.229.28.185".parse().unwrap(), start + Duration::hours(9))
            .await;
        assert!(finding.is_none());
    }

    #[tokio::test]
    async fn test_first_login_from_high_risk_region() {
        let detector = detector(vec!["jp".to_string()]);

        let finding = detector
            .observe_login("grace", "203.0.113.77".parse().unwrap(), Utc::now())
            .await
            .expect("should flag high-risk first login");
        assert_eq!(finding.kind, AnomalyKind::HighRiskRegion { region: "JP".to_string() });
    }

    #[tokio::test]
    async fn test_private_sources_are_exempt() {
        let detector = detector(vec!["JP".to_string()]);

        assert!(detector
            .observe_login("ada", "192.168.1.50".parse().unwrap(), Utc::now())
            .await
            .is_none());
        assert!(detector.last_sample("ada").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_ip_degrades_to_noop() {
        let detector = detector(Vec::new());
        assert!(detector
            .observe_login("ada", "8.8.8.8".parse().unwrap(), Utc::now())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_history_tracks_latest_sample() {
        let detector = detector(Vec::new());
        let start = Utc::now();

        detector.observe_login("ada", "81.2.69.142".parse().unwrap(), start).await;
        detector
            .observe_login("ada", "72.229.28.185".parse().unwrap(), start + Duration::hours(9))
            .await;

        let last = detector.last_sample("ada").await.unwrap();
        assert_eq!(last.region, "US");
    }
}
