//! Core station model, source tags and coordinate predicates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "transit-core";

/// National bounding box every accepted coordinate must fall inside.
pub const MIN_LATITUDE: f64 = 33.0;
pub const MAX_LATITUDE: f64 = 43.0;
pub const MIN_LONGITUDE: f64 = 124.0;
pub const MAX_LONGITUDE: f64 = 132.0;

/// Two observations closer than this belong to the same physical station complex.
pub const TRANSFER_DISTANCE_METERS: f64 = 200.0;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// True when the pair is finite, non-zero and inside the national bounding box.
pub fn is_coordinate_valid(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && latitude != 0.0
        && longitude != 0.0
        && (MIN_LATITUDE..=MAX_LATITUDE).contains(&latitude)
        && (MIN_LONGITUDE..=MAX_LONGITUDE).contains(&longitude)
}

/// True when either half is missing or zero.
pub fn is_coordinate_empty(latitude: Option<f64>, longitude: Option<f64>) -> bool {
    match (latitude, longitude) {
        (Some(lat), Some(lon)) => lat == 0.0 || lon == 0.0,
        _ => true,
    }
}

/// Great-circle distance in meters.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Builds a coordinate only when both halves are present; validity is not checked.
    pub fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        Some(Self::new(latitude?, longitude?))
    }

    pub fn is_valid(&self) -> bool {
        is_coordinate_valid(self.latitude, self.longitude)
    }

    pub fn distance_meters(&self, other: &Coordinate) -> f64 {
        haversine_meters(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Origin of a station observation or coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceTag {
    NameRegistry,
    DetailRegistry,
    Geocoder,
    Manual,
    Calculated,
}

impl SourceTag {
    /// Static trust ranking used when coordinates disagree.
    pub fn priority(self) -> u32 {
        match self {
            SourceTag::DetailRegistry => 10,
            SourceTag::Manual => 9,
            SourceTag::Geocoder => 8,
            SourceTag::NameRegistry => 6,
            SourceTag::Calculated => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::NameRegistry => "NAME_REGISTRY",
            SourceTag::DetailRegistry => "DETAIL_REGISTRY",
            SourceTag::Geocoder => "GEOCODER",
            SourceTag::Manual => "MANUAL",
            SourceTag::Calculated => "CALCULATED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NAME_REGISTRY" => Some(SourceTag::NameRegistry),
            "DETAIL_REGISTRY" => Some(SourceTag::DetailRegistry),
            "GEOCODER" => Some(SourceTag::Geocoder),
            "MANUAL" => Some(SourceTag::Manual),
            "CALCULATED" => Some(SourceTag::Calculated),
            _ => None,
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate-limit class of an external source. Each class has its own request spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceClass {
    NameRegistry,
    DetailRegistry,
    Geocoder,
}

impl SourceClass {
    pub const ALL: [SourceClass; 3] = [
        SourceClass::NameRegistry,
        SourceClass::DetailRegistry,
        SourceClass::Geocoder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceClass::NameRegistry => "name_registry",
            SourceClass::DetailRegistry => "detail_registry",
            SourceClass::Geocoder => "geocoder",
        }
    }
}

impl fmt::Display for SourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view shared by raw observations and persisted rows.
pub trait StationInfo {
    fn station_name(&self) -> &str;
    fn line_label(&self) -> &str;
    fn coordinate(&self) -> Option<Coordinate>;
}

/// One record as a source client returned it, alive only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStationObservation {
    pub name: String,
    pub line_label: String,
    pub coordinate: Option<Coordinate>,
    pub address: Option<String>,
    pub source: SourceTag,
    pub source_station_id: Option<String>,
    pub region_hint: Option<String>,
    pub city_hint: Option<String>,
}

impl RawStationObservation {
    pub fn new(name: impl Into<String>, line_label: impl Into<String>, source: SourceTag) -> Self {
        Self {
            name: name.into(),
            line_label: line_label.into(),
            coordinate: None,
            address: None,
            source,
            source_station_id: None,
            region_hint: None,
            city_hint: None,
        }
    }

    pub fn with_coordinate(mut self, latitude: f64, longitude: f64) -> Self {
        self.coordinate = Some(Coordinate::new(latitude, longitude));
        self
    }

    pub fn with_region(mut self, region: impl Into<String>, city: Option<String>) -> Self {
        self.region_hint = Some(region.into());
        self.city_hint = city;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_station_id(mut self, id: impl Into<String>) -> Self {
        self.source_station_id = Some(id.into());
        self
    }

    pub fn candidate(&self) -> Option<CoordinateCandidate> {
        self.coordinate.map(|coordinate| CoordinateCandidate {
            coordinate,
            source: self.source,
        })
    }
}

impl StationInfo for RawStationObservation {
    fn station_name(&self) -> &str {
        &self.name
    }

    fn line_label(&self) -> &str {
        &self.line_label
    }

    fn coordinate(&self) -> Option<Coordinate> {
        self.coordinate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateCandidate {
    pub coordinate: Coordinate,
    pub source: SourceTag,
}

impl CoordinateCandidate {
    pub fn new(latitude: f64, longitude: f64, source: SourceTag) -> Self {
        Self {
            coordinate: Coordinate::new(latitude, longitude),
            source,
        }
    }

    pub fn priority(&self) -> u32 {
        self.source.priority()
    }
}

/// Deterministic naming derived from a raw name plus region/city hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardizedStation {
    /// Clean name, with suffixes and annotations stripped.
    pub original_name: String,
    pub canonical_name: String,
    pub display_name: String,
    pub region: String,
    pub city: Option<String>,
    pub is_duplicate_candidate: bool,
}

/// All observations sharing a canonical name within one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationGroup {
    pub canonical_name: String,
    pub standardized: StandardizedStation,
    members: Vec<RawStationObservation>,
    pub representative_coordinate: Option<Coordinate>,
    pub representative_source: Option<SourceTag>,
    pub coordinate_confidence: Option<u8>,
}

impl StationGroup {
    pub fn new(standardized: StandardizedStation, first: RawStationObservation) -> Self {
        Self {
            canonical_name: standardized.canonical_name.clone(),
            standardized,
            members: vec![first],
            representative_coordinate: None,
            representative_source: None,
            coordinate_confidence: None,
        }
    }

    pub fn push(&mut self, member: RawStationObservation) {
        self.members.push(member);
    }

    pub fn members(&self) -> &[RawStationObservation] {
        &self.members
    }

    /// Coordinates already carried by members, in arrival order.
    pub fn candidates(&self) -> Vec<CoordinateCandidate> {
        self.members.iter().filter_map(|m| m.candidate()).collect()
    }

    /// Distinct line labels in first-seen order.
    pub fn line_labels(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for member in &self.members {
            if !out.iter().any(|l| l == &member.line_label) {
                out.push(member.line_label.clone());
            }
        }
        out
    }

    /// First non-empty address among members on the given line, then on any line.
    pub fn address_for_line(&self, line: &str) -> Option<String> {
        let on_line = self
            .members
            .iter()
            .filter(|m| m.line_label == line)
            .find_map(|m| m.address.clone().filter(|a| !a.trim().is_empty()));
        on_line.or_else(|| {
            self.members
                .iter()
                .find_map(|m| m.address.clone().filter(|a| !a.trim().is_empty()))
        })
    }

    pub fn set_representative(&mut self, coordinate: Coordinate, source: SourceTag, confidence: u8) {
        self.representative_coordinate = Some(coordinate);
        self.representative_source = Some(source);
        self.coordinate_confidence = Some(confidence);
    }

    pub fn has_representative(&self) -> bool {
        self.representative_coordinate.is_some()
    }
}

/// Row shape handed to a store for insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStation {
    pub name: String,
    pub line_label: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub data_source: SourceTag,
}

impl NewStation {
    pub fn has_coordinates(&self) -> bool {
        has_valid_coordinates(self.latitude, self.longitude)
    }
}

/// Station row as the store owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStation {
    pub id: i64,
    pub name: String,
    pub line_label: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub data_source: SourceTag,
    pub has_coordinates: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn has_valid_coordinates(latitude: Option<f64>, longitude: Option<f64>) -> bool {
    match (latitude, longitude) {
        (Some(lat), Some(lon)) => is_coordinate_valid(lat, lon),
        _ => false,
    }
}

impl PersistedStation {
    pub fn from_new(id: i64, station: NewStation, now: DateTime<Utc>) -> Self {
        let has_coordinates = station.has_coordinates();
        Self {
            id,
            name: station.name,
            line_label: station.line_label,
            latitude: station.latitude,
            longitude: station.longitude,
            address: station.address,
            region: station.region,
            city: station.city,
            data_source: station.data_source,
            has_coordinates,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn refresh_has_coordinates(&mut self) {
        self.has_coordinates = has_valid_coordinates(self.latitude, self.longitude);
    }

    /// Fills fields that are still empty from `incoming`; existing values win.
    /// Returns whether anything changed.
    pub fn fill_missing_from(&mut self, incoming: &NewStation) -> bool {
        let mut changed = false;
        if !self.has_coordinates && incoming.has_coordinates() {
            self.latitude = incoming.latitude;
            self.longitude = incoming.longitude;
            changed = true;
        }
        if self.address.is_none() && incoming.address.is_some() {
            self.address = incoming.address.clone();
            changed = true;
        }
        if self.region.is_none() && incoming.region.is_some() {
            self.region = incoming.region.clone();
            changed = true;
        }
        if self.city.is_none() && incoming.city.is_some() {
            self.city = incoming.city.clone();
            changed = true;
        }
        if changed {
            self.refresh_has_coordinates();
        }
        changed
    }
}

impl StationInfo for PersistedStation {
    fn station_name(&self) -> &str {
        &self.name
    }

    fn line_label(&self) -> &str {
        &self.line_label
    }

    fn coordinate(&self) -> Option<Coordinate> {
        Coordinate::from_parts(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoordinateStatistics {
    pub total: usize,
    pub with_coordinates: usize,
    pub missing_coordinates: usize,
}

impl CoordinateStatistics {
    pub fn collect<'a, I, S>(stations: I) -> Self
    where
        I: IntoIterator<Item = &'a S>,
        S: StationInfo + 'a,
    {
        let mut total = 0;
        let mut with_coordinates = 0;
        for station in stations {
            total += 1;
            if station.coordinate().is_some_and(|c| c.is_valid()) {
                with_coordinates += 1;
            }
        }
        Self {
            total,
            with_coordinates,
            missing_coordinates: total - with_coordinates,
        }
    }

    pub fn completion_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.with_coordinates as f64 / self.total as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_rejects_zero_nan_and_out_of_box() {
        assert!(is_coordinate_valid(37.5665, 126.9780));
        assert!(is_coordinate_valid(36.3504, 127.3845));
        assert!(!is_coordinate_valid(0.0, 0.0));
        assert!(!is_coordinate_valid(f64::NAN, 127.0));
        assert!(!is_coordinate_valid(37.0, f64::INFINITY));
        assert!(!is_coordinate_valid(51.5, -0.12));
        assert!(!is_coordinate_valid(37.5, 0.0));
    }

    #[test]
    fn emptiness_treats_missing_and_zero_alike() {
        assert!(is_coordinate_empty(None, Some(127.0)));
        assert!(is_coordinate_empty(Some(0.0), Some(127.0)));
        assert!(!is_coordinate_empty(Some(37.5), Some(127.0)));
    }

    #[test]
    fn haversine_is_symmetric_and_plausible() {
        let seoul_city_hall = Coordinate::new(37.5657, 126.9769);
        let daejeon_city_hall = Coordinate::new(36.3504, 127.3845);
        let there = seoul_city_hall.distance_meters(&daejeon_city_hall);
        let back = daejeon_city_hall.distance_meters(&seoul_city_hall);
        assert!((there - back).abs() < 1e-6);
        assert!(there > 130_000.0 && there < 150_000.0);
    }

    #[test]
    fn source_priority_order_matches_trust_table() {
        let mut tags = vec![
            SourceTag::Calculated,
            SourceTag::NameRegistry,
            SourceTag::Geocoder,
            SourceTag::Manual,
            SourceTag::DetailRegistry,
        ];
        tags.sort_by_key(|t| std::cmp::Reverse(t.priority()));
        assert_eq!(
            tags,
            vec![
                SourceTag::DetailRegistry,
                SourceTag::Manual,
                SourceTag::Geocoder,
                SourceTag::NameRegistry,
                SourceTag::Calculated,
            ]
        );
        assert_eq!(serde_json::to_string(&SourceTag::Geocoder).unwrap(), "\"GEOCODER\"");
        assert_eq!(SourceTag::parse("detail_registry"), Some(SourceTag::DetailRegistry));
    }

    #[test]
    fn merge_only_fills_empty_fields() {
        let now = Utc::now();
        let mut existing = PersistedStation::from_new(
            1,
            NewStation {
                name: "Gongdeok".into(),
                line_label: "5".into(),
                latitude: None,
                longitude: None,
                address: Some("Original address".into()),
                region: None,
                city: None,
                data_source: SourceTag::NameRegistry,
            },
            now,
        );
        let incoming = NewStation {
            name: "Gongdeok".into(),
            line_label: "5".into(),
            latitude: Some(37.5443),
            longitude: Some(126.9515),
            address: Some("Replacement address".into()),
            region: Some("Seoul Special City".into()),
            city: Some("Mapo-gu".into()),
            data_source: SourceTag::DetailRegistry,
        };
        assert!(existing.fill_missing_from(&incoming));
        assert_eq!(existing.address.as_deref(), Some("Original address"));
        assert_eq!(existing.region.as_deref(), Some("Seoul Special City"));
        assert!(existing.has_coordinates);
        assert!(!existing.fill_missing_from(&incoming));
    }

    #[test]
    fn group_tracks_lines_and_candidates() {
        let standardized = StandardizedStation {
            original_name: "Wangsimni".into(),
            canonical_name: "Wangsimni".into(),
            display_name: "Wangsimni".into(),
            region: "Seoul Special City".into(),
            city: None,
            is_duplicate_candidate: false,
        };
        let mut group = StationGroup::new(
            standardized,
            RawStationObservation::new("Wangsimni", "2", SourceTag::DetailRegistry)
                .with_coordinate(37.5612, 127.0371),
        );
        group.push(RawStationObservation::new("Wangsimni", "5", SourceTag::NameRegistry));
        group.push(
            RawStationObservation::new("Wangsimni", "2", SourceTag::DetailRegistry)
                .with_address("Haengdang-dong"),
        );
        assert_eq!(group.line_labels(), vec!["2".to_string(), "5".to_string()]);
        assert_eq!(group.candidates().len(), 1);
        assert_eq!(group.address_for_line("5").as_deref(), Some("Haengdang-dong"));
    }
}
