//! Station name cleaning, duplicate-name classes and region inference.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use transit_core::{haversine_meters, StandardizedStation, StationInfo, TRANSFER_DISTANCE_METERS};

pub const UNCLASSIFIED_REGION: &str = "Unclassified";

/// Names known to exist in more than one city.
pub const DEFAULT_DUPLICATE_NAMES: &[&str] = &[
    "City Hall",
    "Stadium",
    "Sports Complex",
    "Sinchon",
    "시청",
    "운동장앞",
    "공덕",
    "신설동",
    "왕십리",
    "신도림",
    "사당",
    "교대",
    "강남",
    "잠실",
    "건대입구",
    "홍대입구",
    "신촌",
    "이대",
    "용산",
    "서울",
    "영등포",
    "구로",
    "금천구청",
    "석계",
    "태릉입구",
];

#[derive(Debug, Clone, Copy)]
pub struct Province {
    pub keywords: &'static [&'static str],
    pub full_name: &'static str,
    pub short_label: &'static str,
}

pub const PROVINCES: &[Province] = &[
    Province {
        keywords: &["seoul", "서울"],
        full_name: "Seoul Special City",
        short_label: "Seoul",
    },
    Province {
        keywords: &["gyeonggi", "경기"],
        full_name: "Gyeonggi Province",
        short_label: "Gyeonggi",
    },
    Province {
        keywords: &["incheon", "인천"],
        full_name: "Incheon Metropolitan City",
        short_label: "Incheon",
    },
    Province {
        keywords: &["daejeon", "대전"],
        full_name: "Daejeon Metropolitan City",
        short_label: "Daejeon",
    },
    Province {
        keywords: &["daegu", "대구"],
        full_name: "Daegu Metropolitan City",
        short_label: "Daegu",
    },
    Province {
        keywords: &["busan", "부산"],
        full_name: "Busan Metropolitan City",
        short_label: "Busan",
    },
    Province {
        keywords: &["gwangju", "광주"],
        full_name: "Gwangju Metropolitan City",
        short_label: "Gwangju",
    },
    Province {
        keywords: &["ulsan", "울산"],
        full_name: "Ulsan Metropolitan City",
        short_label: "Ulsan",
    },
];

const GYEONGGI: &str = "Gyeonggi Province";

const GYEONGGI_CITIES: &[&str] = &[
    "suwon", "seongnam", "anyang", "bucheon", "goyang", "yongin", "수원", "성남", "안양", "부천",
    "고양", "용인",
];

fn province_by_keyword(text: &str) -> Option<&'static Province> {
    let lowered = text.to_lowercase();
    PROVINCES
        .iter()
        .find(|p| p.keywords.iter().any(|k| lowered.contains(k)))
}

fn province_by_full_name(name: &str) -> Option<&'static Province> {
    PROVINCES.iter().find(|p| p.full_name == name)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Maps a region hint onto the province table, or infers one from the city.
pub fn resolve_region(region: Option<&str>, city: Option<&str>) -> String {
    if let Some(region) = non_blank(region) {
        return province_by_keyword(region)
            .map(|p| p.full_name.to_string())
            .unwrap_or_else(|| region.to_string());
    }
    match non_blank(city) {
        Some(city) => infer_region_from_city(city),
        None => UNCLASSIFIED_REGION.to_string(),
    }
}

fn infer_region_from_city(city: &str) -> String {
    if let Some(province) = province_by_keyword(city) {
        return province.full_name.to_string();
    }
    let lowered = city.to_lowercase();
    let is_district = (city.contains('구') && !city.contains('시'))
        || ((lowered.ends_with("-gu") || lowered.ends_with(" gu")) && !lowered.contains("-si"));
    if is_district {
        return "Seoul Special City".to_string();
    }
    if GYEONGGI_CITIES.iter().any(|c| lowered.contains(c)) {
        return GYEONGGI.to_string();
    }
    UNCLASSIFIED_REGION.to_string()
}

/// Suffix appended to duplicate-class names so same-named stations in
/// different regions get distinct canonical names.
pub fn region_suffix(resolved_region: &str, city: Option<&str>) -> String {
    match province_by_full_name(resolved_region) {
        Some(p) if p.full_name == GYEONGGI => non_blank(city).unwrap_or(p.short_label).to_string(),
        Some(p) => p.short_label.to_string(),
        None => resolved_region.to_string(),
    }
}

/// True iff the two points are within transfer distance of each other.
pub fn is_same_station_group(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> bool {
    haversine_meters(lat1, lon1, lat2, lon2) <= TRANSFER_DISTANCE_METERS
}

#[derive(Debug, Default, Deserialize)]
struct StationNameRulesFile {
    #[serde(default)]
    duplicate_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NameResolver {
    duplicate_names: BTreeSet<String>,
    parenthetical: Regex,
    line_marker: Regex,
    korean_line_marker: Regex,
    whitespace: Regex,
    station_suffix: Regex,
    line_number: Regex,
}

impl NameResolver {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            duplicate_names: DEFAULT_DUPLICATE_NAMES
                .iter()
                .map(|n| n.to_lowercase())
                .collect(),
            parenthetical: Regex::new(r"\([^)]*\)")?,
            line_marker: Regex::new(r"(?i)\bline\s*\d+\b")?,
            korean_line_marker: Regex::new(r"\d+\s*호선")?,
            whitespace: Regex::new(r"\s+")?,
            station_suffix: Regex::new(r"(?i)\s+station$")?,
            line_number: Regex::new(r"(?i)(?:line\s*(\d+))|(?:(\d+)\s*호선)")?,
        })
    }

    /// Default resolver extended with `rules/station_names.yaml` when present.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let resolver = Self::new().context("compiling station name patterns")?;
        let path = root.join("rules").join("station_names.yaml");
        if !path.exists() {
            return Ok(resolver);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let rules: StationNameRulesFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(resolver.with_duplicate_names(rules.duplicate_names))
    }

    /// Adds names to the duplicate-class set, cleaned the same way station
    /// names are. Defaults are never removed.
    pub fn with_duplicate_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let clean = self.clean_name(name.as_ref());
            if !clean.is_empty() {
                self.duplicate_names.insert(clean.to_lowercase());
            }
        }
        self
    }

    pub fn clean_name(&self, raw: &str) -> String {
        let without_parens = self.parenthetical.replace_all(raw, " ");
        let without_lines = self.line_marker.replace_all(&without_parens, " ");
        let without_lines = self.korean_line_marker.replace_all(&without_lines, " ");
        let collapsed = self.whitespace.replace_all(&without_lines, " ");
        let trimmed = collapsed.trim();

        let stripped = if self.station_suffix.is_match(trimmed) {
            self.station_suffix.replace(trimmed, "").into_owned()
        } else if let Some(base) = trimmed.strip_suffix('역').filter(|b| !b.trim().is_empty()) {
            base.to_string()
        } else {
            trimmed.to_string()
        };
        stripped.trim().to_string()
    }

    pub fn is_duplicate_candidate(&self, clean_name: &str) -> bool {
        self.duplicate_names.contains(&clean_name.trim().to_lowercase())
    }

    pub fn standardize(
        &self,
        raw_name: &str,
        region: Option<&str>,
        city: Option<&str>,
    ) -> StandardizedStation {
        let clean = self.clean_name(raw_name);
        let resolved_region = resolve_region(region, city);
        let city = non_blank(city).map(str::to_string);
        let is_duplicate_candidate = self.is_duplicate_candidate(&clean);

        let (canonical_name, display_name) = if is_duplicate_candidate {
            let suffix = region_suffix(&resolved_region, city.as_deref());
            (format!("{clean}({suffix})"), format!("{clean} ({suffix})"))
        } else {
            (clean.clone(), clean.clone())
        };

        StandardizedStation {
            original_name: clean,
            canonical_name,
            display_name,
            region: resolved_region,
            city,
            is_duplicate_candidate,
        }
    }

    /// Partitions stations by clean name, in name order.
    pub fn group_stations_by_name<'a, S: StationInfo>(
        &self,
        items: &'a [S],
    ) -> BTreeMap<String, Vec<&'a S>> {
        let mut groups: BTreeMap<String, Vec<&'a S>> = BTreeMap::new();
        for item in items {
            groups
                .entry(self.clean_name(item.station_name()))
                .or_default()
                .push(item);
        }
        groups
    }

    /// "Line 2", "Seoul 2호선", "02" and "2" all become "2". Named lines are
    /// only trimmed.
    pub fn normalize_line_label(&self, route: &str) -> String {
        let trimmed = route.trim();
        let digits = self
            .line_number
            .captures(trimmed)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
            .map(|m| m.as_str())
            .or_else(|| trimmed.chars().all(|c| c.is_ascii_digit()).then_some(trimmed))
            .filter(|d| !d.is_empty());

        match digits.and_then(|d| d.parse::<u32>().ok()) {
            Some(n) => n.to_string(),
            None => trimmed.to_string(),
        }
    }
}
