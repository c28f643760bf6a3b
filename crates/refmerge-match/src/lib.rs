//! Name normalization, similarity scoring and the duplicate-detection cascade.

use std::collections::HashMap;
use std::fmt;

use refmerge_core::{CoordinateError, Coordinates, Entity};
use serde::{Deserialize, Serialize};
use strsim::levenshtein;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "refmerge-match";

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Whole-word tokens that carry no identity: association types, sport codes, gender/code
/// qualifiers and a few stopwords.
pub const NOISE_TOKENS: &[&str] = &[
    // association
    "club", "clubs", "association", "assoc", "assn", "society", "soc", "team", "cumann", "clg",
    "cl", "fc", "cf", "sc", "ac", "inc", "ltd",
    // sport
    "gaa", "gaelic", "gfc", "football", "hurling", "hc", "camogie", "handball", "athletic",
    "athletics", "sports", "sport",
    // gender / code
    "ladies", "lgfa", "mens", "men", "womens", "women", "boys", "girls", "juvenile", "minor",
    "senior", "junior",
    // stopwords
    "the", "of", "and",
];

/// Canonical comparison form of a free-text entity name. Total, deterministic, idempotent.
pub fn normalize(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut cleaned = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c.is_alphanumeric() {
            cleaned.push(c);
        } else if matches!(c, '\'' | '\u{2019}' | '.') {
            // "St. Pat's" and "St Pats" compare equal
        } else {
            cleaned.push(' ');
        }
    }
    cleaned
        .split_whitespace()
        .filter(|token| !NOISE_TOKENS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `1 - levenshtein / max(len)`, over chars, in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    let distance = levenshtein(a, b);
    (1.0 - distance as f64 / longest as f64).clamp(0.0, 1.0)
}

pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.clamp(0.0, 1.0).sqrt().asin()
}

/// Undefined (`None`) when either side has no coordinates.
pub fn distance_km(a: Option<Coordinates>, b: Option<Coordinates>) -> Option<f64> {
    Some(haversine_km(a?, b?))
}

/// The view of a record the detector compares.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchProfile {
    pub id: Uuid,
    pub name: String,
    pub normalized: String,
    /// Declared county/province/country token of a candidate.
    pub locality: Option<String>,
    /// Free-text location of an existing record.
    pub location: Option<String>,
    pub coordinates: Option<Coordinates>,
    /// Shared scope (parent id, country) required before fuzzy matching.
    pub context: Option<String>,
}

impl MatchProfile {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            normalized: normalize(&name),
            name,
            locality: None,
            location: None,
            coordinates: None,
            context: None,
        }
    }

    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_coordinates(mut self, coordinates: Coordinates) -> Self {
        self.coordinates = Some(coordinates);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn from_entity(entity: &Entity) -> Self {
        match entity {
            Entity::InternationalUnit(unit) => Self::new(unit.id, &unit.name),
            Entity::Country(country) => Self::new(country.id, &country.name)
                .with_context(country.international_unit_id.to_string()),
            Entity::Region(region) => {
                Self::new(region.id, &region.name).with_context(region.country_id.to_string())
            }
            Entity::Club(club) => {
                let location = [&club.location, &club.region, &club.sub_region]
                    .into_iter()
                    .flatten()
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut profile = Self::new(club.id, &club.name);
                profile.locality = club.region.clone();
                profile.location = (!location.is_empty()).then_some(location);
                profile.coordinates = club.coordinates();
                profile.context = club.country_id.map(|id| id.to_string());
                profile
            }
        }
    }

    fn context_key(&self) -> Option<String> {
        self.context
            .as_deref()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    Exact,
    NormalizedLocality,
    Geographic,
    Fuzzy,
}

impl MatchRule {
    /// Cheaper, safer rules first.
    pub const CASCADE: [MatchRule; 4] = [
        MatchRule::Exact,
        MatchRule::NormalizedLocality,
        MatchRule::Geographic,
        MatchRule::Fuzzy,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum MatchReason {
    Exact,
    NormalizedLocality { locality: String },
    Geographic { distance_km: f64 },
    Fuzzy { similarity: f64 },
}

impl MatchReason {
    pub fn rule(&self) -> MatchRule {
        match self {
            MatchReason::Exact => MatchRule::Exact,
            MatchReason::NormalizedLocality { .. } => MatchRule::NormalizedLocality,
            MatchReason::Geographic { .. } => MatchRule::Geographic,
            MatchReason::Fuzzy { .. } => MatchRule::Fuzzy,
        }
    }
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchReason::Exact => f.write_str("Exact name match"),
            MatchReason::NormalizedLocality { locality } => {
                write!(f, "Normalized name match in {locality}")
            }
            MatchReason::Geographic { distance_km } => {
                write!(f, "Coordinates match ({distance_km:.3} km apart)")
            }
            MatchReason::Fuzzy { similarity } => {
                write!(f, "Fuzzy name match (similarity {similarity:.2})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_proximity_km")]
    pub proximity_km: f64,
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
}

fn default_proximity_km() -> f64 {
    0.5
}

fn default_fuzzy_threshold() -> f64 {
    0.8
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            proximity_km: default_proximity_km(),
            fuzzy_threshold: default_fuzzy_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMatch<'a> {
    pub index: usize,
    pub existing: &'a MatchProfile,
    pub reason: MatchReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterMember {
    pub id: Uuid,
    pub name: String,
    /// `None` for the record that opened the cluster.
    pub reason: Option<MatchReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateCluster {
    pub members: Vec<ClusterMember>,
}

impl DuplicateCluster {
    pub fn is_duplicate(&self) -> bool {
        self.members.len() > 1
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.members.iter().map(|m| m.id).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateDetector {
    config: DetectorConfig,
}

impl DuplicateDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> DetectorConfig {
        self.config
    }

    pub fn find_duplicate<'a>(
        &self,
        candidate: &MatchProfile,
        existing: &'a [MatchProfile],
    ) -> Option<DuplicateMatch<'a>> {
        self.find_duplicate_where(candidate, existing, |_| true)
    }

    /// Runs the cascade over the records `keep` admits. Each rule scans the whole admitted
    /// set before the next, weaker rule is tried.
    pub fn find_duplicate_where<'a, F>(
        &self,
        candidate: &MatchProfile,
        existing: &'a [MatchProfile],
        keep: F,
    ) -> Option<DuplicateMatch<'a>>
    where
        F: Fn(&MatchProfile) -> bool,
    {
        for rule in MatchRule::CASCADE {
            for (index, other) in existing.iter().enumerate() {
                if other.id == candidate.id || !keep(other) {
                    continue;
                }
                if let Some(reason) = self.apply_rule(rule, candidate, other) {
                    debug!(
                        candidate = %candidate.name,
                        existing = %other.name,
                        ?rule,
                        "duplicate found"
                    );
                    return Some(DuplicateMatch {
                        index,
                        existing: other,
                        reason,
                    });
                }
            }
        }
        None
    }

    fn apply_rule(
        &self,
        rule: MatchRule,
        candidate: &MatchProfile,
        other: &MatchProfile,
    ) -> Option<MatchReason> {
        match rule {
            MatchRule::Exact => (candidate.name.trim().to_lowercase()
                == other.name.trim().to_lowercase())
            .then_some(MatchReason::Exact),
            MatchRule::NormalizedLocality => {
                let locality = candidate.locality.as_deref()?.trim();
                let location = other.location.as_deref()?;
                if locality.is_empty() || candidate.normalized != other.normalized {
                    return None;
                }
                location
                    .to_lowercase()
                    .contains(&locality.to_lowercase())
                    .then(|| MatchReason::NormalizedLocality {
                        locality: locality.to_string(),
                    })
            }
            MatchRule::Geographic => {
                let distance_km = distance_km(candidate.coordinates, other.coordinates)?;
                if distance_km >= self.config.proximity_km
                    || candidate.normalized.is_empty()
                    || other.normalized.is_empty()
                {
                    return None;
                }
                let related = candidate.normalized.contains(&other.normalized)
                    || other.normalized.contains(&candidate.normalized);
                related.then_some(MatchReason::Geographic { distance_km })
            }
            MatchRule::Fuzzy => {
                let shared = candidate.context_key()? == other.context_key()?;
                if !shared || candidate.normalized.is_empty() || other.normalized.is_empty() {
                    return None;
                }
                let score = similarity(&candidate.normalized, &other.normalized);
                (score > self.config.fuzzy_threshold)
                    .then_some(MatchReason::Fuzzy { similarity: score })
            }
        }
    }

    /// Greedy single pass in input order: each profile joins the first cluster whose
    /// opening record it duplicates, otherwise it opens a new cluster. Records only
    /// cluster with records of the same context (owning unit or country).
    pub fn cluster(&self, profiles: &[MatchProfile]) -> Vec<DuplicateCluster> {
        let mut leaders: Vec<MatchProfile> = Vec::new();
        let mut clusters: Vec<DuplicateCluster> = Vec::new();

        for profile in profiles {
            let context = profile.context_key();
            let found =
                self.find_duplicate_where(profile, &leaders, |leader| leader.context_key() == context);
            match found {
                Some(found) => {
                    let index = found.index;
                    clusters[index].members.push(ClusterMember {
                        id: profile.id,
                        name: profile.name.clone(),
                        reason: Some(found.reason),
                    });
                }
                None => {
                    leaders.push(profile.clone());
                    clusters.push(DuplicateCluster {
                        members: vec![ClusterMember {
                            id: profile.id,
                            name: profile.name.clone(),
                            reason: None,
                        }],
                    });
                }
            }
        }

        clusters
    }
}

/// Existing records bucketed by context so import-time lookups only scan one scope.
/// Records without a context are part of every scope.
#[derive(Debug, Clone, Default)]
pub struct ContextIndex {
    scoped: HashMap<String, Vec<MatchProfile>>,
    unscoped: Vec<MatchProfile>,
}

impl ContextIndex {
    pub fn new(profiles: impl IntoIterator<Item = MatchProfile>) -> Self {
        let mut index = Self::default();
        for profile in profiles {
            match profile.context_key() {
                Some(key) => index.scoped.entry(key).or_default().push(profile),
                None => index.unscoped.push(profile),
            }
        }
        for bucket in index.scoped.values_mut() {
            bucket.extend(index.unscoped.iter().cloned());
        }
        index
    }

    /// Records sharing the candidate's context, followed by the unscoped ones.
    pub fn scope_for(&self, candidate: &MatchProfile) -> &[MatchProfile] {
        candidate
            .context_key()
            .and_then(|key| self.scoped.get(&key))
            .map(Vec::as_slice)
            .unwrap_or(self.unscoped.as_slice())
    }

    pub fn len(&self) -> usize {
        let shared = self.unscoped.len();
        shared + self.scoped.values().map(|bucket| bucket.len() - shared).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationFault {
    #[error("candidate has an empty name")]
    EmptyName,
    #[error("unparseable {field} `{value}`")]
    Unparseable { field: &'static str, value: String },
    #[error(transparent)]
    OutOfRange(#[from] CoordinateError),
    #[error("only one of latitude/longitude is present")]
    HalfCoordinate,
}

/// Raw record handed over by the import front end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub latitude: Option<String>,
    #[serde(default)]
    pub longitude: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_degrees(field: &'static str, value: &str) -> Result<f64, ValidationFault> {
    value.parse::<f64>().map_err(|_| ValidationFault::Unparseable {
        field,
        value: value.to_string(),
    })
}

impl CandidateRecord {
    pub fn validate(&self) -> Result<MatchProfile, ValidationFault> {
        if self.name.trim().is_empty() {
            return Err(ValidationFault::EmptyName);
        }
        let coordinates = match (non_blank(&self.latitude), non_blank(&self.longitude)) {
            (Some(lat), Some(lon)) => Some(Coordinates::new(
                parse_degrees("latitude", lat)?,
                parse_degrees("longitude", lon)?,
            )?),
            (None, None) => None,
            _ => return Err(ValidationFault::HalfCoordinate),
        };

        let mut profile = MatchProfile::new(self.id.unwrap_or_else(Uuid::new_v4), self.name.trim());
        profile.locality = non_blank(&self.locality).map(ToString::to_string);
        profile.location = non_blank(&self.location).map(ToString::to_string);
        profile.context = non_blank(&self.country).map(ToString::to_string);
        profile.coordinates = coordinates;
        Ok(profile)
    }

    /// Text to hand a geocoder when the record carries no coordinates.
    pub fn geocode_query(&self) -> Option<String> {
        let parts = [&self.location, &self.locality, &self.country]
            .into_iter()
            .filter_map(non_blank)
            .collect::<Vec<_>>();
        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(lat: f64, lon: f64) -> Coordinates {
        Coordinates::new(lat, lon).unwrap()
    }

    #[test]
    fn normalize_strips_noise_and_punctuation() {
        assert_eq!(normalize("  Dublin   GAA "), "dublin");
        assert_eq!(normalize("St. Pat's"), "st pats");
        assert_eq!(normalize("St Pats GAA"), "st pats");
        assert_eq!(normalize("Rome Hibernia Gaelic Football Club"), "rome hibernia");
        assert_eq!(normalize("Clubhouse-United"), "clubhouse united");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in [
            "Dublin GAA",
            "St. Pat's",
            "  The Club of the Year ",
            "Cumann Lúthchleas Gael — Ath Cliath",
            "İstanbul Gaelic Ladies",
            "a.b.c",
            "!!!",
            "Naomh Pádraig C.L.G.",
        ] {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn similarity_is_symmetric_and_reflexive() {
        let pairs = [("rome hibernia", "rome celtic"), ("kitten", "sitting"), ("", "abc")];
        for (a, b) in pairs {
            assert_eq!(similarity(a, b), similarity(b, a));
            assert_eq!(similarity(a, a), 1.0);
        }
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("", "abc"), 0.0);
        assert!((similarity("kitten", "sitting") - (1.0 - 3.0 / 7.0)).abs() < 1e-12);
    }

    #[test]
    fn haversine_is_zero_on_same_point_and_symmetric() {
        let dublin = at(53.3498, -6.2603);
        let rome = at(41.9028, 12.4964);
        assert_eq!(haversine_km(dublin, dublin), 0.0);
        assert_eq!(haversine_km(dublin, rome), haversine_km(rome, dublin));
        let d = haversine_km(dublin, rome);
        assert!((1880.0..1900.0).contains(&d), "dublin-rome {d}");
        assert_eq!(distance_km(Some(dublin), None), None);
    }

    #[test]
    fn exact_name_match_wins() {
        let detector = DuplicateDetector::default();
        let existing = vec![MatchProfile::new(Uuid::new_v4(), "Dublin GAA")];
        let candidate = MatchProfile::new(Uuid::new_v4(), "Dublin GAA");
        let found = detector.find_duplicate(&candidate, &existing).unwrap();
        assert_eq!(found.reason, MatchReason::Exact);
        assert_eq!(found.reason.to_string(), "Exact name match");
    }

    #[test]
    fn exact_rule_outranks_an_earlier_fuzzy_candidate() {
        let detector = DuplicateDetector::default();
        let existing = vec![
            MatchProfile::new(Uuid::new_v4(), "Dublin Gaels").with_context("ie"),
            MatchProfile::new(Uuid::new_v4(), "dublin gael").with_context("ie"),
        ];
        let candidate = MatchProfile::new(Uuid::new_v4(), "Dublin Gael").with_context("ie");
        let found = detector.find_duplicate(&candidate, &existing).unwrap();
        assert_eq!(found.index, 1);
        assert_eq!(found.reason.rule(), MatchRule::Exact);
    }

    #[test]
    fn normalized_name_requires_locality_in_location() {
        let detector = DuplicateDetector::default();
        let existing =
            vec![MatchProfile::new(Uuid::new_v4(), "Naomh Mearnog GAA").with_location("Portmarnock, Co. Dublin")];
        let candidate = MatchProfile::new(Uuid::new_v4(), "Naomh Mearnog").with_locality("Dublin");
        let found = detector.find_duplicate(&candidate, &existing).unwrap();
        assert_eq!(
            found.reason,
            MatchReason::NormalizedLocality {
                locality: "Dublin".into()
            }
        );

        let elsewhere = MatchProfile::new(Uuid::new_v4(), "Naomh Mearnog").with_locality("Cork");
        assert!(detector.find_duplicate(&elsewhere, &existing).is_none());
    }

    #[test]
    fn nearby_records_with_related_names_match_geographically() {
        let detector = DuplicateDetector::default();
        let existing =
            vec![MatchProfile::new(Uuid::new_v4(), "St Pats GAA").with_coordinates(at(53.3500, -6.2605))];
        let candidate =
            MatchProfile::new(Uuid::new_v4(), "St. Pat's").with_coordinates(at(53.3498, -6.2603));
        let found = detector.find_duplicate(&candidate, &existing).unwrap();
        match found.reason {
            MatchReason::Geographic { distance_km } => assert!(distance_km < 0.5),
            other => panic!("unexpected reason {other:?}"),
        }
        assert!(found.reason.to_string().contains("Coordinates match"));
    }

    #[test]
    fn co_located_but_unrelated_names_do_not_match() {
        let detector = DuplicateDetector::default();
        let existing =
            vec![MatchProfile::new(Uuid::new_v4(), "Erin's Isle").with_coordinates(at(53.3500, -6.2605))];
        let candidate =
            MatchProfile::new(Uuid::new_v4(), "St Vincents").with_coordinates(at(53.3498, -6.2603));
        assert!(detector.find_duplicate(&candidate, &existing).is_none());
    }

    #[test]
    fn fuzzy_rejects_distinct_clubs_in_the_same_country() {
        let detector = DuplicateDetector::default();
        let existing = vec![MatchProfile::new(Uuid::new_v4(), "Rome Celtic").with_context("Italy")];
        let candidate = MatchProfile::new(Uuid::new_v4(), "Rome Hibernia").with_context("italy");
        assert!(similarity(&candidate.normalized, &existing[0].normalized) < 0.8);
        assert!(detector.find_duplicate(&candidate, &existing).is_none());
    }

    #[test]
    fn fuzzy_needs_shared_context() {
        let detector = DuplicateDetector::default();
        let existing = vec![MatchProfile::new(Uuid::new_v4(), "Paris Gaels").with_context("France")];
        let typo = MatchProfile::new(Uuid::new_v4(), "Paris Gales").with_context("France");
        let found = detector.find_duplicate(&typo, &existing).unwrap();
        assert!(matches!(found.reason, MatchReason::Fuzzy { similarity } if similarity > 0.8));

        let abroad = MatchProfile::new(Uuid::new_v4(), "Paris Gales").with_context("Texas");
        assert!(detector.find_duplicate(&abroad, &existing).is_none());
        let unscoped = MatchProfile::new(Uuid::new_v4(), "Paris Gales");
        assert!(detector.find_duplicate(&unscoped, &existing).is_none());
    }

    #[test]
    fn thresholds_are_configurable() {
        let strict = DuplicateDetector::new(DetectorConfig {
            proximity_km: 0.01,
            fuzzy_threshold: 0.99,
        });
        let existing = vec![MatchProfile::new(Uuid::new_v4(), "St Pats").with_coordinates(at(53.3500, -6.2605))];
        let candidate = MatchProfile::new(Uuid::new_v4(), "St Pats Og").with_coordinates(at(53.3498, -6.2603));
        assert!(strict.find_duplicate(&candidate, &existing).is_none());
    }

    #[test]
    fn pre_filter_limits_the_existing_set() {
        let detector = DuplicateDetector::default();
        let existing = vec![MatchProfile::new(Uuid::new_v4(), "Dublin GAA").with_context("other")];
        let candidate = MatchProfile::new(Uuid::new_v4(), "Dublin GAA").with_context("ie");
        assert!(detector
            .find_duplicate_where(&candidate, &existing, |p| p.context == candidate.context)
            .is_none());

        let index = ContextIndex::new(existing.clone());
        assert!(index.scope_for(&candidate).is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn same_names_under_different_parents_stay_apart() {
        let detector = DuplicateDetector::default();
        let england = Uuid::new_v4().to_string();
        let germany = Uuid::new_v4().to_string();
        let profiles = vec![
            MatchProfile::new(Uuid::new_v4(), "North").with_context(&england),
            MatchProfile::new(Uuid::new_v4(), "North").with_context(&germany),
            MatchProfile::new(Uuid::new_v4(), "north").with_context(&germany),
        ];

        let clusters = detector.cluster(&profiles);

        assert_eq!(clusters.len(), 2);
        assert!(!clusters[0].is_duplicate());
        assert_eq!(clusters[1].ids(), vec![profiles[1].id, profiles[2].id]);
    }

    #[test]
    fn scoped_lookups_include_records_without_context() {
        let detector = DuplicateDetector::default();
        let index = ContextIndex::new(vec![
            MatchProfile::new(Uuid::new_v4(), "Cork Exiles"),
            MatchProfile::new(Uuid::new_v4(), "Dublin GAA").with_context("ie"),
            MatchProfile::new(Uuid::new_v4(), "Rome Celtic").with_context("it"),
        ]);
        assert_eq!(index.len(), 3);

        let candidate = MatchProfile::new(Uuid::new_v4(), "Cork Exiles").with_context("IE");
        let scope = index.scope_for(&candidate);
        assert_eq!(scope.len(), 2);
        let found = detector.find_duplicate(&candidate, scope).unwrap();
        assert_eq!(found.reason, MatchReason::Exact);

        let unknown = MatchProfile::new(Uuid::new_v4(), "Rome Celtic").with_context("fr");
        assert_eq!(index.scope_for(&unknown).len(), 1);
    }

    #[test]
    fn clustering_groups_by_first_member() {
        let detector = DuplicateDetector::default();
        let unit = |name: &str| MatchProfile::new(Uuid::new_v4(), name);
        let profiles = vec![
            unit("North America"),
            unit("Europe"),
            unit("north america"),
            unit("Asia"),
            unit("NORTH AMERICA"),
        ];
        let clusters = detector.cluster(&profiles);
        assert_eq!(clusters.len(), 3);
        assert!(clusters[0].is_duplicate());
        assert_eq!(
            clusters[0].ids(),
            vec![profiles[0].id, profiles[2].id, profiles[4].id]
        );
        assert_eq!(clusters[0].members[0].reason, None);
        assert_eq!(clusters[0].members[1].reason, Some(MatchReason::Exact));
        assert!(!clusters[1].is_duplicate());
    }

    #[test]
    fn candidate_validation_reports_bad_coordinates() {
        let mut record = CandidateRecord {
            name: "St. Pat's".into(),
            latitude: Some("53.3498".into()),
            longitude: Some("-6.2603".into()),
            country: Some("Ireland".into()),
            ..CandidateRecord::default()
        };
        let profile = record.validate().unwrap();
        assert_eq!(profile.normalized, "st pats");
        assert!(profile.coordinates.is_some());

        record.longitude = Some("west".into());
        assert!(matches!(
            record.validate(),
            Err(ValidationFault::Unparseable { field: "longitude", .. })
        ));
        record.longitude = Some("  ".into());
        assert_eq!(record.validate(), Err(ValidationFault::HalfCoordinate));
        record.longitude = Some("200".into());
        assert!(matches!(record.validate(), Err(ValidationFault::OutOfRange(_))));
        record.name = " ".into();
        assert_eq!(record.validate(), Err(ValidationFault::EmptyName));
    }

    #[test]
    fn geocode_query_joins_known_location_parts() {
        let record = CandidateRecord {
            name: "Rome Hibernia".into(),
            location: Some("Rome".into()),
            country: Some("Italy".into()),
            ..CandidateRecord::default()
        };
        assert_eq!(record.geocode_query().as_deref(), Some("Rome, Italy"));
        assert_eq!(CandidateRecord::default().geocode_query(), None);
    }
}
