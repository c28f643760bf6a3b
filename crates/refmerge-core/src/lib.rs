//! Reference-data model shared by the matching, storage and merge crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "refmerge-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    InternationalUnit,
    Country,
    Region,
    Club,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::InternationalUnit,
        EntityKind::Country,
        EntityKind::Region,
        EntityKind::Club,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::InternationalUnit => "international_unit",
            EntityKind::Country => "country",
            EntityKind::Region => "region",
            EntityKind::Club => "club",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            EntityKind::InternationalUnit => "international_units",
            EntityKind::Country => "countries",
            EntityKind::Region => "regions",
            EntityKind::Club => "clubs",
        }
    }

    pub fn has_code(self) -> bool {
        !matches!(self, EntityKind::Club)
    }

    pub fn foreign_keys(self) -> &'static [ForeignKey] {
        match self {
            EntityKind::InternationalUnit => &[],
            EntityKind::Country => &[ForeignKey::InternationalUnitId],
            EntityKind::Region => &[ForeignKey::CountryId],
            EntityKind::Club => &[
                ForeignKey::InternationalUnitId,
                ForeignKey::CountryId,
                ForeignKey::RegionId,
            ],
        }
    }

    /// Dependent collections in the order a merge must migrate them.
    pub fn child_kinds(self) -> &'static [ChildKind] {
        match self {
            EntityKind::InternationalUnit => &[ChildKind::CountriesOfUnit, ChildKind::ClubsOfUnit],
            EntityKind::Country => &[ChildKind::RegionsOfCountry, ChildKind::ClubsOfCountry],
            EntityKind::Region => &[ChildKind::ClubsOfRegion],
            EntityKind::Club => &[],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity kind `{0}`")]
pub struct UnknownKind(pub String);

impl FromStr for EntityKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        match key.as_str() {
            "international_unit" | "unit" => Ok(EntityKind::InternationalUnit),
            "country" => Ok(EntityKind::Country),
            "region" => Ok(EntityKind::Region),
            "club" => Ok(EntityKind::Club),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKey {
    InternationalUnitId,
    CountryId,
    RegionId,
}

impl ForeignKey {
    pub fn column(self) -> &'static str {
        match self {
            ForeignKey::InternationalUnitId => "international_unit_id",
            ForeignKey::CountryId => "country_id",
            ForeignKey::RegionId => "region_id",
        }
    }
}

/// One edge of the reference hierarchy: a child entity kind plus the column pointing at
/// its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
    CountriesOfUnit,
    ClubsOfUnit,
    RegionsOfCountry,
    ClubsOfCountry,
    ClubsOfRegion,
}

impl ChildKind {
    pub fn parent(self) -> EntityKind {
        match self {
            ChildKind::CountriesOfUnit | ChildKind::ClubsOfUnit => EntityKind::InternationalUnit,
            ChildKind::RegionsOfCountry | ChildKind::ClubsOfCountry => EntityKind::Country,
            ChildKind::ClubsOfRegion => EntityKind::Region,
        }
    }

    pub fn entity_kind(self) -> EntityKind {
        match self {
            ChildKind::CountriesOfUnit => EntityKind::Country,
            ChildKind::RegionsOfCountry => EntityKind::Region,
            ChildKind::ClubsOfUnit | ChildKind::ClubsOfCountry | ChildKind::ClubsOfRegion => {
                EntityKind::Club
            }
        }
    }

    pub fn foreign_key(self) -> ForeignKey {
        match self {
            ChildKind::CountriesOfUnit | ChildKind::ClubsOfUnit => ForeignKey::InternationalUnitId,
            ChildKind::RegionsOfCountry | ChildKind::ClubsOfCountry => ForeignKey::CountryId,
            ChildKind::ClubsOfRegion => ForeignKey::RegionId,
        }
    }

    /// Children whose `code` must stay unique among siblings under one parent.
    pub fn code_unique_within_parent(self) -> bool {
        matches!(self, ChildKind::RegionsOfCountry)
    }

    pub fn filter(self, parent_id: Uuid) -> Filter {
        Filter::Parent(self.foreign_key(), parent_id)
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity_kind().table(), self.foreign_key().column())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternationalUnit {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub display_order: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Country {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub has_regions: bool,
    #[serde(default)]
    pub display_order: i32,
    pub international_unit_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub country_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Club {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub sub_region: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub country_id: Option<Uuid>,
    #[serde(default)]
    pub international_unit_id: Option<Uuid>,
    #[serde(default)]
    pub region_id: Option<Uuid>,
}

impl Club {
    /// Valid coordinates, or `None` when either half is missing or out of range.
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Coordinates::new(lat, lon).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    InternationalUnit(InternationalUnit),
    Country(Country),
    Region(Region),
    Club(Club),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::InternationalUnit(_) => EntityKind::InternationalUnit,
            Entity::Country(_) => EntityKind::Country,
            Entity::Region(_) => EntityKind::Region,
            Entity::Club(_) => EntityKind::Club,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Entity::InternationalUnit(u) => u.id,
            Entity::Country(c) => c.id,
            Entity::Region(r) => r.id,
            Entity::Club(c) => c.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Entity::InternationalUnit(u) => &u.name,
            Entity::Country(c) => &c.name,
            Entity::Region(r) => &r.name,
            Entity::Club(c) => &c.name,
        }
    }

    /// Clubs carry no code.
    pub fn code(&self) -> Option<&str> {
        match self {
            Entity::InternationalUnit(u) => Some(&u.code),
            Entity::Country(c) => Some(&c.code),
            Entity::Region(r) => Some(&r.code),
            Entity::Club(_) => None,
        }
    }

    pub fn parent_id(&self, key: ForeignKey) -> Option<Uuid> {
        match (self, key) {
            (Entity::Country(c), ForeignKey::InternationalUnitId) => Some(c.international_unit_id),
            (Entity::Region(r), ForeignKey::CountryId) => Some(r.country_id),
            (Entity::Club(c), ForeignKey::InternationalUnitId) => c.international_unit_id,
            (Entity::Club(c), ForeignKey::CountryId) => c.country_id,
            (Entity::Club(c), ForeignKey::RegionId) => c.region_id,
            _ => None,
        }
    }

    pub fn matches(&self, filter: &Filter) -> bool {
        match filter {
            Filter::Id(id) => self.id() == *id,
            Filter::Code(code) => self.code() == Some(code.as_str()),
            Filter::Name(name) => self.name() == name.as_str(),
            Filter::Parent(key, id) => self.parent_id(*key) == Some(*id),
        }
    }

    pub fn matches_all(&self, filters: &[Filter]) -> bool {
        filters.iter().all(|f| self.matches(f))
    }

    /// Applies one field update; returns `false` when the field does not exist on this kind.
    pub fn apply(&mut self, update: &FieldUpdate) -> bool {
        match (self, update) {
            (Entity::InternationalUnit(u), FieldUpdate::Name(v)) => u.name = v.clone(),
            (Entity::InternationalUnit(u), FieldUpdate::Code(v)) => u.code = v.clone(),
            (Entity::Country(c), FieldUpdate::Name(v)) => c.name = v.clone(),
            (Entity::Country(c), FieldUpdate::Code(v)) => c.code = v.clone(),
            (Entity::Country(c), FieldUpdate::Parent(ForeignKey::InternationalUnitId, id)) => {
                c.international_unit_id = *id
            }
            (Entity::Region(r), FieldUpdate::Name(v)) => r.name = v.clone(),
            (Entity::Region(r), FieldUpdate::Code(v)) => r.code = v.clone(),
            (Entity::Region(r), FieldUpdate::Parent(ForeignKey::CountryId, id)) => r.country_id = *id,
            (Entity::Club(c), FieldUpdate::Name(v)) => c.name = v.clone(),
            (Entity::Club(c), FieldUpdate::Parent(ForeignKey::InternationalUnitId, id)) => {
                c.international_unit_id = Some(*id)
            }
            (Entity::Club(c), FieldUpdate::Parent(ForeignKey::CountryId, id)) => {
                c.country_id = Some(*id)
            }
            (Entity::Club(c), FieldUpdate::Parent(ForeignKey::RegionId, id)) => {
                c.region_id = Some(*id)
            }
            _ => return false,
        }
        true
    }

    pub fn to_ref(&self) -> EntityRef {
        EntityRef {
            kind: self.kind(),
            id: self.id(),
            code: self.code().map(ToString::to_string),
            name: self.name().to_string(),
        }
    }
}

/// Store-handle-free pointer to an entity, safe to log and serialize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
    pub code: Option<String>,
    pub name: String,
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} {} ({})", self.kind, code, self.name),
            None => write!(f, "{} {} ({})", self.kind, self.id, self.name),
        }
    }
}

/// Equality predicates understood by every store; a filter list is a conjunction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Id(Uuid),
    Code(String),
    Name(String),
    Parent(ForeignKey, Uuid),
}

impl Filter {
    pub fn applies_to(&self, kind: EntityKind) -> bool {
        match self {
            Filter::Id(_) | Filter::Name(_) => true,
            Filter::Code(_) => kind.has_code(),
            Filter::Parent(key, _) => kind.foreign_keys().contains(key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldUpdate {
    Parent(ForeignKey, Uuid),
    Name(String),
    Code(String),
}

impl FieldUpdate {
    pub fn applies_to(&self, kind: EntityKind) -> bool {
        match self {
            FieldUpdate::Name(_) => true,
            FieldUpdate::Code(_) => kind.has_code(),
            FieldUpdate::Parent(key, _) => kind.foreign_keys().contains(key),
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            FieldUpdate::Name(_) => "name",
            FieldUpdate::Code(_) => "code",
            FieldUpdate::Parent(key, _) => key.column(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl EntityPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.code.is_none()
    }

    pub fn to_updates(&self) -> Vec<FieldUpdate> {
        let mut updates = Vec::new();
        if let Some(name) = &self.name {
            updates.push(FieldUpdate::Name(name.clone()));
        }
        if let Some(code) = &self.code {
            updates.push(FieldUpdate::Code(code.clone()));
        }
        updates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("latitude {0} outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} outside [-180, 180]")]
    Longitude(f64),
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, CoordinateError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(CoordinateError::Latitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(CoordinateError::Longitude(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn club(country: Uuid, region: Option<Uuid>) -> Entity {
        Entity::Club(Club {
            id: Uuid::new_v4(),
            name: "Dublin GAA".into(),
            location: Some("Dublin".into()),
            region: None,
            sub_region: None,
            latitude: Some(53.35),
            longitude: Some(-6.26),
            country_id: Some(country),
            international_unit_id: None,
            region_id: region,
        })
    }

    #[test]
    fn child_walk_covers_every_foreign_key_into_each_parent() {
        for kind in EntityKind::ALL {
            for child in kind.child_kinds() {
                assert_eq!(child.parent(), kind);
            }
        }
        assert_eq!(
            EntityKind::Country.child_kinds(),
            &[ChildKind::RegionsOfCountry, ChildKind::ClubsOfCountry]
        );
        assert!(EntityKind::Club.child_kinds().is_empty());
    }

    #[test]
    fn filters_match_on_parent_keys() {
        let country = Uuid::new_v4();
        let region = Uuid::new_v4();
        let entity = club(country, Some(region));
        assert!(entity.matches_all(&[
            ChildKind::ClubsOfCountry.filter(country),
            ChildKind::ClubsOfRegion.filter(region),
        ]));
        assert!(!entity.matches(&ChildKind::ClubsOfUnit.filter(country)));
        assert!(!entity.matches(&Filter::Code("D1".into())));
    }

    #[test]
    fn apply_rejects_fields_the_kind_does_not_have() {
        let mut entity = club(Uuid::new_v4(), None);
        assert!(!entity.apply(&FieldUpdate::Code("X".into())));
        let target = Uuid::new_v4();
        assert!(entity.apply(&FieldUpdate::Parent(ForeignKey::RegionId, target)));
        assert_eq!(entity.parent_id(ForeignKey::RegionId), Some(target));
    }

    #[test]
    fn coordinates_are_range_checked() {
        assert!(Coordinates::new(53.3498, -6.2603).is_ok());
        assert_eq!(Coordinates::new(91.0, 0.0), Err(CoordinateError::Latitude(91.0)));
        assert!(matches!(
            Coordinates::new(0.0, f64::NAN),
            Err(CoordinateError::Longitude(_))
        ));
    }

    #[test]
    fn entity_serializes_with_kind_tag() {
        let unit = Entity::InternationalUnit(InternationalUnit {
            id: Uuid::nil(),
            code: "USA".into(),
            name: "North America".into(),
            display_order: 1,
        });
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(json["kind"], "international_unit");
        assert_eq!(json["code"], "USA");
    }

    #[test]
    fn kinds_parse_from_cli_spellings() {
        assert_eq!("international-unit".parse::<EntityKind>(), Ok(EntityKind::InternationalUnit));
        assert_eq!("Region".parse::<EntityKind>(), Ok(EntityKind::Region));
        assert!("planet".parse::<EntityKind>().is_err());
    }
}
