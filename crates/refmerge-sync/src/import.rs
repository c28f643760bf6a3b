//! Matching raw import candidates against the clubs already stored.

use std::collections::HashMap;

use refmerge_core::{EntityKind, EntityRef};
use refmerge_match::{CandidateRecord, ContextIndex, DuplicateDetector, MatchProfile, MatchReason};
use refmerge_storage::{Geocoder, ReferenceStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::report::SkippedItem;

#[derive(Debug, Clone, Serialize)]
pub struct CandidateMatch {
    pub candidate: String,
    /// `None` means the candidate is new.
    pub existing: Option<EntityRef>,
    pub reason: Option<MatchReason>,
    pub geocoded: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub matches: Vec<CandidateMatch>,
    pub skipped: Vec<SkippedItem>,
}

impl ImportReport {
    pub fn duplicates(&self) -> usize {
        self.matches.iter().filter(|m| m.existing.is_some()).count()
    }
}

pub struct ImportMatcher {
    detector: DuplicateDetector,
    index: ContextIndex,
    all: Vec<MatchProfile>,
    clubs: HashMap<Uuid, EntityRef>,
    countries: HashMap<String, Uuid>,
}

impl ImportMatcher {
    /// Loads every club and the country lookup table from `store`.
    pub async fn load(
        store: &dyn ReferenceStore,
        detector: DuplicateDetector,
    ) -> Result<Self, StoreError> {
        let mut countries = HashMap::new();
        for country in store.find_all(EntityKind::Country, &[]).await? {
            countries.insert(country.name().trim().to_lowercase(), country.id());
            if let Some(code) = country.code() {
                countries.insert(code.trim().to_lowercase(), country.id());
            }
        }

        let clubs = store.find_all(EntityKind::Club, &[]).await?;
        let all = clubs.iter().map(MatchProfile::from_entity).collect::<Vec<_>>();
        info!(clubs = all.len(), countries = countries.len(), "import matcher loaded");

        Ok(Self {
            detector,
            index: ContextIndex::new(all.clone()),
            all,
            clubs: clubs.iter().map(|c| (c.id(), c.to_ref())).collect(),
            countries,
        })
    }

    fn resolve_country(&self, country: &str) -> Option<Uuid> {
        self.countries.get(&country.trim().to_lowercase()).copied()
    }

    /// Validates, optionally geocodes, and matches each candidate in input order.
    pub async fn match_candidates(
        &self,
        candidates: &[CandidateRecord],
        geocoder: Option<&dyn Geocoder>,
    ) -> ImportReport {
        let mut report = ImportReport::default();

        for (position, candidate) in candidates.iter().enumerate() {
            let subject = if candidate.name.trim().is_empty() {
                format!("candidate #{}", position + 1)
            } else {
                candidate.name.trim().to_string()
            };
            let mut profile = match candidate.validate() {
                Ok(profile) => profile,
                Err(fault) => {
                    debug!(%subject, %fault, "skipping invalid candidate");
                    report.skipped.push(SkippedItem {
                        subject,
                        reason: fault.to_string(),
                    });
                    continue;
                }
            };

            let mut geocoded = false;
            if profile.coordinates.is_none() {
                if let (Some(geocoder), Some(query)) = (geocoder, candidate.geocode_query()) {
                    match geocoder.geocode(&query).await {
                        Ok(Some(coordinates)) => {
                            profile.coordinates = Some(coordinates);
                            geocoded = true;
                        }
                        Ok(None) => debug!(%query, "geocoder found nothing"),
                        Err(err) => warn!(%query, error = %err, "geocoding failed; matching without coordinates"),
                    }
                }
            }

            let scope = match profile.context.as_deref() {
                Some(country) => match self.resolve_country(country) {
                    Some(id) => {
                        profile.context = Some(id.to_string());
                        self.index.scope_for(&profile)
                    }
                    None => {
                        warn!(%subject, country, "unknown country; matching against every club");
                        profile.context = None;
                        &self.all
                    }
                },
                None => &self.all,
            };

            let found = self.detector.find_duplicate(&profile, scope);
            report.matches.push(CandidateMatch {
                candidate: subject,
                existing: found
                    .as_ref()
                    .and_then(|m| self.clubs.get(&m.existing.id).cloned()),
                reason: found.map(|m| m.reason),
                geocoded,
            });
        }

        report
    }
}
