//! Reference store contract, in-memory and Postgres stores, retry policy and geocoding
//! utilities for refmerge.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use refmerge_core::{
    ChildKind, Club, Coordinates, Country, Entity, EntityKind, FieldUpdate, Filter,
    InternationalUnit, Region,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "refmerge-storage";

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unique key violation: {0}")]
    UniqueViolation(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },
    #[error("{kind} has no field `{field}`")]
    UnsupportedField { kind: EntityKind, field: &'static str },
    #[error("refusing unfiltered update of every {0}")]
    Unfiltered(EntityKind),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation(db.message().to_string()),
                Some("23503") => StoreError::Constraint(db.message().to_string()),
                _ => StoreError::Backend(err.to_string()),
            },
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// Narrow persistence contract the merge engine is written against.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn find_all(&self, kind: EntityKind, filters: &[Filter]) -> Result<Vec<Entity>, StoreError>;

    async fn find_first(
        &self,
        kind: EntityKind,
        filters: &[Filter],
    ) -> Result<Option<Entity>, StoreError> {
        Ok(self.find_all(kind, filters).await?.into_iter().next())
    }

    async fn count_children(&self, parent_id: Uuid, child: ChildKind) -> Result<u64, StoreError>;

    async fn update_many(
        &self,
        kind: EntityKind,
        filters: &[Filter],
        fields: &[FieldUpdate],
    ) -> Result<u64, StoreError>;

    async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<(), StoreError>;
}

fn check_update(kind: EntityKind, filters: &[Filter], fields: &[FieldUpdate]) -> Result<(), StoreError> {
    if filters.is_empty() {
        return Err(StoreError::Unfiltered(kind));
    }
    if let Some(field) = fields.iter().find(|f| !f.applies_to(kind)) {
        return Err(StoreError::UnsupportedField {
            kind,
            field: field.column(),
        });
    }
    Ok(())
}

/// Serializable dump of the whole reference dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub international_units: Vec<InternationalUnit>,
    #[serde(default)]
    pub countries: Vec<Country>,
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default)]
    pub clubs: Vec<Club>,
}

impl Snapshot {
    fn into_entities(self) -> Vec<Entity> {
        let mut out = Vec::new();
        out.extend(self.international_units.into_iter().map(Entity::InternationalUnit));
        out.extend(self.countries.into_iter().map(Entity::Country));
        out.extend(self.regions.into_iter().map(Entity::Region));
        out.extend(self.clubs.into_iter().map(Entity::Club));
        out
    }

    fn push(&mut self, entity: Entity) {
        match entity {
            Entity::InternationalUnit(u) => self.international_units.push(u),
            Entity::Country(c) => self.countries.push(c),
            Entity::Region(r) => self.regions.push(r),
            Entity::Club(c) => self.clubs.push(c),
        }
    }
}

/// The unique key an entity occupies, if its kind has one.
fn unique_key(entity: &Entity) -> Option<String> {
    match entity {
        Entity::InternationalUnit(u) => Some(u.code.clone()),
        Entity::Country(c) => Some(c.code.clone()),
        Entity::Region(r) => Some(format!("{}@{}", r.code, r.country_id)),
        Entity::Club(_) => None,
    }
}

fn check_unique(kind: EntityKind, rows: &[Entity]) -> Result<(), StoreError> {
    let mut seen = HashSet::new();
    let mut ids = HashSet::new();
    for row in rows {
        if !ids.insert(row.id()) {
            return Err(StoreError::UniqueViolation(format!("{kind} id {} already exists", row.id())));
        }
        if let Some(key) = unique_key(row) {
            if !seen.insert(key.clone()) {
                return Err(StoreError::UniqueViolation(format!("{kind} key {key} already exists")));
            }
        }
    }
    Ok(())
}

/// In-process store enforcing the same unique keys as the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<EntityKind, Vec<Entity>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, StoreError> {
        let store = Self::new();
        for entity in snapshot.into_entities() {
            store.insert(entity)?;
        }
        Ok(store)
    }

    pub fn load_json(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let snapshot: Snapshot =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_snapshot(snapshot).with_context(|| format!("loading {}", path.display()))
    }

    /// Write the dataset back via a temp file and rename so readers never see a partial file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(&self.snapshot()).context("serializing snapshot")?;
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        std::fs::write(&temp_path, bytes)
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        std::fs::rename(&temp_path, path).with_context(|| {
            format!(
                "atomically renaming snapshot {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        let tables = self.tables();
        let mut snapshot = Snapshot::default();
        for rows in tables.values() {
            for row in rows {
                snapshot.push(row.clone());
            }
        }
        snapshot
    }

    pub fn insert(&self, entity: Entity) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let rows = tables.entry(entity.kind()).or_default();
        let mut staged = rows.clone();
        let kind = entity.kind();
        staged.push(entity);
        check_unique(kind, &staged)?;
        *rows = staged;
        Ok(())
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.tables().get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.tables().values().all(Vec::is_empty)
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<EntityKind, Vec<Entity>>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReferenceStore for MemoryStore {
    async fn find_all(&self, kind: EntityKind, filters: &[Filter]) -> Result<Vec<Entity>, StoreError> {
        let tables = self.tables();
        Ok(tables
            .get(&kind)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.matches_all(filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_children(&self, parent_id: Uuid, child: ChildKind) -> Result<u64, StoreError> {
        let tables = self.tables();
        let filter = child.filter(parent_id);
        Ok(tables
            .get(&child.entity_kind())
            .map(|rows| rows.iter().filter(|row| row.matches(&filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn update_many(
        &self,
        kind: EntityKind,
        filters: &[Filter],
        fields: &[FieldUpdate],
    ) -> Result<u64, StoreError> {
        check_update(kind, filters, fields)?;
        let mut tables = self.tables();
        let rows = tables.entry(kind).or_default();
        let mut staged = rows.clone();
        let mut count = 0u64;
        for row in staged.iter_mut().filter(|row| row.matches_all(filters)) {
            for field in fields {
                row.apply(field);
            }
            count += 1;
        }
        check_unique(kind, &staged)?;
        *rows = staged;
        Ok(count)
    }

    async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let rows = tables.entry(kind).or_default();
        let before = rows.len();
        rows.retain(|row| row.id() != id);
        if rows.len() == before {
            return Err(StoreError::NotFound { kind, id });
        }
        Ok(())
    }
}

/// Postgres-backed store over the schema in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running reference schema migrations")
    }
}

fn select_columns(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::InternationalUnit => "id, code, name, display_order",
        EntityKind::Country => {
            "id, code, name, has_regions, display_order, international_unit_id"
        }
        EntityKind::Region => "id, code, name, country_id",
        EntityKind::Club => {
            "id, name, location, region, sub_region, latitude, longitude, country_id, international_unit_id, region_id"
        }
    }
}

fn order_by(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::InternationalUnit | EntityKind::Country => "display_order, code, id",
        EntityKind::Region => "country_id, code, id",
        EntityKind::Club => "name, id",
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &[Filter]) {
    for (idx, filter) in filters.iter().enumerate() {
        qb.push(if idx == 0 { " WHERE " } else { " AND " });
        match filter {
            Filter::Id(id) => {
                qb.push("id = ").push_bind(*id);
            }
            Filter::Code(code) => {
                qb.push("code = ").push_bind(code.clone());
            }
            Filter::Name(name) => {
                qb.push("name = ").push_bind(name.clone());
            }
            Filter::Parent(key, id) => {
                qb.push(key.column()).push(" = ").push_bind(*id);
            }
        }
    }
}

fn row_to_entity(kind: EntityKind, row: &PgRow) -> Result<Entity, sqlx::Error> {
    Ok(match kind {
        EntityKind::InternationalUnit => Entity::InternationalUnit(InternationalUnit {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            name: row.try_get("name")?,
            display_order: row.try_get("display_order")?,
        }),
        EntityKind::Country => Entity::Country(Country {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            name: row.try_get("name")?,
            has_regions: row.try_get("has_regions")?,
            display_order: row.try_get("display_order")?,
            international_unit_id: row.try_get("international_unit_id")?,
        }),
        EntityKind::Region => Entity::Region(Region {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            name: row.try_get("name")?,
            country_id: row.try_get("country_id")?,
        }),
        EntityKind::Club => Entity::Club(Club {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            location: row.try_get("location")?,
            region: row.try_get("region")?,
            sub_region: row.try_get("sub_region")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            country_id: row.try_get("country_id")?,
            international_unit_id: row.try_get("international_unit_id")?,
            region_id: row.try_get("region_id")?,
        }),
    })
}

#[async_trait]
impl ReferenceStore for PgStore {
    async fn find_all(&self, kind: EntityKind, filters: &[Filter]) -> Result<Vec<Entity>, StoreError> {
        if filters.iter().any(|f| !f.applies_to(kind)) {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM {}",
            select_columns(kind),
            kind.table()
        ));
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY ").push(order_by(kind));
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row_to_entity(kind, row).map_err(StoreError::from))
            .collect()
    }

    async fn count_children(&self, parent_id: Uuid, child: ChildKind) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE {} = $1",
            child.entity_kind().table(),
            child.foreign_key().column()
        );
        let row = sqlx::query(&sql).bind(parent_id).fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn update_many(
        &self,
        kind: EntityKind,
        filters: &[Filter],
        fields: &[FieldUpdate],
    ) -> Result<u64, StoreError> {
        check_update(kind, filters, fields)?;
        if fields.is_empty() || filters.iter().any(|f| !f.applies_to(kind)) {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Postgres>::new(format!("UPDATE {} SET ", kind.table()));
        for (idx, field) in fields.iter().enumerate() {
            if idx > 0 {
                qb.push(", ");
            }
            qb.push(field.column()).push(" = ");
            match field {
                FieldUpdate::Parent(_, id) => {
                    qb.push_bind(*id);
                }
                FieldUpdate::Name(value) | FieldUpdate::Code(value) => {
                    qb.push_bind(value.clone());
                }
            }
        }
        push_filters(&mut qb, filters);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", kind.table());
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind, id });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("geocoder http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("geocoder returned malformed coordinates: {0}")]
    Malformed(String),
}

/// External geocoding service; its output is consumed as-is.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: tokio::sync::Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: tokio::sync::Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://nominatim.openstreetmap.org/search".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            // Public Nominatim allows one request per second.
            token_bucket: Some(TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_secs(1),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

fn parse_search_hits(hits: &[SearchHit]) -> Result<Option<Coordinates>, GeocodeError> {
    let Some(hit) = hits.first() else {
        return Ok(None);
    };
    let lat: f64 = hit
        .lat
        .trim()
        .parse()
        .map_err(|_| GeocodeError::Malformed(hit.lat.clone()))?;
    let lon: f64 = hit
        .lon
        .trim()
        .parse()
        .map_err(|_| GeocodeError::Malformed(hit.lon.clone()))?;
    Coordinates::new(lat, lon)
        .map(Some)
        .map_err(|err| GeocodeError::Malformed(err.to_string()))
}

/// Nominatim-style `search?format=json` client.
#[derive(Debug)]
pub struct HttpGeocoder {
    client: reqwest::Client,
    endpoint: String,
    token_bucket: Option<SimpleTokenBucket>,
    backoff: BackoffPolicy,
}

impl HttpGeocoder {
    pub fn new(config: GeocoderConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
            token_bucket: config
                .token_bucket
                .map(|c| SimpleTokenBucket::new(c.capacity, c.refill_every)),
            backoff: config.backoff,
        })
    }

    async fn search(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let resp_result = self
                .client
                .get(&self.endpoint)
                .query(&[("format", "json"), ("limit", "1"), ("q", query)])
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let hits: Vec<SearchHit> = resp.json().await?;
                        return parse_search_hits(&hits);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(GeocodeError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(GeocodeError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(GeocodeError::Request(err)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let span = info_span!("geocode", query);
        self.search(query).instrument(span).await
    }
}

/// Bounded TTL cache of geocoder answers, negative answers included.
#[derive(Debug)]
pub struct GeocodeCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    stored_at: Instant,
    value: Option<Coordinates>,
}

impl GeocodeCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    fn key(query: &str) -> String {
        query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
    }

    /// `Some(None)` is a cached miss; `None` means ask the geocoder.
    pub fn get(&self, query: &str) -> Option<Option<Coordinates>> {
        self.get_at(query, Instant::now())
    }

    pub fn get_at(&self, query: &str, now: Instant) -> Option<Option<Coordinates>> {
        let entry = self.entries.get(&Self::key(query))?;
        if now.saturating_duration_since(entry.stored_at) >= self.ttl {
            return None;
        }
        Some(entry.value)
    }

    pub fn insert(&mut self, query: &str, value: Option<Coordinates>) {
        self.insert_at(query, value, Instant::now());
    }

    pub fn insert_at(&mut self, query: &str, value: Option<Coordinates>, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.stored_at) < ttl);
        let key = Self::key(query);
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                stored_at: now,
                value,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct CachedGeocoder<G> {
    inner: G,
    cache: tokio::sync::Mutex<GeocodeCache>,
}

impl<G: Geocoder> CachedGeocoder<G> {
    pub fn new(inner: G, cache: GeocodeCache) -> Self {
        Self {
            inner,
            cache: tokio::sync::Mutex::new(cache),
        }
    }
}

#[async_trait]
impl<G: Geocoder> Geocoder for CachedGeocoder<G> {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        if let Some(hit) = self.cache.lock().await.get(query) {
            debug!(query, "geocode cache hit");
            return Ok(hit);
        }
        let value = self.inner.geocode(query).await?;
        self.cache.lock().await.insert(query, value);
        Ok(value)
    }
}
