//! Reconciliation runs: configuration, the detect/plan/execute loop, and report output.

pub mod execute;
pub mod import;
pub mod plan;
pub mod report;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use refmerge_core::{Entity, EntityKind, Filter, ForeignKey};
use refmerge_match::{DetectorConfig, DuplicateDetector, MatchProfile};
use refmerge_storage::{BackoffPolicy, GeocodeCache, GeocoderConfig, ReferenceStore, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use execute::{ExecutionReport, MergeExecutor, StepOutcome, StepStatus};
pub use import::{CandidateMatch, ImportMatcher, ImportReport};
pub use plan::{KindRules, MergeOperation, MergePlan, MergePlanner, NormalizationPlan, PlanError};
pub use report::{ClusterMemberSummary, Fault, FaultKind, ReconciliationReport, SkippedItem};

pub const CRATE_NAME: &str = "refmerge-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocodeCacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_cache_capacity() -> usize {
    10_000
}

impl Default for GeocodeCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            capacity: default_cache_capacity(),
        }
    }
}

impl GeocodeCacheConfig {
    pub fn build(&self) -> GeocodeCache {
        GeocodeCache::new(Duration::from_secs(self.ttl_secs), self.capacity)
    }
}

/// Contents of `merge.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub geocode_cache: GeocodeCacheConfig,
    #[serde(default)]
    pub kinds: BTreeMap<EntityKind, KindRules>,
}

impl MergeConfig {
    /// Missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no merge config; using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn rules_for(&self, kind: EntityKind) -> KindRules {
        self.kinds.get(&kind).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct EngineEnv {
    pub database_url: Option<String>,
    pub config_path: PathBuf,
    pub reports_dir: PathBuf,
    pub geocoder_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl EngineEnv {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            config_path: std::env::var("REFMERGE_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("merge.yaml")),
            reports_dir: std::env::var("REFMERGE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            geocoder_url: std::env::var("REFMERGE_GEOCODER_URL")
                .unwrap_or_else(|_| GeocoderConfig::default().endpoint),
            user_agent: std::env::var("REFMERGE_USER_AGENT")
                .unwrap_or_else(|_| "refmerge/0.1".to_string()),
            http_timeout_secs: std::env::var("REFMERGE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn geocoder_config(&self, retry: &RetryConfig) -> GeocoderConfig {
        GeocoderConfig {
            endpoint: self.geocoder_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: retry.backoff(),
            token_bucket: Some(TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_secs(1),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub kind: EntityKind,
    pub dry_run: bool,
}

/// One reconciliation pass over a single entity kind. Callers serialize runs.
pub struct Reconciler<'a> {
    store: &'a dyn ReferenceStore,
    config: MergeConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn ReferenceStore, config: MergeConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(&self, options: RunOptions) -> Result<ReconciliationReport> {
        if options.kind == EntityKind::Club {
            bail!("clubs are matched at import time, not reconciled");
        }
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id, kind = %options.kind, dry_run = options.dry_run);
        Ok(self.run_inner(run_id, options).instrument(span).await)
    }

    async fn run_inner(&self, run_id: Uuid, options: RunOptions) -> ReconciliationReport {
        let RunOptions { kind, dry_run } = options;
        let mut report = ReconciliationReport::new(run_id, kind, dry_run);
        let planner = MergePlanner::new(self.config.rules_for(kind));
        let executor = MergeExecutor::new(self.store, self.config.retry.backoff());

        let entities = match self.store.find_all(kind, &[]).await {
            Ok(entities) => entities,
            Err(err) => {
                report
                    .faults
                    .push(Fault::new(FaultKind::Store, format!("scan {kind}"), err.to_string()));
                report.finish();
                return report;
            }
        };
        report.entities_scanned = entities.len();

        let profiles = entities.iter().map(MatchProfile::from_entity).collect::<Vec<_>>();
        let clusters = DuplicateDetector::new(self.config.detector).cluster(&profiles);
        let by_id = entities.iter().map(|e| (e.id(), e)).collect::<HashMap<_, _>>();
        info!(entities = entities.len(), clusters = clusters.iter().filter(|c| c.is_duplicate()).count(), "detection finished");

        let mut handled: HashSet<Uuid> = HashSet::new();
        let mut redirect: HashMap<String, String> = HashMap::new();
        let mut halted = false;

        for cluster in clusters.iter().filter(|c| c.is_duplicate()) {
            handled.extend(cluster.ids());
            let members = cluster
                .ids()
                .iter()
                .filter_map(|id| by_id.get(id).map(|e| (*e).clone()))
                .collect::<Vec<_>>();
            let label = members
                .iter()
                .map(|m| m.to_ref().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            if halted {
                report.skip(label, "not run: an earlier plan halted on a store fault");
                continue;
            }

            let plan = match planner.plan_merge(self.store, &members).await {
                Ok(plan) => plan,
                Err(err) => {
                    halted = record_plan_error(&mut report, &label, err);
                    continue;
                }
            };
            for loser in &plan.losers {
                if let (Some(from), Some(to)) = (&loser.code, &plan.survivor.code) {
                    redirect.insert(from.clone(), to.clone());
                }
            }
            let summaries = cluster
                .members
                .iter()
                .filter_map(|m| {
                    by_id.get(&m.id).map(|e| ClusterMemberSummary {
                        entity: e.to_ref(),
                        reason: m.reason.as_ref().map(ToString::to_string),
                    })
                })
                .collect();
            report.record_plan(&plan, summaries, false);

            if !dry_run {
                let execution = executor.execute(&plan).await;
                halted = execution.halted;
                report.record_execution(&execution);
            }
        }

        if !halted {
            halted = self
                .fallback_pass(&planner, &executor, &mut report, &entities, &mut handled, &mut redirect)
                .await;
        }

        if !halted {
            match planner.plan_normalization(self.store, kind, &handled).await {
                Ok(normalization) => {
                    report.planned_operations += normalization.operations.len();
                    report.faults.extend(normalization.conflicts);
                    if !dry_run && !normalization.operations.is_empty() {
                        let execution = executor
                            .execute_operations(&format!("normalize {kind}"), &normalization.operations)
                            .await;
                        report.record_execution(&execution);
                    }
                }
                Err(err) => {
                    record_plan_error(&mut report, &format!("normalize {kind}"), err);
                }
            }
        }

        report.finish();
        info!(
            clusters = report.clusters.len(),
            planned = report.planned_operations,
            applied = report.applied_operations,
            faults = report.faults.len(),
            "reconciliation finished"
        );
        report
    }

    /// Configured loser-code -> survivor-code merges for entities the detector left alone.
    /// Returns `true` when a store fault halted execution.
    async fn fallback_pass(
        &self,
        planner: &MergePlanner,
        executor: &MergeExecutor<'_>,
        report: &mut ReconciliationReport,
        entities: &[Entity],
        handled: &mut HashSet<Uuid>,
        redirect: &mut HashMap<String, String>,
    ) -> bool {
        let fallback = &planner.rules().fallback;
        if fallback.is_empty() {
            return false;
        }

        for entity in entities {
            if handled.contains(&entity.id()) {
                continue;
            }
            let Some(code) = entity.code() else {
                continue;
            };
            let Some(mapped) = fallback.get(code) else {
                continue;
            };
            let target_code = redirect.get(mapped).unwrap_or(mapped).clone();
            let subject = entity.to_ref().to_string();
            if target_code == code {
                continue;
            }

            let mut filters = vec![Filter::Code(target_code.clone())];
            if let Some(country_id) = entity.parent_id(ForeignKey::CountryId) {
                filters.push(Filter::Parent(ForeignKey::CountryId, country_id));
            }
            let target = match self.store.find_first(entity.kind(), &filters).await {
                Ok(Some(target)) => target,
                Ok(None) => {
                    warn!(%subject, target = %target_code, "fallback target not found");
                    report.skip(subject, format!("fallback target {target_code} not found"));
                    continue;
                }
                Err(err) => {
                    report
                        .faults
                        .push(Fault::new(FaultKind::Store, subject, err.to_string()));
                    return true;
                }
            };

            let plan = match planner
                .plan_merge_into(self.store, &target, std::slice::from_ref(entity))
                .await
            {
                Ok(plan) => plan,
                Err(err) => {
                    if record_plan_error(report, &subject, err) {
                        return true;
                    }
                    continue;
                }
            };
            handled.insert(entity.id());
            handled.insert(target.id());
            redirect.insert(code.to_string(), target_code.clone());
            let members = vec![
                ClusterMemberSummary {
                    entity: target.to_ref(),
                    reason: None,
                },
                ClusterMemberSummary {
                    entity: entity.to_ref(),
                    reason: Some(format!("Fallback mapping {code} -> {target_code}")),
                },
            ];
            report.record_plan(&plan, members, true);

            if !report.dry_run {
                let execution = executor.execute(&plan).await;
                report.record_execution(&execution);
                if execution.halted {
                    return true;
                }
            }
        }
        false
    }
}

/// Records a planning failure; returns `true` when it should halt the run.
fn record_plan_error(report: &mut ReconciliationReport, subject: &str, err: PlanError) -> bool {
    match err {
        PlanError::Store(err) => {
            report
                .faults
                .push(Fault::new(FaultKind::Store, subject, err.to_string()));
            true
        }
        other => {
            report
                .faults
                .push(Fault::new(FaultKind::Invariant, subject, other.to_string()));
            false
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub run_id: Uuid,
    pub files: Vec<ReportFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportFile {
    pub name: String,
    pub sha256: String,
    pub bytes: u64,
}

fn report_file(name: &str, bytes: &[u8]) -> ReportFile {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ReportFile {
        name: name.to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    }
}

/// Writes `<reports_root>/<run_id>/{reconciliation.json,summary.md,manifest.json}`.
pub async fn write_reports(reports_root: &Path, report: &ReconciliationReport) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing reconciliation report")?;
    fs::write(reports_dir.join("reconciliation.json"), &json)
        .await
        .context("writing reconciliation.json")?;

    let summary = report.summary_markdown();
    fs::write(reports_dir.join("summary.md"), summary.as_bytes())
        .await
        .context("writing summary.md")?;

    let manifest = ReportManifest {
        run_id: report.run_id,
        files: vec![
            report_file("reconciliation.json", &json),
            report_file("summary.md", summary.as_bytes()),
        ],
    };
    let manifest_json = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(reports_dir.join("manifest.json"), manifest_json)
        .await
        .context("writing manifest.json")?;

    Ok(reports_dir)
}
