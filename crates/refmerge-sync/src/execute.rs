//! Ordered, fail-forward application of merge plans against a store.

use std::collections::BTreeMap;
use std::future::Future;

use refmerge_core::{ChildKind, EntityKind, FieldUpdate, Filter};
use refmerge_storage::{BackoffPolicy, ReferenceStore, StoreError};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::plan::{MergeOperation, MergePlan};
use crate::report::{Fault, FaultKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Applied,
    /// Rejected by a unique key; the plan moved on.
    Skipped,
    Failed,
    NotRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub operation: MergeOperation,
    pub status: StepStatus,
    pub rows: u64,
    pub attempts: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub steps: Vec<StepOutcome>,
    pub reassigned: BTreeMap<ChildKind, u64>,
    pub deleted: BTreeMap<EntityKind, u64>,
    pub updated: u64,
    pub faults: Vec<Fault>,
    /// Set when a store or invariant fault stopped the plan early.
    pub halted: bool,
}

impl ExecutionReport {
    pub fn applied(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Applied)
            .count()
    }
}

enum StepError {
    Store(StoreError),
    Invariant(String),
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        StepError::Store(err)
    }
}

pub struct MergeExecutor<'a> {
    store: &'a dyn ReferenceStore,
    backoff: BackoffPolicy,
}

impl<'a> MergeExecutor<'a> {
    pub fn new(store: &'a dyn ReferenceStore, backoff: BackoffPolicy) -> Self {
        Self { store, backoff }
    }

    pub async fn execute(&self, plan: &MergePlan) -> ExecutionReport {
        self.execute_operations(&plan.survivor.to_string(), &plan.operations)
            .await
    }

    /// Runs `operations` strictly in order. Nothing applied is undone when a later step
    /// fails.
    pub async fn execute_operations(
        &self,
        subject: &str,
        operations: &[MergeOperation],
    ) -> ExecutionReport {
        let span = info_span!("execute_plan", subject, steps = operations.len());
        self.run(operations).instrument(span).await
    }

    async fn run(&self, operations: &[MergeOperation]) -> ExecutionReport {
        let mut report = ExecutionReport::default();

        for (index, operation) in operations.iter().enumerate() {
            if report.halted {
                report.steps.push(StepOutcome {
                    index,
                    operation: operation.clone(),
                    status: StepStatus::NotRun,
                    rows: 0,
                    attempts: 0,
                });
                continue;
            }

            let (result, attempts) = self.apply(operation).await;
            let mut rows = 0;
            let status = match result {
                Ok(applied) => {
                    rows = applied;
                    record_rows(&mut report, operation, rows);
                    info!(step = index, %operation, rows, "step applied");
                    StepStatus::Applied
                }
                Err(StepError::Store(err)) if err.is_unique_violation() => {
                    warn!(step = index, %operation, error = %err, "step skipped on unique key");
                    report.faults.push(
                        Fault::new(FaultKind::Conflict, operation.to_string(), err.to_string())
                            .at_step(index),
                    );
                    StepStatus::Skipped
                }
                Err(StepError::Store(err)) => {
                    warn!(step = index, %operation, attempts, error = %err, "store fault; halting plan");
                    report.faults.push(
                        Fault::new(FaultKind::Store, operation.to_string(), err.to_string())
                            .at_step(index),
                    );
                    report.halted = true;
                    StepStatus::Failed
                }
                Err(StepError::Invariant(message)) => {
                    error!(step = index, %operation, %message, "invariant violated; aborting plan");
                    report.faults.push(
                        Fault::new(FaultKind::Invariant, operation.to_string(), message).at_step(index),
                    );
                    report.halted = true;
                    StepStatus::Failed
                }
            };

            report.steps.push(StepOutcome {
                index,
                operation: operation.clone(),
                status,
                rows,
                attempts,
            });
        }

        report
    }

    async fn apply(&self, operation: &MergeOperation) -> (Result<u64, StepError>, usize) {
        match operation {
            MergeOperation::ReassignChildren { from, to, child } => {
                let filters = [child.filter(*from)];
                let fields = [FieldUpdate::Parent(child.foreign_key(), *to)];
                let (filters, fields) = (&filters[..], &fields[..]);
                let (result, attempts) = self
                    .with_retry(move || self.store.update_many(child.entity_kind(), filters, fields))
                    .await;
                (result.map_err(StepError::from), attempts)
            }
            MergeOperation::RealignChildren {
                parent,
                child,
                key,
                to,
            } => {
                let filters = [child.filter(*parent)];
                let fields = [FieldUpdate::Parent(*key, *to)];
                let (filters, fields) = (&filters[..], &fields[..]);
                let (result, attempts) = self
                    .with_retry(move || self.store.update_many(child.entity_kind(), filters, fields))
                    .await;
                (result.map_err(StepError::from), attempts)
            }
            MergeOperation::RenameOrRecode { kind, id, patch } => {
                let filters = [Filter::Id(*id)];
                let fields = patch.to_updates();
                let (filters, fields) = (&filters[..], &fields[..]);
                let (result, attempts) = self
                    .with_retry(move || self.store.update_many(*kind, filters, fields))
                    .await;
                (result.map_err(StepError::from), attempts)
            }
            MergeOperation::DeleteEntity { kind, id } => self.delete_checked(*kind, *id).await,
        }
    }

    /// Re-counts every child collection immediately before deleting.
    async fn delete_checked(&self, kind: EntityKind, id: Uuid) -> (Result<u64, StepError>, usize) {
        let mut attempts = 0;
        for child in kind.child_kinds() {
            let (count, tries) = self
                .with_retry(move || self.store.count_children(id, *child))
                .await;
            attempts += tries;
            match count {
                Ok(0) => {}
                Ok(remaining) => {
                    return (
                        Err(StepError::Invariant(format!(
                            "{kind} {id} still has {remaining} rows in {child}"
                        ))),
                        attempts,
                    )
                }
                Err(err) => return (Err(err.into()), attempts),
            }
        }
        let (result, tries) = self.with_retry(move || self.store.delete(kind, id)).await;
        (result.map(|()| 1).map_err(StepError::from), attempts + tries)
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> (Result<T, StoreError>, usize)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, ?delay, error = %err, "retrying store call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return (result, attempt + 1),
            }
        }
    }
}

fn record_rows(report: &mut ExecutionReport, operation: &MergeOperation, rows: u64) {
    match operation {
        MergeOperation::ReassignChildren { child, .. } => {
            *report.reassigned.entry(*child).or_default() += rows;
        }
        MergeOperation::RealignChildren { .. } | MergeOperation::RenameOrRecode { .. } => {
            report.updated += rows
        }
        MergeOperation::DeleteEntity { kind, .. } => {
            *report.deleted.entry(*kind).or_default() += rows;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use refmerge_core::{Club, Country, Entity, EntityPatch, Region};
    use refmerge_storage::MemoryStore;

    use crate::plan::MergePlanner;

    fn country(code: &str, name: &str) -> Entity {
        Entity::Country(Country {
            id: Uuid::new_v4(),
            code: code.into(),
            name: name.into(),
            has_regions: true,
            display_order: 0,
            international_unit_id: Uuid::nil(),
        })
    }

    fn region(code: &str, country_id: Uuid) -> Entity {
        Entity::Region(Region {
            id: Uuid::new_v4(),
            code: code.into(),
            name: code.into(),
            country_id,
        })
    }

    fn club(name: &str, country_id: Uuid, region_id: Uuid) -> Entity {
        Entity::Club(Club {
            id: Uuid::new_v4(),
            name: name.into(),
            location: None,
            region: None,
            sub_region: None,
            latitude: None,
            longitude: None,
            country_id: Some(country_id),
            international_unit_id: None,
            region_id: Some(region_id),
        })
    }

    fn fast_retry() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    /// Fails every `update_many` touching `fail_on` with `error`, `failures` times.
    struct FlakyStore {
        inner: MemoryStore,
        fail_on: EntityKind,
        error: StoreError,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore, fail_on: EntityKind, error: StoreError, failures: usize) -> Self {
            Self {
                inner,
                fail_on,
                error,
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReferenceStore for FlakyStore {
        async fn find_all(&self, kind: EntityKind, filters: &[Filter]) -> Result<Vec<Entity>, StoreError> {
            self.inner.find_all(kind, filters).await
        }

        async fn count_children(&self, parent_id: Uuid, child: ChildKind) -> Result<u64, StoreError> {
            self.inner.count_children(parent_id, child).await
        }

        async fn update_many(
            &self,
            kind: EntityKind,
            filters: &[Filter],
            fields: &[FieldUpdate],
        ) -> Result<u64, StoreError> {
            if kind == self.fail_on {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let remaining = self.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(self.error.clone());
                }
            }
            self.inner.update_many(kind, filters, fields).await
        }

        async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<(), StoreError> {
            self.inner.delete(kind, id).await
        }
    }

    struct Fixture {
        store: MemoryStore,
        survivor: Entity,
        loser: Entity,
        survivor_d1: Entity,
        loser_d1: Entity,
        loser_d2: Entity,
    }

    fn region_conflict_fixture() -> Fixture {
        let store = MemoryStore::new();
        let survivor = country("IRL", "Ireland");
        let loser = country("IRE_LEGACY", "Ireland");
        let survivor_d1 = region("D1", survivor.id());
        let loser_d1 = region("D1", loser.id());
        let loser_d2 = region("D2", loser.id());
        for entity in [&survivor, &loser, &survivor_d1, &loser_d1, &loser_d2] {
            store.insert(entity.clone()).unwrap();
        }
        for name in ["Na Fianna", "Kilmacud Crokes", "Ballyboden"] {
            store.insert(club(name, loser.id(), loser_d1.id())).unwrap();
        }
        store.insert(club("Cuala", loser.id(), loser_d2.id())).unwrap();
        Fixture {
            store,
            survivor,
            loser,
            survivor_d1,
            loser_d1,
            loser_d2,
        }
    }

    #[tokio::test]
    async fn region_conflict_merge_moves_clubs_to_existing_region() {
        let fx = region_conflict_fixture();
        let plan = MergePlanner::default()
            .plan_merge(&fx.store, &[fx.survivor.clone(), fx.loser.clone()])
            .await
            .unwrap();

        let report = MergeExecutor::new(&fx.store, BackoffPolicy::none())
            .execute(&plan)
            .await;

        assert!(!report.halted);
        assert!(report.faults.is_empty());
        assert_eq!(report.applied(), plan.operations.len());
        assert_eq!(report.reassigned[&ChildKind::ClubsOfRegion], 3);
        assert_eq!(report.reassigned[&ChildKind::RegionsOfCountry], 1);
        assert_eq!(report.reassigned[&ChildKind::ClubsOfCountry], 4);
        assert_eq!(report.deleted[&EntityKind::Region], 1);
        assert_eq!(report.deleted[&EntityKind::Country], 1);

        let store = &fx.store;
        assert_eq!(store.count_children(fx.survivor_d1.id(), ChildKind::ClubsOfRegion).await.unwrap(), 3);
        assert_eq!(store.count_children(fx.survivor.id(), ChildKind::RegionsOfCountry).await.unwrap(), 2);
        assert_eq!(store.count_children(fx.survivor.id(), ChildKind::ClubsOfCountry).await.unwrap(), 4);
        assert!(store
            .find_first(EntityKind::Region, &[Filter::Id(fx.loser_d1.id())])
            .await
            .unwrap()
            .is_none());
        let moved = store
            .find_first(EntityKind::Region, &[Filter::Id(fx.loser_d2.id())])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.parent_id(refmerge_core::ForeignKey::CountryId), Some(fx.survivor.id()));
        assert_eq!(store.len(EntityKind::Country), 1);
    }

    #[tokio::test]
    async fn delete_with_remaining_children_aborts_the_plan() {
        let fx = region_conflict_fixture();
        let operations = vec![
            MergeOperation::DeleteEntity {
                kind: EntityKind::Country,
                id: fx.loser.id(),
            },
            MergeOperation::ReassignChildren {
                from: fx.loser.id(),
                to: fx.survivor.id(),
                child: ChildKind::ClubsOfCountry,
            },
        ];

        let report = MergeExecutor::new(&fx.store, BackoffPolicy::none())
            .execute_operations("bad plan", &operations)
            .await;

        assert!(report.halted);
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].kind, FaultKind::Invariant);
        assert_eq!(report.faults[0].step, Some(0));
        assert!(report.faults[0].message.contains("still has 2 rows"));
        assert_eq!(report.steps[0].status, StepStatus::Failed);
        assert_eq!(report.steps[1].status, StepStatus::NotRun);
        assert_eq!(fx.store.len(EntityKind::Country), 2);
    }

    #[tokio::test]
    async fn store_fault_halts_and_keeps_applied_steps() {
        let fx = region_conflict_fixture();
        let plan = MergePlanner::default()
            .plan_merge(&fx.store, &[fx.survivor.clone(), fx.loser.clone()])
            .await
            .unwrap();
        let store = FlakyStore::new(
            fx.store,
            EntityKind::Region,
            StoreError::Backend("disk full".into()),
            usize::MAX,
        );

        let report = MergeExecutor::new(&store, fast_retry()).execute(&plan).await;

        assert!(report.halted);
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].kind, FaultKind::Store);
        // non-retryable: a single attempt
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        let statuses = report.steps.iter().map(|s| s.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Applied,
                StepStatus::Applied,
                StepStatus::Failed,
                StepStatus::NotRun,
                StepStatus::NotRun,
            ]
        );
        // fail-forward: the absorbed clubs stay where they were moved
        assert_eq!(
            store
                .count_children(fx.survivor_d1.id(), ChildKind::ClubsOfRegion)
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried() {
        let fx = region_conflict_fixture();
        let plan = MergePlanner::default()
            .plan_merge(&fx.store, &[fx.survivor.clone(), fx.loser.clone()])
            .await
            .unwrap();
        let store = FlakyStore::new(
            fx.store,
            EntityKind::Region,
            StoreError::Unavailable("connection reset".into()),
            2,
        );

        let report = MergeExecutor::new(&store, fast_retry()).execute(&plan).await;

        assert!(!report.halted);
        assert!(report.faults.is_empty());
        assert_eq!(report.steps[2].attempts, 3);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unique_violation_skips_the_step_and_continues() {
        let fx = region_conflict_fixture();
        let operations = vec![
            MergeOperation::RenameOrRecode {
                kind: EntityKind::Country,
                id: fx.loser.id(),
                patch: EntityPatch {
                    name: None,
                    code: Some("IRL".into()),
                },
            },
            MergeOperation::RenameOrRecode {
                kind: EntityKind::Country,
                id: fx.survivor.id(),
                patch: EntityPatch {
                    name: Some("Éire".into()),
                    code: None,
                },
            },
        ];

        let report = MergeExecutor::new(&fx.store, BackoffPolicy::none())
            .execute_operations("recode", &operations)
            .await;

        assert!(!report.halted);
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].kind, FaultKind::Conflict);
        assert_eq!(report.steps[0].status, StepStatus::Skipped);
        assert_eq!(report.steps[1].status, StepStatus::Applied);
        assert_eq!(report.updated, 1);
        let renamed = fx
            .store
            .find_first(EntityKind::Country, &[Filter::Id(fx.survivor.id())])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.name(), "Éire");
    }
}
