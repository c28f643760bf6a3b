//! Run-level aggregation handed back to callers. Holds no store handles.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use refmerge_core::{ChildKind, EntityKind, EntityRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execute::ExecutionReport;
use crate::plan::{MergeOperation, MergePlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Malformed input record, skipped.
    Validation,
    /// A step would break a unique key and nothing resolves it.
    Conflict,
    /// The store failed; the plan stops there.
    Store,
    /// An internal consistency check failed.
    Invariant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            step: None,
            message: message.into(),
        }
    }

    pub fn conflict(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Conflict, subject, message)
    }

    pub fn at_step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    /// Validation faults only mark skipped input; everything else fails the run.
    pub fn is_unresolved(&self) -> bool {
        self.kind != FaultKind::Validation
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.subject)?;
        if let Some(step) = self.step {
            write!(f, " (step {step})")?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub subject: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterMemberSummary {
    pub entity: EntityRef,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub survivor: EntityRef,
    pub members: Vec<ClusterMemberSummary>,
    pub via_fallback: bool,
    pub fingerprint: String,
    pub operations: Vec<MergeOperation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub kind: EntityKind,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities_scanned: usize,
    pub clusters: Vec<ClusterSummary>,
    pub planned_operations: usize,
    pub applied_operations: usize,
    pub children_migrated: BTreeMap<ChildKind, u64>,
    pub entities_deleted: BTreeMap<EntityKind, u64>,
    pub entities_updated: u64,
    pub skipped: Vec<SkippedItem>,
    pub faults: Vec<Fault>,
}

impl ReconciliationReport {
    pub fn new(run_id: Uuid, kind: EntityKind, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            kind,
            dry_run,
            started_at: now,
            finished_at: now,
            entities_scanned: 0,
            clusters: Vec::new(),
            planned_operations: 0,
            applied_operations: 0,
            children_migrated: BTreeMap::new(),
            entities_deleted: BTreeMap::new(),
            entities_updated: 0,
            skipped: Vec::new(),
            faults: Vec::new(),
        }
    }

    pub fn record_plan(&mut self, plan: &MergePlan, members: Vec<ClusterMemberSummary>, via_fallback: bool) {
        self.planned_operations += plan.operations.len();
        self.faults.extend(plan.conflicts.iter().cloned());
        if plan.losers.is_empty() && plan.retained.is_empty() {
            return;
        }
        self.clusters.push(ClusterSummary {
            survivor: plan.survivor.clone(),
            members,
            via_fallback,
            fingerprint: plan.fingerprint(),
            operations: plan.operations.clone(),
        });
    }

    pub fn record_execution(&mut self, execution: &ExecutionReport) {
        self.applied_operations += execution.applied();
        for (child, rows) in &execution.reassigned {
            *self.children_migrated.entry(*child).or_default() += rows;
        }
        for (kind, rows) in &execution.deleted {
            *self.entities_deleted.entry(*kind).or_default() += rows;
        }
        self.entities_updated += execution.updated;
        self.faults.extend(execution.faults.iter().cloned());
    }

    pub fn skip(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        self.skipped.push(SkippedItem {
            subject: subject.into(),
            reason: reason.into(),
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn has_unresolved_faults(&self) -> bool {
        self.faults.iter().any(Fault::is_unresolved)
    }

    pub fn unresolved_faults(&self) -> impl Iterator<Item = &Fault> {
        self.faults.iter().filter(|f| f.is_unresolved())
    }

    pub fn total_migrated(&self) -> u64 {
        self.children_migrated.values().sum()
    }

    pub fn total_deleted(&self) -> u64 {
        self.entities_deleted.values().sum()
    }

    pub fn summary_markdown(&self) -> String {
        let mode = if self.dry_run { "dry run" } else { "applied" };
        let mut lines = vec![
            format!("# Reconciliation `{}` ({})", self.run_id, mode),
            String::new(),
            format!("- Kind: {}", self.kind),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Entities scanned: {}", self.entities_scanned),
            format!("- Duplicate clusters: {}", self.clusters.len()),
            format!(
                "- Operations: {} planned, {} applied",
                self.planned_operations, self.applied_operations
            ),
            format!("- Children migrated: {}", self.total_migrated()),
            format!("- Entities deleted: {}", self.total_deleted()),
            format!("- Entities updated: {}", self.entities_updated),
            format!("- Skipped: {}", self.skipped.len()),
            format!("- Faults: {}", self.faults.len()),
        ];

        if !self.children_migrated.is_empty() {
            lines.push(String::new());
            lines.push("## Children Migrated".to_string());
            for (child, rows) in &self.children_migrated {
                lines.push(format!("- {child}: {rows}"));
            }
        }

        if !self.clusters.is_empty() {
            lines.push(String::new());
            lines.push("## Clusters".to_string());
            for cluster in &self.clusters {
                lines.push(format!(
                    "- survivor {}{} [{}]",
                    cluster.survivor,
                    if cluster.via_fallback { " (fallback)" } else { "" },
                    &cluster.fingerprint[..12.min(cluster.fingerprint.len())]
                ));
                for member in &cluster.members {
                    if member.entity.id == cluster.survivor.id {
                        continue;
                    }
                    lines.push(format!(
                        "  - {}: {}",
                        member.entity,
                        member.reason.as_deref().unwrap_or("-")
                    ));
                }
            }
        }

        if !self.skipped.is_empty() {
            lines.push(String::new());
            lines.push("## Skipped".to_string());
            for item in &self.skipped {
                lines.push(format!("- {}: {}", item.subject, item.reason));
            }
        }

        if !self.faults.is_empty() {
            lines.push(String::new());
            lines.push("## Faults".to_string());
            for fault in &self.faults {
                lines.push(format!("- {fault}"));
            }
        }

        lines.push(String::new());
        lines.join("\n")
    }
}
