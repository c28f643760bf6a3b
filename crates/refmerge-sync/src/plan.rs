//! Survivor selection and merge planning.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use refmerge_core::{ChildKind, Entity, EntityKind, EntityPatch, EntityRef, ForeignKey};
use refmerge_storage::{ReferenceStore, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::report::Fault;

/// Codes containing `_` are legacy spellings and rank behind any plain code.
pub const UNDERSCORE_PENALTY: usize = 1000;

/// Per-kind mapping tables injected from configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct KindRules {
    /// Preferred survivor codes, best first.
    #[serde(default)]
    pub canonical_codes: Vec<String>,
    /// code -> display name the survivor should carry.
    #[serde(default)]
    pub canonical_names: BTreeMap<String, String>,
    /// loser code -> survivor code, for entities the detector leaves alone.
    #[serde(default)]
    pub fallback: BTreeMap<String, String>,
    /// old code -> new code.
    #[serde(default)]
    pub recodes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MergeOperation {
    ReassignChildren {
        from: Uuid,
        to: Uuid,
        child: ChildKind,
    },
    /// Points the children of `parent` at `to` through a second foreign key, so they
    /// follow their parent into its new scope.
    RealignChildren {
        parent: Uuid,
        child: ChildKind,
        key: ForeignKey,
        to: Uuid,
    },
    RenameOrRecode {
        kind: EntityKind,
        id: Uuid,
        patch: EntityPatch,
    },
    DeleteEntity {
        kind: EntityKind,
        id: Uuid,
    },
}

impl fmt::Display for MergeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeOperation::ReassignChildren { from, to, child } => {
                write!(f, "reassign {child} {from} -> {to}")
            }
            MergeOperation::RealignChildren {
                parent,
                child,
                key,
                to,
            } => write!(f, "realign {child} of {parent} {} -> {to}", key.column()),
            MergeOperation::RenameOrRecode { kind, id, patch } => {
                write!(f, "update {kind} {id}")?;
                if let Some(code) = &patch.code {
                    write!(f, " code={code}")?;
                }
                if let Some(name) = &patch.name {
                    write!(f, " name={name:?}")?;
                }
                Ok(())
            }
            MergeOperation::DeleteEntity { kind, id } => write!(f, "delete {kind} {id}"),
        }
    }
}

/// SHA-256 hex digest over one operation per line.
pub fn fingerprint_operations(operations: &[MergeOperation]) -> String {
    let mut hasher = Sha256::new();
    for operation in operations {
        hasher.update(operation.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct MergePlan {
    pub kind: EntityKind,
    pub survivor: EntityRef,
    /// Losers whose deletion is scheduled.
    pub losers: Vec<EntityRef>,
    pub operations: Vec<MergeOperation>,
    /// Planning-time conflicts; the affected moves are not in `operations`.
    pub conflicts: Vec<Fault>,
    /// Losers kept alive because a child could not be placed.
    pub retained: Vec<EntityRef>,
}

impl MergePlan {
    pub fn fingerprint(&self) -> String {
        fingerprint_operations(&self.operations)
    }

    pub fn is_noop(&self) -> bool {
        self.operations.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot plan a merge for an empty cluster")]
    EmptyCluster,
    #[error("cluster mixes {expected} with {found}")]
    MixedKinds {
        expected: EntityKind,
        found: EntityKind,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Renames and recodes for entities no merge touched.
#[derive(Debug, Clone, Default)]
pub struct NormalizationPlan {
    pub operations: Vec<MergeOperation>,
    pub conflicts: Vec<Fault>,
}

#[derive(Debug, Clone, Default)]
pub struct MergePlanner {
    rules: KindRules,
}

impl MergePlanner {
    pub fn new(rules: KindRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &KindRules {
        &self.rules
    }

    /// Index of the survivor within `cluster`, `None` only for an empty cluster.
    pub fn select_survivor(&self, cluster: &[Entity]) -> Option<usize> {
        cluster
            .iter()
            .enumerate()
            .min_by_key(|(index, entity)| self.survivor_rank(*index, entity))
            .map(|(index, _)| index)
    }

    fn survivor_rank(&self, index: usize, entity: &Entity) -> (usize, usize, usize) {
        let Some(code) = entity.code() else {
            return (usize::MAX, usize::MAX, index);
        };
        if let Some(position) = self.rules.canonical_codes.iter().position(|c| c == code) {
            return (position, 0, index);
        }
        let penalty = if code.contains('_') { UNDERSCORE_PENALTY } else { 0 };
        (usize::MAX, code.chars().count() + penalty, index)
    }

    pub async fn plan_merge(
        &self,
        store: &dyn ReferenceStore,
        cluster: &[Entity],
    ) -> Result<MergePlan, PlanError> {
        let index = self.select_survivor(cluster).ok_or(PlanError::EmptyCluster)?;
        let survivor = &cluster[index];
        let losers = cluster
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, entity)| entity.clone())
            .collect::<Vec<_>>();
        self.plan_merge_into(store, survivor, &losers).await
    }

    /// Plans folding `losers` into an already chosen survivor. Every child collection of
    /// each loser is moved before the loser's delete is scheduled.
    pub async fn plan_merge_into(
        &self,
        store: &dyn ReferenceStore,
        survivor: &Entity,
        losers: &[Entity],
    ) -> Result<MergePlan, PlanError> {
        let kind = survivor.kind();
        if let Some(other) = losers.iter().find(|l| l.kind() != kind) {
            return Err(PlanError::MixedKinds {
                expected: kind,
                found: other.kind(),
            });
        }

        let mut plan = MergePlan {
            kind,
            survivor: survivor.to_ref(),
            losers: Vec::new(),
            operations: Vec::new(),
            conflicts: Vec::new(),
            retained: Vec::new(),
        };

        // code -> survivor-side children, grown as regions are planned to move across
        let mut survivor_codes: HashMap<ChildKind, HashMap<String, Vec<Uuid>>> = HashMap::new();
        for child in kind.child_kinds().iter().filter(|c| c.code_unique_within_parent()) {
            let existing = store
                .find_all(child.entity_kind(), &[child.filter(survivor.id())])
                .await?;
            let mut by_code: HashMap<String, Vec<Uuid>> = HashMap::new();
            for entity in existing {
                if let Some(code) = entity.code() {
                    by_code.entry(code.to_string()).or_default().push(entity.id());
                }
            }
            survivor_codes.insert(*child, by_code);
        }

        for loser in losers.iter().filter(|l| l.id() != survivor.id()) {
            let mut operations = Vec::new();
            let mut blocked = false;

            for child in kind.child_kinds() {
                operations.extend(realign_operations(survivor, loser, *child));
                if !child.code_unique_within_parent() {
                    operations.push(MergeOperation::ReassignChildren {
                        from: loser.id(),
                        to: survivor.id(),
                        child: *child,
                    });
                    continue;
                }

                let by_code = survivor_codes.entry(*child).or_default();
                let siblings = store
                    .find_all(child.entity_kind(), &[child.filter(loser.id())])
                    .await?;
                let mut moving = Vec::new();
                let mut child_blocked = false;

                for sibling in &siblings {
                    let Some(code) = sibling.code() else {
                        continue;
                    };
                    match by_code.get(code).map(Vec::as_slice) {
                        None | Some([]) => moving.push((code.to_string(), sibling.id())),
                        Some([target]) => {
                            debug!(code, from = %sibling.id(), to = %target, "absorbing colliding child");
                            for grandchild in sibling.kind().child_kinds() {
                                operations.push(MergeOperation::ReassignChildren {
                                    from: sibling.id(),
                                    to: *target,
                                    child: *grandchild,
                                });
                            }
                            operations.push(MergeOperation::DeleteEntity {
                                kind: sibling.kind(),
                                id: sibling.id(),
                            });
                        }
                        Some(targets) => {
                            warn!(code, candidates = targets.len(), "ambiguous merge target");
                            plan.conflicts.push(Fault::conflict(
                                sibling.to_ref().to_string(),
                                format!(
                                    "{} of {} already hold code {code}; left under {}",
                                    targets.len(),
                                    survivor.to_ref(),
                                    loser.to_ref()
                                ),
                            ));
                            child_blocked = true;
                        }
                    }
                }

                if child_blocked {
                    blocked = true;
                    continue;
                }
                operations.push(MergeOperation::ReassignChildren {
                    from: loser.id(),
                    to: survivor.id(),
                    child: *child,
                });
                for (code, id) in moving {
                    by_code.entry(code).or_default().push(id);
                }
            }

            if blocked {
                plan.retained.push(loser.to_ref());
            } else {
                operations.push(MergeOperation::DeleteEntity {
                    kind,
                    id: loser.id(),
                });
                plan.losers.push(loser.to_ref());
            }
            plan.operations.extend(operations);
        }

        if let Some(patch) = self.canonical_name_patch(survivor, survivor.code()) {
            plan.operations.push(MergeOperation::RenameOrRecode {
                kind,
                id: survivor.id(),
                patch,
            });
        }

        Ok(plan)
    }

    fn canonical_name_patch(&self, entity: &Entity, code: Option<&str>) -> Option<EntityPatch> {
        let name = self.rules.canonical_names.get(code?)?;
        (name != entity.name()).then(|| EntityPatch {
            name: Some(name.clone()),
            code: None,
        })
    }

    /// Canonical names and recodes for every live entity of `kind` outside `skip`.
    pub async fn plan_normalization(
        &self,
        store: &dyn ReferenceStore,
        kind: EntityKind,
        skip: &HashSet<Uuid>,
    ) -> Result<NormalizationPlan, PlanError> {
        let mut plan = NormalizationPlan::default();
        if !kind.has_code() {
            return Ok(plan);
        }
        let entities = store.find_all(kind, &[]).await?;
        let mut taken = entities
            .iter()
            .filter_map(|e| Some(code_scope(e, e.code()?)))
            .collect::<HashSet<_>>();

        for entity in entities.iter().filter(|e| !skip.contains(&e.id())) {
            let Some(code) = entity.code() else {
                continue;
            };
            let mut patch = EntityPatch::default();

            if let Some(new_code) = self.rules.recodes.get(code).filter(|c| c.as_str() != code) {
                let scope = code_scope(entity, new_code);
                if taken.contains(&scope) {
                    plan.conflicts.push(Fault::conflict(
                        entity.to_ref().to_string(),
                        format!("recode {code} -> {new_code} collides with a live {kind}"),
                    ));
                } else {
                    taken.remove(&code_scope(entity, code));
                    taken.insert(scope);
                    patch.code = Some(new_code.clone());
                }
            }

            let effective = patch.code.as_deref().unwrap_or(code);
            if let Some(rename) = self.canonical_name_patch(entity, Some(effective)) {
                patch.name = rename.name;
            }

            if !patch.is_empty() {
                plan.operations.push(MergeOperation::RenameOrRecode {
                    kind,
                    id: entity.id(),
                    patch,
                });
            }
        }

        Ok(plan)
    }
}

/// Unique-key scope of a code: global for units and countries, per country for regions.
fn code_scope(entity: &Entity, code: &str) -> (Option<Uuid>, String) {
    let parent = match entity {
        Entity::Region(region) => Some(region.country_id),
        _ => None,
    };
    (parent, code.to_string())
}

/// Children that also point at the loser's own parent are moved to the survivor's parent,
/// e.g. clubs of a country merged across units take the surviving country's unit.
fn realign_operations(survivor: &Entity, loser: &Entity, child: ChildKind) -> Vec<MergeOperation> {
    survivor
        .kind()
        .foreign_keys()
        .iter()
        .filter(|key| child.entity_kind().foreign_keys().contains(key))
        .filter_map(|key| {
            let to = survivor.parent_id(*key)?;
            (loser.parent_id(*key) != Some(to)).then_some(MergeOperation::RealignChildren {
                parent: loser.id(),
                child,
                key: *key,
                to,
            })
        })
        .collect()
}
