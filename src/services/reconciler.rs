//! 字段合并服务 - 业务能力层
//!
//! 把一个新的候选集合并进当前权威记录，逐字段决定保留哪一方：
//!
//! 1. 当前值被人工锁定 → 保留当前值，来源记为 `user_edit`（最高优先级）
//! 2. 当前为空、候选有值 → 采用候选值
//! 3. 当前有值、候选为空 → 保留当前值
//! 4. 双方都有值 → 置信度高者胜；置信度相同时采用后合并的候选值，
//!    来源记为 `post_call_tie`
//! 5. 双方都为空 → 保持为空
//!
//! 合并是纯函数，没有 I/O，可以安全重跑。
//!
//! 平局偏向候选值，所以调用方必须按时间顺序合并。这个前置条件由
//! `observed_at` / `as_of` 显式检查：较早的候选集会被 [`reconcile`] 拒绝，
//! 调用方可以改用 [`backfill`]，只补空字段。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ReconcileError;
use crate::models::candidate::{
    AuthoritativeRecord, CandidateFieldSet, CandidateSource, ConfidenceMap, FieldSlot,
    FieldSources, SourceLabel, USER_EDIT_CONFIDENCE,
};
use crate::models::field::{FieldName, FieldValues};

/// 双方值不同时被丢弃的一方（审计用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub field: FieldName,
    pub kept: String,
    pub discarded: String,
    pub kept_source: SourceLabel,
}

/// 合并结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub merged_fields: FieldValues,
    pub merged_confidence: ConfidenceMap,
    pub field_sources: FieldSources,
    pub overall_confidence: f64,
    pub conflicts: Vec<FieldConflict>,
    #[serde(skip)]
    pub record: AuthoritativeRecord,
}

impl MergeResult {
    fn from_record(record: AuthoritativeRecord, conflicts: Vec<FieldConflict>) -> Self {
        Self {
            merged_fields: record.fields(),
            merged_confidence: record.confidence_map(),
            field_sources: record.sources.clone(),
            overall_confidence: record.overall_confidence(),
            conflicts,
            record,
        }
    }

    pub fn into_record(self) -> AuthoritativeRecord {
        self.record
    }
}

/// 单字段的合并结果
struct FieldOutcome {
    slot: FieldSlot,
    source: Option<SourceLabel>,
    lock_mark: Option<f64>,
    conflict: Option<FieldConflict>,
}

/// 把候选集合并进权威记录
///
/// 候选集的观测时间早于记录的 `as_of` 时返回 [`ReconcileError::OutOfOrder`]
pub fn reconcile(
    existing: &AuthoritativeRecord,
    incoming: &CandidateFieldSet,
) -> Result<MergeResult, ReconcileError> {
    if let Some(as_of) = existing.as_of {
        if incoming.observed_at < as_of {
            return Err(ReconcileError::OutOfOrder {
                observed_at: incoming.observed_at,
                as_of,
            });
        }
    }

    let incoming_label = incoming.source.label();
    let mut record = AuthoritativeRecord::empty();
    let mut conflicts = Vec::new();

    for field in FieldName::ALL {
        let outcome = merge_field(
            field,
            existing.slot(field),
            existing.source(field),
            existing.lock_marks.get(&field).copied(),
            incoming.slot(field),
            incoming_label,
            incoming.confidence.get(&field).copied(),
        );
        apply_outcome(&mut record, &mut conflicts, field, outcome);
    }

    record.as_of = Some(latest(existing.as_of, incoming.observed_at));
    log_merge("合并", incoming.source, &conflicts, &record);

    Ok(MergeResult::from_record(record, conflicts))
}

/// 过期候选集的合并：只补当前为空的字段，从不覆盖、不参与平局
pub fn backfill(existing: &AuthoritativeRecord, incoming: &CandidateFieldSet) -> MergeResult {
    let incoming_label = incoming.source.label();
    let mut record = existing.clone();

    for field in FieldName::ALL {
        if !existing.slot(field).is_unset() {
            continue;
        }
        let slot = incoming.slot(field);
        if slot.is_unset() {
            continue;
        }
        if slot.is_locked() {
            record.lock_marks.insert(
                field,
                incoming_lock_mark(incoming.confidence.get(&field).copied()),
            );
        }
        record.sources.insert(field, incoming_label);
        record.slots.insert(field, slot);
    }

    record.as_of = Some(latest(existing.as_of, incoming.observed_at));
    log_merge("补齐", incoming.source, &[], &record);

    MergeResult::from_record(record, Vec::new())
}

/// 操作员手工修改：每个非空字段都被锁定，替换之前的值（包括之前的锁定）
pub fn apply_manual_edit(
    existing: &AuthoritativeRecord,
    edits: &FieldValues,
    edited_at: DateTime<Utc>,
) -> MergeResult {
    let mut record = existing.clone();
    let mut conflicts = Vec::new();

    for (field, value) in edits.iter() {
        if let Some(previous) = existing.slot(field).value() {
            if previous != value {
                conflicts.push(FieldConflict {
                    field,
                    kept: value.to_string(),
                    discarded: previous.to_string(),
                    kept_source: SourceLabel::UserEdit,
                });
            }
        }
        record.slots.insert(
            field,
            FieldSlot::Locked {
                value: Some(value.to_string()),
            },
        );
        record.sources.insert(field, SourceLabel::UserEdit);
        record.lock_marks.insert(field, USER_EDIT_CONFIDENCE);
    }

    record.as_of = Some(latest(existing.as_of, edited_at));
    log_merge("人工修改", CandidateSource::UserEdit, &conflicts, &record);

    MergeResult::from_record(record, conflicts)
}

/// 面向旧式“字符串键 + 数值置信度”的合并入口
///
/// 键名不在字段表中视为调用方违反字段表约束
pub fn reconcile_maps(
    existing_fields: &BTreeMap<String, String>,
    existing_confidence: &BTreeMap<String, f64>,
    incoming_fields: &BTreeMap<String, String>,
    incoming_confidence: &BTreeMap<String, f64>,
    incoming_source: CandidateSource,
) -> Result<MergeResult, ReconcileError> {
    let (fields, confidence) = typed_maps(existing_fields, existing_confidence)?;
    let existing = AuthoritativeRecord::from_maps(&fields, &confidence, &FieldSources::new(), None);

    let (fields, confidence) = typed_maps(incoming_fields, incoming_confidence)?;
    let mut incoming = CandidateFieldSet::new(incoming_source, Utc::now());
    incoming.fields = fields;
    incoming.confidence = confidence;

    reconcile(&existing, &incoming)
}

fn typed_maps(
    fields: &BTreeMap<String, String>,
    confidence: &BTreeMap<String, f64>,
) -> Result<(FieldValues, ConfidenceMap), ReconcileError> {
    let resolve = |key: &String| {
        FieldName::from_key(key).ok_or_else(|| ReconcileError::UnknownField { key: key.clone() })
    };

    let mut typed_fields = FieldValues::new();
    for (key, value) in fields {
        typed_fields.set(resolve(key)?, value);
    }
    let mut typed_confidence = ConfidenceMap::new();
    for (key, value) in confidence {
        typed_confidence.insert(resolve(key)?, *value);
    }
    Ok((typed_fields, typed_confidence))
}

fn merge_field(
    field: FieldName,
    existing: &FieldSlot,
    existing_source: Option<SourceLabel>,
    existing_mark: Option<f64>,
    incoming: FieldSlot,
    incoming_label: SourceLabel,
    incoming_confidence: Option<f64>,
) -> FieldOutcome {
    let keep_existing = |conflict: Option<FieldConflict>| FieldOutcome {
        slot: existing.clone(),
        source: existing_source,
        lock_mark: existing_mark,
        conflict,
    };
    let conflict_with = |kept: &str, discarded: &str, kept_source: SourceLabel| {
        (kept != discarded).then(|| FieldConflict {
            field,
            kept: kept.to_string(),
            discarded: discarded.to_string(),
            kept_source,
        })
    };

    match (existing, &incoming) {
        // 1. 人工锁定，候选集一律忽略
        (FieldSlot::Locked { value }, _) => {
            let conflict = value.as_deref().zip(incoming.value()).and_then(|(kept, other)| {
                conflict_with(kept, other, SourceLabel::UserEdit)
            });
            FieldOutcome {
                slot: existing.clone(),
                source: Some(SourceLabel::UserEdit),
                lock_mark: existing_mark,
                conflict,
            }
        }

        // 5. 双方都为空
        (FieldSlot::Unset, FieldSlot::Unset) => FieldOutcome {
            slot: FieldSlot::Unset,
            source: None,
            lock_mark: None,
            conflict: None,
        },

        // 3. 候选为空，保留当前值
        (_, FieldSlot::Unset) | (_, FieldSlot::Locked { value: None }) => keep_existing(None),

        // 2. 当前为空，采用候选值
        (FieldSlot::Unset, _) => adopt(incoming.clone(), incoming_label, incoming_confidence, None),

        // 人工修改的候选值覆盖自动推断的当前值
        (FieldSlot::Inferred { value, .. }, FieldSlot::Locked { value: Some(new_value) }) => {
            let conflict = conflict_with(new_value, value, incoming_label);
            adopt(incoming.clone(), incoming_label, incoming_confidence, conflict)
        }

        // 4. 双方都是自动推断
        (
            FieldSlot::Inferred {
                value,
                confidence: current,
            },
            FieldSlot::Inferred {
                value: new_value,
                confidence: candidate,
            },
        ) => {
            let (current, candidate) = (*current, *candidate);
            if value == new_value {
                // 同值：置信度更高才换来源，保证重复合并不改变结果
                if candidate > current {
                    adopt(incoming.clone(), incoming_label, incoming_confidence, None)
                } else {
                    keep_existing(None)
                }
            } else if candidate > current {
                let conflict = conflict_with(new_value, value, incoming_label);
                adopt(incoming.clone(), incoming_label, incoming_confidence, conflict)
            } else if candidate < current {
                let kept_source = existing_source.unwrap_or(incoming_label);
                keep_existing(conflict_with(value, new_value, kept_source))
            } else {
                let conflict = conflict_with(new_value, value, SourceLabel::PostCallTie);
                adopt(
                    incoming.clone(),
                    SourceLabel::PostCallTie,
                    incoming_confidence,
                    conflict,
                )
            }
        }
    }
}

fn adopt(
    incoming: FieldSlot,
    label: SourceLabel,
    incoming_confidence: Option<f64>,
    conflict: Option<FieldConflict>,
) -> FieldOutcome {
    let lock_mark = incoming
        .is_locked()
        .then(|| incoming_lock_mark(incoming_confidence));
    FieldOutcome {
        slot: incoming,
        source: Some(label),
        lock_mark,
        conflict,
    }
}

/// 候选集自带的标记值（> 1.0）原样保留，否则使用默认标记
fn incoming_lock_mark(confidence: Option<f64>) -> f64 {
    confidence
        .filter(|c| *c > 1.0)
        .unwrap_or(USER_EDIT_CONFIDENCE)
}

fn apply_outcome(
    record: &mut AuthoritativeRecord,
    conflicts: &mut Vec<FieldConflict>,
    field: FieldName,
    outcome: FieldOutcome,
) {
    if let Some(conflict) = outcome.conflict {
        conflicts.push(conflict);
    }
    if outcome.slot.is_unset() {
        return;
    }
    if let Some(source) = outcome.source {
        record.sources.insert(field, source);
    }
    if let Some(mark) = outcome.lock_mark {
        record.lock_marks.insert(field, mark);
    }
    record.slots.insert(field, outcome.slot);
}

fn latest(a: Option<DateTime<Utc>>, b: DateTime<Utc>) -> DateTime<Utc> {
    match a {
        Some(a) if a > b => a,
        _ => b,
    }
}

fn log_merge(
    action: &str,
    source: CandidateSource,
    conflicts: &[FieldConflict],
    record: &AuthoritativeRecord,
) {
    debug!(
        "{}完成 (来源: {:?}): {} 个字段, {} 处冲突, 整体置信度 {:.2}",
        action,
        source,
        record.slots.len(),
        conflicts.len(),
        record.overall_confidence()
    );
    for conflict in conflicts {
        debug!(
            "  冲突 {}: 保留 '{}' ({}), 丢弃 '{}'",
            conflict.field, conflict.kept, conflict.kept_source, conflict.discarded
        );
    }
}
