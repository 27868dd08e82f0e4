//! 候选集与权威记录
//!
//! 每个字段在权威记录中是一个 [`FieldSlot`]：未设置、自动推断（带置信度）、
//! 或人工锁定。人工锁定的字段不会被任何自动合并覆盖。
//!
//! 对外的置信度表仍然使用数值约定：大于 1.0 表示人工修改。
//! 数值只在 [`FieldSlot::from_parts`] 和 [`AuthoritativeRecord::confidence_map`] 处转换。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::field::{FieldName, FieldValues};

/// 来源未给出置信度时使用的默认值
pub const DEFAULT_CONFIDENCE: f64 = 0.7;

/// 人工修改在置信度表中的标记值
pub const USER_EDIT_CONFIDENCE: f64 = 2.0;

/// 整体置信度低于该值时需要人工复核
pub const MANUAL_REVIEW_THRESHOLD: f64 = 0.5;

/// 字段名 → 置信度
pub type ConfidenceMap = BTreeMap<FieldName, f64>;

/// 字段名 → 来源标签
pub type FieldSources = BTreeMap<FieldName, SourceLabel>;

/// 候选集来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// 通话中实时采集
    Realtime,
    /// 通话结束后重新转写抽取
    PostCall,
    /// 操作员手工修改
    UserEdit,
}

impl CandidateSource {
    pub fn label(self) -> SourceLabel {
        match self {
            CandidateSource::Realtime => SourceLabel::Realtime,
            CandidateSource::PostCall => SourceLabel::PostCall,
            CandidateSource::UserEdit => SourceLabel::UserEdit,
        }
    }
}

/// 权威值的来源（审计用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLabel {
    Realtime,
    PostCall,
    UserEdit,
    /// 置信度相同、采用了后合并一方
    PostCallTie,
}

impl SourceLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceLabel::Realtime => "realtime",
            SourceLabel::PostCall => "post_call",
            SourceLabel::UserEdit => "user_edit",
            SourceLabel::PostCallTie => "post_call_tie",
        }
    }
}

impl std::fmt::Display for SourceLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个字段的状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldSlot {
    Unset,
    Inferred { value: String, confidence: f64 },
    /// 人工锁定；人工标记了置信度但没有给值时 `value` 为 None，字段保持为空
    Locked { value: Option<String> },
}

impl FieldSlot {
    /// 由“值 + 数值置信度”构造
    ///
    /// 置信度大于 1.0 视为人工锁定（即使没有值）；缺省置信度取 [`DEFAULT_CONFIDENCE`]
    pub fn from_parts(value: Option<&str>, confidence: Option<f64>) -> Self {
        let value = value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        if confidence.is_some_and(|c| c > 1.0) {
            return FieldSlot::Locked { value };
        }
        let Some(value) = value else {
            return FieldSlot::Unset;
        };
        match confidence {
            Some(c) => FieldSlot::Inferred {
                value,
                confidence: c.max(0.0),
            },
            None => FieldSlot::Inferred {
                value,
                confidence: DEFAULT_CONFIDENCE,
            },
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            FieldSlot::Unset => None,
            FieldSlot::Inferred { value, .. } => Some(value),
            FieldSlot::Locked { value } => value.as_deref(),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, FieldSlot::Locked { .. })
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, FieldSlot::Unset)
    }

    /// 自动推断的置信度；锁定或未设置时为 None
    pub fn inferred_confidence(&self) -> Option<f64> {
        match self {
            FieldSlot::Inferred { confidence, .. } => Some(*confidence),
            _ => None,
        }
    }
}

/// 单一来源给出的候选字段集
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFieldSet {
    pub source: CandidateSource,
    pub fields: FieldValues,
    pub confidence: ConfidenceMap,
    /// 候选数据的观测时间，合并顺序以此为准
    pub observed_at: DateTime<Utc>,
}

impl CandidateFieldSet {
    pub fn new(source: CandidateSource, observed_at: DateTime<Utc>) -> Self {
        Self {
            source,
            fields: FieldValues::new(),
            confidence: ConfidenceMap::new(),
            observed_at,
        }
    }

    /// 写入字段值与置信度，值规范化后为空则忽略
    pub fn insert(&mut self, field: FieldName, raw: &str, confidence: Option<f64>) -> bool {
        if !self.fields.set(field, raw) {
            return false;
        }
        match confidence {
            Some(c) => {
                self.confidence.insert(field, c);
            }
            None => {
                self.confidence.remove(&field);
            }
        }
        true
    }

    /// 取某个字段的槽位视图；手工修改来源的所有字段都视为锁定
    ///
    /// 候选集没有给值的字段一律视为未设置
    pub fn slot(&self, field: FieldName) -> FieldSlot {
        let Some(value) = self.fields.get(field) else {
            return FieldSlot::Unset;
        };
        if self.source == CandidateSource::UserEdit {
            return FieldSlot::Locked {
                value: Some(value.to_string()),
            };
        }
        FieldSlot::from_parts(Some(value), self.confidence.get(&field).copied())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// 权威记录：合并后的字段槽位与来源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthoritativeRecord {
    pub slots: BTreeMap<FieldName, FieldSlot>,
    pub sources: FieldSources,
    /// 锁定字段原始的标记值，导出置信度表时保持不变
    #[serde(default)]
    pub lock_marks: ConfidenceMap,
    /// 已合并的最新候选集观测时间
    pub as_of: Option<DateTime<Utc>>,
}

impl Default for AuthoritativeRecord {
    fn default() -> Self {
        Self::empty()
    }
}

impl AuthoritativeRecord {
    pub fn empty() -> Self {
        Self {
            slots: BTreeMap::new(),
            sources: FieldSources::new(),
            lock_marks: ConfidenceMap::new(),
            as_of: None,
        }
    }

    /// 从旧式“取值表 + 置信度表 + 来源表”构造
    ///
    /// 置信度表里的人工标记即使没有对应的值也会生成锁定槽位
    pub fn from_maps(
        fields: &FieldValues,
        confidence: &ConfidenceMap,
        sources: &FieldSources,
        as_of: Option<DateTime<Utc>>,
    ) -> Self {
        let mut record = Self::empty();
        record.as_of = as_of;
        for field in FieldName::ALL {
            let mark = confidence.get(&field).copied();
            let slot = FieldSlot::from_parts(fields.get(field), mark);
            if slot.is_unset() {
                continue;
            }
            let label = sources.get(&field).copied();
            if slot.is_locked() {
                if let Some(m) = mark {
                    record.lock_marks.insert(field, m);
                }
                record
                    .sources
                    .insert(field, label.unwrap_or(SourceLabel::UserEdit));
            } else if let Some(label) = label {
                record.sources.insert(field, label);
            }
            record.slots.insert(field, slot);
        }
        record
    }

    pub fn slot(&self, field: FieldName) -> &FieldSlot {
        static UNSET: FieldSlot = FieldSlot::Unset;
        self.slots.get(&field).unwrap_or(&UNSET)
    }

    pub fn source(&self, field: FieldName) -> Option<SourceLabel> {
        self.sources.get(&field).copied()
    }

    /// 当前取值表
    pub fn fields(&self) -> FieldValues {
        FieldValues(
            self.slots
                .iter()
                .filter_map(|(field, slot)| slot.value().map(|v| (*field, v.to_string())))
                .collect(),
        )
    }

    /// 导出置信度表，锁定字段输出标记值（> 1.0）
    pub fn confidence_map(&self) -> ConfidenceMap {
        self.slots
            .iter()
            .filter_map(|(field, slot)| match slot {
                FieldSlot::Unset => None,
                FieldSlot::Inferred { confidence, .. } => Some((*field, *confidence)),
                FieldSlot::Locked { .. } => Some((
                    *field,
                    self.lock_marks
                        .get(field)
                        .copied()
                        .unwrap_or(USER_EDIT_CONFIDENCE),
                )),
            })
            .collect()
    }

    /// 整体置信度
    pub fn overall_confidence(&self) -> f64 {
        overall_confidence(&self.confidence_map())
    }

    pub fn is_empty(&self) -> bool {
        self.slots.values().all(FieldSlot::is_unset)
    }
}

/// 整体置信度：不超过 1.0 的置信度的算术平均
///
/// 人工修改的标记值不参与平均；没有可平均的值时为 0
pub fn overall_confidence(confidence: &ConfidenceMap) -> f64 {
    let automated: Vec<f64> = confidence.values().copied().filter(|c| *c <= 1.0).collect();
    if automated.is_empty() {
        return 0.0;
    }
    automated.iter().sum::<f64>() / automated.len() as f64
}

/// 是否需要人工复核
pub fn requires_manual_review(overall: f64) -> bool {
    overall < MANUAL_REVIEW_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_confidence_excludes_sentinel() {
        let mut map = ConfidenceMap::new();
        map.insert(FieldName::FirstName, 0.9);
        map.insert(FieldName::LastName, 1.5);
        map.insert(FieldName::DateOfBirth, 0.6);
        let overall = overall_confidence(&map);
        assert!((overall - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_overall_confidence_of_empty_map_is_zero() {
        assert_eq!(overall_confidence(&ConfidenceMap::new()), 0.0);
        assert!(requires_manual_review(0.0));
    }

    #[test]
    fn test_slot_from_parts() {
        assert_eq!(FieldSlot::from_parts(None, Some(0.9)), FieldSlot::Unset);
        assert_eq!(FieldSlot::from_parts(Some("  "), Some(0.9)), FieldSlot::Unset);
        assert_eq!(
            FieldSlot::from_parts(Some("Ann"), Some(1.5)),
            FieldSlot::Locked {
                value: Some("Ann".to_string())
            }
        );
        // 只有人工标记、没有值，仍然锁定
        assert_eq!(
            FieldSlot::from_parts(None, Some(1.5)),
            FieldSlot::Locked { value: None }
        );
        assert_eq!(
            FieldSlot::from_parts(Some("Ann"), None),
            FieldSlot::Inferred {
                value: "Ann".to_string(),
                confidence: DEFAULT_CONFIDENCE
            }
        );
        // 恰好 1.0 不是人工标记
        assert!(!FieldSlot::from_parts(Some("Ann"), Some(1.0)).is_locked());
    }

    #[test]
    fn test_record_keeps_original_lock_mark() {
        let mut fields = FieldValues::new();
        fields.set(FieldName::LastName, "Smith");
        fields.set(FieldName::FirstName, "Jo");
        let mut confidence = ConfidenceMap::new();
        confidence.insert(FieldName::LastName, 1.5);
        confidence.insert(FieldName::FirstName, 0.4);

        let record = AuthoritativeRecord::from_maps(&fields, &confidence, &FieldSources::new(), None);
        assert!(record.slot(FieldName::LastName).is_locked());
        assert_eq!(record.confidence_map(), confidence);
        assert_eq!(record.fields(), fields);
    }

    #[test]
    fn test_lock_mark_without_value_stays_locked() {
        let mut confidence = ConfidenceMap::new();
        confidence.insert(FieldName::Email, 1.5);

        let record =
            AuthoritativeRecord::from_maps(&FieldValues::new(), &confidence, &FieldSources::new(), None);
        assert_eq!(record.slot(FieldName::Email), &FieldSlot::Locked { value: None });
        assert_eq!(record.source(FieldName::Email), Some(SourceLabel::UserEdit));
        assert_eq!(record.confidence_map(), confidence);
        assert!(record.fields().is_empty());
    }

    #[test]
    fn test_user_edit_candidate_slots_are_locked() {
        let mut candidate = CandidateFieldSet::new(CandidateSource::UserEdit, Utc::now());
        candidate.insert(FieldName::Phone, "555-123-4567", Some(0.2));
        assert!(candidate.slot(FieldName::Phone).is_locked());
        assert!(candidate.slot(FieldName::Email).is_unset());
    }

    #[test]
    fn test_source_labels_serialize_snake_case() {
        let json = serde_json::to_string(&SourceLabel::PostCallTie).unwrap();
        assert_eq!(json, "\"post_call_tie\"");
    }
}
