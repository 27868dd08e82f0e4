//! 抽取结构化服务 - 业务能力层
//!
//! 把识别服务的原始回复整理成候选集：
//! - 键名按字段表解析，不认识的键名记录后丢弃
//! - 取值按字段规则规范化，空值丢弃
//! - 自动来源的置信度限制在 [0, 1]，缺省为 0.7
//! - 整行地址交给地址解析器拆分，只补识别服务没有直接给出的字段

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::candidate::{CandidateFieldSet, CandidateSource, DEFAULT_CONFIDENCE};
use crate::models::field::{FieldName, FieldValues};
use crate::services::address_parser::AddressParser;
use crate::services::recognition::{RecognizedField, RecognizedFields};

/// 识别服务用来返回整行地址的键名（已归一化）
const ADDRESS_KEYS: [&str; 4] = ["address", "fulladdress", "homeaddress", "mailingaddress"];

/// 抽取结构化
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    address_parser: AddressParser,
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            address_parser: AddressParser::new(),
        }
    }

    /// 识别结果 → 候选集
    pub fn structure(
        &self,
        recognized: &RecognizedFields,
        source: CandidateSource,
        observed_at: DateTime<Utc>,
    ) -> CandidateFieldSet {
        let mut candidate = CandidateFieldSet::new(source, observed_at);
        let mut addresses = Vec::new();

        for (key, entry) in &recognized.0 {
            if is_address_key(key) {
                addresses.push(entry);
                continue;
            }
            let Some(field) = FieldName::from_key(key) else {
                warn!("⚠️ 识别结果包含未知字段 '{}'，已忽略", key);
                continue;
            };
            if !candidate.insert(field, &entry.value, automated_confidence(entry.confidence)) {
                debug!("字段 {} 规范化后为空，已忽略", field);
            }
        }

        for entry in addresses {
            self.split_address(&mut candidate, entry);
        }

        debug!(
            "结构化完成 (来源: {:?}): {} 个字段",
            source,
            candidate.fields.len()
        );
        candidate
    }

    /// 手工修改 → 候选集（全部字段视为锁定）
    pub fn from_manual_edits(&self, edits: &FieldValues, observed_at: DateTime<Utc>) -> CandidateFieldSet {
        let mut candidate = CandidateFieldSet::new(CandidateSource::UserEdit, observed_at);
        for (field, value) in edits.iter() {
            candidate.insert(field, value, None);
        }
        candidate
    }

    /// 拆分整行地址，组件置信度 = min(解析置信度, 地址本身的置信度)
    fn split_address(&self, candidate: &mut CandidateFieldSet, entry: &RecognizedField) {
        let parsed = self.address_parser.parse(&entry.value);
        let address_confidence = automated_confidence(entry.confidence).unwrap_or(DEFAULT_CONFIDENCE);
        let confidence = parsed.confidence.min(address_confidence);

        let components = [
            (FieldName::AddressStreet, parsed.street),
            (FieldName::AddressCity, parsed.city),
            (FieldName::AddressState, parsed.state),
            (FieldName::AddressZip, parsed.zip),
        ];
        for (field, value) in components {
            let Some(value) = value else { continue };
            if candidate.fields.get(field).is_some() {
                continue;
            }
            candidate.insert(field, &value, Some(confidence));
        }
    }
}

fn is_address_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    ADDRESS_KEYS.contains(&normalized.as_str())
}

/// 自动来源的置信度不能超过 1.0，否则会被当成人工修改
fn automated_confidence(confidence: Option<f64>) -> Option<f64> {
    confidence
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structure(recognized: &RecognizedFields) -> CandidateFieldSet {
        Extractor::new().structure(recognized, CandidateSource::PostCall, Utc::now())
    }

    #[test]
    fn test_keys_are_resolved_and_values_canonicalized() {
        let mut recognized = RecognizedFields::new();
        recognized.insert("first_name", "  Ann ", Some(0.9));
        recognized.insert("dateOfBirth", "03/14/1985", Some(0.8));
        recognized.insert("phone", "(555) 123-4567", None);
        recognized.insert("favouriteColour", "blue", Some(0.9));

        let candidate = structure(&recognized);
        assert_eq!(candidate.fields.len(), 3);
        assert_eq!(candidate.fields.get(FieldName::FirstName), Some("Ann"));
        assert_eq!(candidate.fields.get(FieldName::DateOfBirth), Some("1985-03-14"));
        assert_eq!(candidate.fields.get(FieldName::Phone), Some("5551234567"));
        assert_eq!(candidate.confidence.get(&FieldName::Phone), None);
    }

    #[test]
    fn test_automated_confidence_cannot_forge_a_lock() {
        let mut recognized = RecognizedFields::new();
        recognized.insert("lastName", "Lee", Some(1.7));
        recognized.insert("email", "ann@example.com", Some(-0.3));

        let candidate = structure(&recognized);
        assert_eq!(candidate.confidence[&FieldName::LastName], 1.0);
        assert_eq!(candidate.confidence[&FieldName::Email], 0.0);
        assert!(!candidate.slot(FieldName::LastName).is_locked());
    }

    #[test]
    fn test_address_is_split_into_components() {
        let mut recognized = RecognizedFields::new();
        recognized.insert("address", "123 Main St, New York, NY 10001", Some(0.8));
        recognized.insert("addressCity", "Brooklyn", Some(0.9));

        let candidate = structure(&recognized);
        assert_eq!(candidate.fields.get(FieldName::AddressStreet), Some("123 Main St"));
        assert_eq!(candidate.fields.get(FieldName::AddressCity), Some("Brooklyn"));
        assert_eq!(candidate.fields.get(FieldName::AddressState), Some("NY"));
        assert_eq!(candidate.fields.get(FieldName::AddressZip), Some("10001"));
        assert_eq!(candidate.confidence[&FieldName::AddressStreet], 0.8);
        assert_eq!(candidate.confidence[&FieldName::AddressCity], 0.9);
    }

    #[test]
    fn test_weak_address_parse_caps_confidence() {
        let mut recognized = RecognizedFields::new();
        recognized.insert("full_address", "42 Wallaby Way", Some(0.95));

        let candidate = structure(&recognized);
        assert_eq!(candidate.fields.get(FieldName::AddressStreet), Some("42 Wallaby Way"));
        assert!((candidate.confidence[&FieldName::AddressStreet] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_manual_edits_become_locked_candidate() {
        let mut edits = FieldValues::new();
        edits.set(FieldName::Sex, "f");
        let candidate = Extractor::new().from_manual_edits(&edits, Utc::now());
        assert_eq!(candidate.source, CandidateSource::UserEdit);
        assert!(candidate.slot(FieldName::Sex).is_locked());
    }
}
