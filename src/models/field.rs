//! 字段表
//!
//! 可抽取字段的封闭集合。所有候选集与权威记录共享同一组字段名。

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::InputError;

/// 字段值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// 自由文本
    Text,
    /// 枚举代码
    Code,
    /// 日期
    Date,
    /// 格式化标识符
    Identifier,
}

/// 规范化规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canonicalization {
    /// 去除首尾空白并合并内部空白
    Trim,
    /// 去除空白并转为大写
    UpperCode,
    /// 只保留数字
    Digits,
    /// 解析常见日期写法并输出 YYYY-MM-DD
    Date,
    /// 只保留数字和连字符
    PostalCode,
}

/// 字段名
///
/// 声明顺序即字段表顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldName {
    #[serde(rename = "firstName")]
    FirstName,
    #[serde(rename = "middleName")]
    MiddleName,
    #[serde(rename = "lastName")]
    LastName,
    #[serde(rename = "dob")]
    DateOfBirth,
    #[serde(rename = "sex")]
    Sex,
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "phone")]
    Phone,
    #[serde(rename = "addressStreet")]
    AddressStreet,
    #[serde(rename = "addressCity")]
    AddressCity,
    #[serde(rename = "addressState")]
    AddressState,
    #[serde(rename = "addressZip")]
    AddressZip,
    #[serde(rename = "insuranceProvider")]
    InsuranceProvider,
    #[serde(rename = "insuranceMemberId")]
    InsuranceMemberId,
    #[serde(rename = "insuranceGroupNumber")]
    InsuranceGroupNumber,
}

impl FieldName {
    /// 字段表（有序）
    pub const ALL: [FieldName; 14] = [
        FieldName::FirstName,
        FieldName::MiddleName,
        FieldName::LastName,
        FieldName::DateOfBirth,
        FieldName::Sex,
        FieldName::Email,
        FieldName::Phone,
        FieldName::AddressStreet,
        FieldName::AddressCity,
        FieldName::AddressState,
        FieldName::AddressZip,
        FieldName::InsuranceProvider,
        FieldName::InsuranceMemberId,
        FieldName::InsuranceGroupNumber,
    ];

    /// 对外字段名
    pub fn key(self) -> &'static str {
        match self {
            FieldName::FirstName => "firstName",
            FieldName::MiddleName => "middleName",
            FieldName::LastName => "lastName",
            FieldName::DateOfBirth => "dob",
            FieldName::Sex => "sex",
            FieldName::Email => "email",
            FieldName::Phone => "phone",
            FieldName::AddressStreet => "addressStreet",
            FieldName::AddressCity => "addressCity",
            FieldName::AddressState => "addressState",
            FieldName::AddressZip => "addressZip",
            FieldName::InsuranceProvider => "insuranceProvider",
            FieldName::InsuranceMemberId => "insuranceMemberId",
            FieldName::InsuranceGroupNumber => "insuranceGroupNumber",
        }
    }

    /// 字段值类型
    pub fn kind(self) -> FieldKind {
        match self {
            FieldName::Sex | FieldName::AddressState => FieldKind::Code,
            FieldName::DateOfBirth => FieldKind::Date,
            FieldName::Phone
            | FieldName::AddressZip
            | FieldName::InsuranceMemberId
            | FieldName::InsuranceGroupNumber => FieldKind::Identifier,
            _ => FieldKind::Text,
        }
    }

    /// 规范化规则
    pub fn canonicalization(self) -> Canonicalization {
        match self {
            FieldName::Sex
            | FieldName::AddressState
            | FieldName::InsuranceMemberId
            | FieldName::InsuranceGroupNumber => Canonicalization::UpperCode,
            FieldName::Phone => Canonicalization::Digits,
            FieldName::DateOfBirth => Canonicalization::Date,
            FieldName::AddressZip => Canonicalization::PostalCode,
            _ => Canonicalization::Trim,
        }
    }

    /// 缺失时是否需要提示（校验警告）
    pub fn is_expected(self) -> bool {
        !matches!(
            self,
            FieldName::MiddleName
                | FieldName::Sex
                | FieldName::Email
                | FieldName::InsuranceGroupNumber
        )
    }

    /// 从外部键名解析字段（支持 snake_case 与常见别名）
    pub fn from_key(key: &str) -> Option<Self> {
        let normalized: String = key
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "firstname" | "givenname" | "first" => Some(FieldName::FirstName),
            "middlename" | "middle" | "middleinitial" => Some(FieldName::MiddleName),
            "lastname" | "surname" | "familyname" | "last" => Some(FieldName::LastName),
            "dob" | "dateofbirth" | "birthdate" | "birthday" => Some(FieldName::DateOfBirth),
            "sex" | "gender" => Some(FieldName::Sex),
            "email" | "emailaddress" => Some(FieldName::Email),
            "phone" | "phonenumber" | "telephone" | "mobile" => Some(FieldName::Phone),
            "addressstreet" | "street" | "streetaddress" => Some(FieldName::AddressStreet),
            "addresscity" | "city" => Some(FieldName::AddressCity),
            "addressstate" | "state" => Some(FieldName::AddressState),
            "addresszip" | "zip" | "zipcode" | "postalcode" => Some(FieldName::AddressZip),
            "insuranceprovider" | "insurer" | "insurancecompany" | "payer" => {
                Some(FieldName::InsuranceProvider)
            }
            "insurancememberid" | "memberid" | "subscriberid" | "policynumber" => {
                Some(FieldName::InsuranceMemberId)
            }
            "insurancegroupnumber" | "groupnumber" | "groupid" => {
                Some(FieldName::InsuranceGroupNumber)
            }
            _ => None,
        }
    }

    /// 按字段规则规范化取值；结果为空时返回 None
    pub fn canonicalize(self, raw: &str) -> Option<String> {
        let value = match self.canonicalization() {
            Canonicalization::Trim => collapse_whitespace(raw),
            Canonicalization::UpperCode => collapse_whitespace(raw).to_uppercase(),
            Canonicalization::Digits => raw.chars().filter(|c| c.is_ascii_digit()).collect(),
            Canonicalization::Date => normalize_date(raw),
            Canonicalization::PostalCode => raw
                .trim()
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '-')
                .collect(),
        };

        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

impl std::fmt::Display for FieldName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 能识别的日期写法统一为 ISO；无法识别时原样保留，交给校验报错
fn normalize_date(raw: &str) -> String {
    let trimmed = raw.trim();
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date.format("%Y-%m-%d").to_string();
        }
    }
    trimmed.to_string()
}

/// 字段名 → 取值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldValues(pub BTreeMap<FieldName, String>);

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入规范化后的值；规范化后为空则忽略
    pub fn set(&mut self, field: FieldName, raw: &str) -> bool {
        match field.canonicalize(raw) {
            Some(value) => {
                self.0.insert(field, value);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, field: FieldName) -> Option<&str> {
        self.0.get(&field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldName, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// 从 JSON 对象构造（适配层使用）
    ///
    /// 未知键返回错误，非字符串值转为字符串
    pub fn from_json_object(
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, InputError> {
        let mut values = FieldValues::new();
        for (key, value) in object {
            let field = FieldName::from_key(key)
                .ok_or_else(|| InputError::UnknownField { key: key.clone() })?;
            let text = match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            values.set(field, &text);
        }
        Ok(values)
    }
}

impl FromIterator<(FieldName, String)> for FieldValues {
    fn from_iter<I: IntoIterator<Item = (FieldName, String)>>(iter: I) -> Self {
        let mut values = FieldValues::new();
        for (field, raw) in iter {
            values.set(field, &raw);
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_key_accepts_aliases() {
        assert_eq!(FieldName::from_key("firstName"), Some(FieldName::FirstName));
        assert_eq!(FieldName::from_key("first_name"), Some(FieldName::FirstName));
        assert_eq!(FieldName::from_key("dateOfBirth"), Some(FieldName::DateOfBirth));
        assert_eq!(FieldName::from_key("zip"), Some(FieldName::AddressZip));
        assert_eq!(FieldName::from_key("memberId"), Some(FieldName::InsuranceMemberId));
        assert_eq!(FieldName::from_key("favoriteColor"), None);
    }

    #[test]
    fn test_key_round_trips_through_from_key() {
        for field in FieldName::ALL {
            assert_eq!(FieldName::from_key(field.key()), Some(field));
        }
    }

    #[test]
    fn test_canonicalize_rules() {
        assert_eq!(
            FieldName::FirstName.canonicalize("  Mary   Ann "),
            Some("Mary Ann".to_string())
        );
        assert_eq!(FieldName::AddressState.canonicalize(" ny"), Some("NY".to_string()));
        assert_eq!(
            FieldName::Phone.canonicalize("(555) 123-4567"),
            Some("5551234567".to_string())
        );
        assert_eq!(
            FieldName::DateOfBirth.canonicalize("03/14/1985"),
            Some("1985-03-14".to_string())
        );
        assert_eq!(
            FieldName::AddressZip.canonicalize(" 10001-1234 "),
            Some("10001-1234".to_string())
        );
        assert_eq!(FieldName::LastName.canonicalize("   "), None);
    }

    #[test]
    fn test_unparseable_date_is_kept_for_validation() {
        assert_eq!(
            FieldName::DateOfBirth.canonicalize("last tuesday"),
            Some("last tuesday".to_string())
        );
    }

    #[test]
    fn test_from_json_object_rejects_unknown_keys() {
        let object = serde_json::json!({ "dob": "2099-01-01", "shoeSize": 9 });
        let result = FieldValues::from_json_object(object.as_object().unwrap());
        assert!(matches!(result, Err(InputError::UnknownField { key }) if key == "shoeSize"));
    }

    #[test]
    fn test_from_json_object_stringifies_values() {
        let object = serde_json::json!({ "addressZip": 10001, "sex": null });
        let values = FieldValues::from_json_object(object.as_object().unwrap()).unwrap();
        assert_eq!(values.get(FieldName::AddressZip), Some("10001"));
        assert_eq!(values.get(FieldName::Sex), None);
    }
}
