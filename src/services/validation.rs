//! 字段校验服务 - 业务能力层
//!
//! 无状态：字段集 → (错误, 警告)。
//! 已填写但格式不对的值是错误；缺少应有字段只是警告，警告不影响 is_valid。

use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::models::candidate::{requires_manual_review, AuthoritativeRecord};
use crate::models::field::{FieldName, FieldValues};
use crate::models::us_states;

const MIN_AGE_YEARS: i32 = 1;
const MAX_AGE_YEARS: i32 = 120;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\p{L}[\p{L}'\-]*$").expect("姓名正则无效"));

static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("日期正则无效"));

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("邮箱正则无效")
});

static ZIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{5}(-\d{4})?$").expect("邮编正则无效"));

static INSURANCE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-]{3,20}$").expect("保险编号正则无效"));

/// 单条问题；记录级别的问题没有 field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<FieldName>,
    pub message: String,
}

/// 校验结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<FieldIssue>,
    pub warnings: Vec<FieldIssue>,
}

impl ValidationResult {
    fn from_issues(errors: Vec<FieldIssue>, warnings: Vec<FieldIssue>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    pub fn has_error_for(&self, field: FieldName) -> bool {
        self.errors.iter().any(|i| i.field == Some(field))
    }

    pub fn has_warning_for(&self, field: FieldName) -> bool {
        self.warnings.iter().any(|i| i.field == Some(field))
    }
}

/// 校验一组字段，以今天为年龄基准
pub fn validate(fields: &FieldValues) -> ValidationResult {
    validate_on(fields, Utc::now().date_naive())
}

/// 校验一组字段，年龄按 `today` 计算
pub fn validate_on(fields: &FieldValues, today: NaiveDate) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for field in FieldName::ALL {
        match fields.get(field) {
            Some(value) => {
                if let Some(message) = check_value(field, value.trim(), today) {
                    errors.push(FieldIssue {
                        field: Some(field),
                        message,
                    });
                }
            }
            None if field.is_expected() => warnings.push(FieldIssue {
                field: Some(field),
                message: format!("缺少字段 {}", field),
            }),
            None => {}
        }
    }

    ValidationResult::from_issues(errors, warnings)
}

/// 校验权威记录；整体置信度低于复核阈值时追加一条警告
pub fn validate_record(record: &AuthoritativeRecord) -> ValidationResult {
    let mut result = validate(&record.fields());
    let overall = record.overall_confidence();
    if !record.is_empty() && requires_manual_review(overall) {
        result.warnings.push(FieldIssue {
            field: None,
            message: format!("整体置信度 {:.2} 偏低，需要人工复核", overall),
        });
    }
    result
}

/// 检查单个已填写的值，返回错误描述
fn check_value(field: FieldName, value: &str, today: NaiveDate) -> Option<String> {
    match field {
        FieldName::FirstName | FieldName::MiddleName | FieldName::LastName => {
            if value.chars().count() < 2 {
                Some("姓名至少需要 2 个字符".to_string())
            } else if !NAME_RE.is_match(value) {
                Some("姓名只能包含字母、连字符和撇号".to_string())
            } else {
                None
            }
        }
        FieldName::DateOfBirth => check_date_of_birth(value, today),
        FieldName::Sex => match value.to_uppercase().as_str() {
            "M" | "F" => None,
            _ => Some("性别只能是 M 或 F".to_string()),
        },
        FieldName::Email => {
            if EMAIL_RE.is_match(value) {
                None
            } else {
                Some("邮箱格式不正确".to_string())
            }
        }
        FieldName::Phone => {
            let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
            if digits == 10 {
                None
            } else {
                Some(format!("电话号码应为 10 位数字，实际 {} 位", digits))
            }
        }
        FieldName::AddressState => {
            if us_states::is_valid_code(value) {
                None
            } else {
                Some(format!("无效的州代码: {}", value))
            }
        }
        FieldName::AddressZip => {
            if ZIP_RE.is_match(value) {
                None
            } else {
                Some("邮编应为 NNNNN 或 NNNNN-NNNN".to_string())
            }
        }
        FieldName::InsuranceMemberId | FieldName::InsuranceGroupNumber => {
            if INSURANCE_ID_RE.is_match(value) {
                None
            } else {
                Some("保险编号应为 3-20 位字母、数字或连字符".to_string())
            }
        }
        FieldName::AddressStreet | FieldName::AddressCity | FieldName::InsuranceProvider => None,
    }
}

fn check_date_of_birth(value: &str, today: NaiveDate) -> Option<String> {
    if !DATE_RE.is_match(value) {
        return Some("出生日期应为 YYYY-MM-DD".to_string());
    }
    let dob = match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        Ok(d) => d,
        Err(_) => return Some(format!("无效的日期: {}", value)),
    };
    if dob > today {
        return Some("出生日期不能晚于今天".to_string());
    }

    let mut age = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    if !(MIN_AGE_YEARS..=MAX_AGE_YEARS).contains(&age) {
        return Some(format!(
            "年龄 {} 不在合理范围 [{}, {}]",
            age, MIN_AGE_YEARS, MAX_AGE_YEARS
        ));
    }
    None
}
