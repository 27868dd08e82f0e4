//! 地址解析服务 - 业务能力层
//!
//! 把一行自由文本地址拆成 街道 / 城市 / 州 / 邮编，并给出递增的置信度。
//!
//! 解析按固定顺序逐步剥离：
//! 1. 邮编（5 位数字，可带 `-` + 4 位）→ +0.15
//! 2. 两字母州代码（整词、大小写不敏感，按代码表顺序匹配）→ +0.15
//! 3. 没有代码时匹配完整州名 → +0.10
//! 4. 剩余部分按逗号切分：两段以上取 街道、城市 → +0.20；
//!    只剩一段时，以“数字 + 空白”开头的归为街道，否则归为城市
//!
//! 州代码按代码表顺序而不是出现位置匹配，字符串里如果同时出现多个
//! 像州代码的两字母单词，结果取决于代码表顺序。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

use crate::models::us_states::STATE_CODES;
use crate::utils::logging::truncate_text;

const BASE_CONFIDENCE: f64 = 0.5;
const ZIP_BONUS: f64 = 0.15;
const STATE_CODE_BONUS: f64 = 0.15;
const STATE_NAME_BONUS: f64 = 0.10;
const STREET_CITY_BONUS: f64 = 0.20;

static ZIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{5}(?:-\d{4})?\b").expect("邮编正则无效"));

static TWO_LETTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z]{2}\b").expect("州代码正则无效"));

static STREET_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\s").expect("街道正则无效"));

/// 州名正则，长名优先（West Virginia 先于 Virginia）
static STATE_NAME_RES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    let mut names: Vec<(&'static str, &'static str)> = STATE_CODES
        .entries()
        .map(|(code, name)| (*name, *code))
        .collect();
    names.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));
    names
        .into_iter()
        .map(|(name, code)| {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(name));
            (Regex::new(&pattern).expect("州名正则无效"), code)
        })
        .collect()
});

/// 解析后的地址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedAddress {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub confidence: f64,
}

/// 地址解析器
///
/// 无状态，只暴露 parse() 能力
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressParser;

impl AddressParser {
    pub fn new() -> Self {
        Self
    }

    /// 解析一行地址
    pub fn parse(&self, address: &str) -> ParsedAddress {
        let mut rest = address.to_string();
        let mut confidence = BASE_CONFIDENCE;

        // ========== 1. 邮编 ==========
        let zip = match ZIP_RE.find(&rest) {
            Some(m) => {
                let zip = m.as_str().to_string();
                rest.replace_range(m.range(), "");
                confidence += ZIP_BONUS;
                Some(zip)
            }
            None => None,
        };

        // ========== 2. 州代码 ==========
        let mut state = take_state_code(&mut rest);
        if state.is_some() {
            confidence += STATE_CODE_BONUS;
        } else {
            // ========== 3. 州全名 ==========
            state = take_state_name(&mut rest);
            if state.is_some() {
                confidence += STATE_NAME_BONUS;
            }
        }

        // ========== 4. 街道 / 城市 ==========
        let segments: Vec<String> = rest
            .split(',')
            .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
            .map(|s| s.trim_matches(|c: char| c == '.' || c == ';').trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let (street, city) = match segments.as_slice() {
            [] => (None, None),
            [only] => {
                if STREET_START_RE.is_match(only) {
                    (Some(only.clone()), None)
                } else {
                    (None, Some(only.clone()))
                }
            }
            [first, second, ..] => {
                confidence += STREET_CITY_BONUS;
                (Some(first.clone()), Some(second.clone()))
            }
        };

        let parsed = ParsedAddress {
            street,
            city,
            state,
            zip,
            confidence: confidence.min(1.0),
        };

        debug!(
            "地址解析: '{}' → {:?} (置信度 {:.2})",
            truncate_text(address, 60),
            parsed,
            parsed.confidence
        );

        parsed
    }
}

/// 按代码表顺序查找第一个出现的州代码并从文本中移除
fn take_state_code(rest: &mut String) -> Option<String> {
    let tokens: Vec<(std::ops::Range<usize>, String)> = TWO_LETTER_RE
        .find_iter(rest)
        .map(|m| (m.range(), m.as_str().to_uppercase()))
        .collect();

    for code in STATE_CODES.keys() {
        if let Some((range, _)) = tokens.iter().find(|(_, token)| token == code) {
            rest.replace_range(range.clone(), "");
            return Some((*code).to_string());
        }
    }
    None
}

/// 查找完整州名并从文本中移除
fn take_state_name(rest: &mut String) -> Option<String> {
    for (re, code) in STATE_NAME_RES.iter() {
        if let Some(m) = re.find(rest) {
            rest.replace_range(m.range(), "");
            return Some((*code).to_string());
        }
    }
    None
}
