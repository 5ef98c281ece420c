//! Deal amount extraction from semi-structured card payloads.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as JsonValue;

use crate::AmountInfo;

/// Shown instead of an amount when none can be read.
pub const NEUTRAL_AMOUNT_TEXT: &str = "这一单";
pub const LARGE_DEAL_MARKER: &str = "大单";
pub const LARGE_DEAL_THRESHOLD: f64 = 20_000.0;
const WAN: f64 = 10_000.0;

fn amount_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d[\d,]*\.?\d*)\s*元").expect("amount pattern is a valid regex")
    })
}

/// Reads the first `<number>元` occurrence anywhere in the document.
///
/// Never fails: anything unreadable becomes [`NEUTRAL_AMOUNT_TEXT`] with value 0.
pub fn extract_amount(document: &JsonValue) -> AmountInfo {
    let flat = match serde_json::to_string(document) {
        Ok(text) => text,
        Err(_) => return neutral(),
    };
    extract_amount_from_text(&flat)
}

pub fn extract_amount_from_text(text: &str) -> AmountInfo {
    let Some(captures) = amount_pattern().captures(text) else {
        return neutral();
    };
    let Some(digits) = ascii_number(&captures[1]) else {
        return neutral();
    };
    match digits.parse::<f64>() {
        Ok(value) if value.is_finite() => {
            let mut display_text = format_amount(value);
            if value >= LARGE_DEAL_THRESHOLD {
                display_text.push_str(LARGE_DEAL_MARKER);
            }
            AmountInfo {
                display_text,
                numeric_value: value,
            }
        }
        _ => neutral(),
    }
}

/// Maps a decimal digit to its ASCII form. Full-width digits are common in
/// CJK input methods.
pub fn ascii_digit(c: char) -> Option<char> {
    match c {
        '0'..='9' => Some(c),
        '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32),
        _ => None,
    }
}

/// Drops thousands separators and folds digits to ASCII; `None` for any
/// other digit script.
fn ascii_number(matched: &str) -> Option<String> {
    matched
        .chars()
        .filter(|c| *c != ',')
        .map(|c| if c == '.' { Some(c) } else { ascii_digit(c) })
        .collect()
}

/// `15000` -> `1.5万`, `30000` -> `3万`, `8000.9` -> `8000`.
pub fn format_amount(value: f64) -> String {
    if value >= WAN {
        let wan = value / WAN;
        if wan.fract() == 0.0 {
            format!("{}万", wan as u64)
        } else {
            format!("{wan:.1}万")
        }
    } else {
        format!("{}", value.trunc() as i64)
    }
}

fn neutral() -> AmountInfo {
    AmountInfo {
        display_text: NEUTRAL_AMOUNT_TEXT.to_string(),
        numeric_value: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn large_deal_with_separators_and_fraction() {
        let card = json!({
            "header": {"title": {"content": "恭喜张三成单"}},
            "elements": [{"tag": "div", "text": {"content": "恭喜成交 23,500.5元"}}]
        });
        let info = extract_amount(&card);
        assert_eq!(info.display_text, "2.4万大单");
        assert_eq!(info.numeric_value, 23500.5);
    }

    #[test]
    fn small_amount_is_shown_as_integer() {
        let info = extract_amount(&json!({"text": "合同金额：8000元"}));
        assert_eq!(info.display_text, "8000");
        assert_eq!(info.numeric_value, 8000.0);

        let info = extract_amount(&json!({"text": "9999.99 元"}));
        assert_eq!(info.display_text, "9999");
    }

    #[test]
    fn missing_currency_marker_yields_neutral_placeholder() {
        let info = extract_amount(&json!({"text": "恭喜成交 15000"}));
        assert_eq!(info.display_text, "这一单");
        assert_eq!(info.numeric_value, 0.0);
    }

    #[test]
    fn whole_wan_values_drop_the_fraction() {
        assert_eq!(format_amount(30_000.0), "3万");
        assert_eq!(format_amount(15_000.0), "1.5万");
        assert_eq!(format_amount(10_000.0), "1万");
    }

    #[test]
    fn threshold_marks_only_twenty_thousand_and_above() {
        assert_eq!(extract_amount_from_text("19999元").display_text, "2.0万");
        assert_eq!(extract_amount_from_text("20000元").display_text, "2万大单");
    }

    #[test]
    fn full_width_digits_are_read() {
        let info = extract_amount_from_text("恭喜成交 ２００００元");
        assert_eq!(info.display_text, "2万大单");
        assert_eq!(info.numeric_value, 20000.0);

        let info = extract_amount_from_text("合同 ８,５００元");
        assert_eq!(info.numeric_value, 8500.0);
    }

    #[test]
    fn first_amount_follows_document_order() {
        let card: JsonValue =
            serde_json::from_str(r#"{"text": "本单 8000元", "fields": "累计 50000元"}"#).expect("json");
        let info = extract_amount(&card);
        assert_eq!(info.display_text, "8000");
        assert_eq!(info.numeric_value, 8000.0);
    }

    #[test]
    fn first_occurrence_wins() {
        let info = extract_amount_from_text("首付 5000元，总额 50,000元");
        assert_eq!(info.numeric_value, 5000.0);
    }
}
