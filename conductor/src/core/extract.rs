//! Reply extraction: pull one JSON candidate out of free-form worker text.
//!
//! Strategies are tried in the order returned by [`strategies_for`]. The two
//! locating strategies ([`Strategy::FencedBlock`], [`Strategy::BalancedObject`])
//! produce the primary candidate; the first one that matches wins. Repair
//! strategies only run for their own schema and only when the primary
//! candidate is missing or does not parse as a JSON object.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use crate::core::schema::SchemaKind;

static FENCED_JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[ \t]*(?i:json)\s*(.*?)\s*```").unwrap());
static REASONING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<think>.*?</think>|<thinking>.*?</thinking>|<reasoning>.*?</reasoning>")
        .unwrap()
});
static DESCRIPTION_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""description"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());
static CODE_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""code"\s*:\s*""#).unwrap());

/// One way of locating a candidate in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Interior of a ```` ```json ```` fenced block.
    FencedBlock,
    /// First balanced `{...}` span after reasoning segments are removed.
    BalancedObject,
    /// Currency-pattern number scan for price replies.
    PriceScan,
    /// Regex recovery of `description`/`code` when the code string is unterminated.
    CodeFieldRecovery,
}

impl Strategy {
    fn is_repair(self) -> bool {
        matches!(self, Strategy::PriceScan | Strategy::CodeFieldRecovery)
    }
}

/// A candidate string and the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub candidate: String,
    pub strategy: Strategy,
}

/// No strategy located any delimited content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no candidate payload found in reply")]
pub struct NoCandidate;

/// Settings for the price fallback scan.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceScan {
    pub min_price: f64,
    pub max_price: f64,
    pub currency_tokens: Vec<String>,
}

/// Ordered strategy list for a schema.
pub fn strategies_for(kind: SchemaKind) -> &'static [Strategy] {
    match kind {
        SchemaKind::ExtractedPrice => &[
            Strategy::FencedBlock,
            Strategy::BalancedObject,
            Strategy::PriceScan,
        ],
        SchemaKind::GeneratedCode => &[
            Strategy::FencedBlock,
            Strategy::BalancedObject,
            Strategy::CodeFieldRecovery,
        ],
        _ => &[Strategy::FencedBlock, Strategy::BalancedObject],
    }
}

/// Run the strategies for `kind` over `reply`.
///
/// Price replies never fail: without any usable number they yield
/// `{"price": null}`.
pub fn extract_candidate(
    reply: &str,
    kind: SchemaKind,
    price_scan: &PriceScan,
) -> Result<Extraction, NoCandidate> {
    let visible = strip_reasoning(reply);
    let mut primary: Option<Extraction> = None;

    for &strategy in strategies_for(kind) {
        if strategy.is_repair() {
            if primary
                .as_ref()
                .is_some_and(|found| parses_as_object(&found.candidate))
            {
                break;
            }
            let repaired = match strategy {
                Strategy::PriceScan => Some(price_candidate(reply, price_scan)),
                Strategy::CodeFieldRecovery => recover_code_payload(
                    primary
                        .as_ref()
                        .map_or(visible.as_ref(), |found| found.candidate.as_str()),
                ),
                Strategy::FencedBlock | Strategy::BalancedObject => None,
            };
            if let Some(candidate) = repaired {
                return Ok(Extraction {
                    candidate,
                    strategy,
                });
            }
            continue;
        }

        if primary.is_some() {
            continue;
        }
        let located = match strategy {
            Strategy::FencedBlock => fenced_block(reply),
            Strategy::BalancedObject => balanced_object(&visible),
            Strategy::PriceScan | Strategy::CodeFieldRecovery => None,
        };
        primary = located.map(|candidate| Extraction {
            candidate: candidate.to_string(),
            strategy,
        });
    }

    primary.ok_or(NoCandidate)
}

/// Interior of the first fenced block labelled `json`.
pub fn fenced_block(text: &str) -> Option<&str> {
    FENCED_JSON_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Remove `<think>`-style reasoning segments.
pub fn strip_reasoning(text: &str) -> Cow<'_, str> {
    REASONING_RE.replace_all(text, "")
}

/// First balanced `{...}` span, tracking string literals and escapes.
///
/// When braces never balance (typically an unterminated string), the span is
/// widened to the last `}` in the text.
pub fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }

    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// First currency-tagged number inside the plausible range.
pub fn scan_price(text: &str, scan: &PriceScan) -> Option<f64> {
    let tokens: Vec<String> = scan
        .currency_tokens
        .iter()
        .filter(|token| !token.is_empty())
        .map(|token| regex::escape(token))
        .collect();
    if tokens.is_empty() {
        return None;
    }
    let pattern = format!(
        r"(\d{{1,3}}(?:[ \x{{a0}}\x{{202f}},.]?\d{{3}})*)\s*(?i:{})",
        tokens.join("|")
    );
    let price_re = Regex::new(&pattern).ok()?;

    price_re.captures_iter(text).find_map(|caps| {
        let digits: String = caps[1].chars().filter(char::is_ascii_digit).collect();
        let value: f64 = digits.parse().ok()?;
        (scan.min_price..=scan.max_price)
            .contains(&value)
            .then_some(value)
    })
}

fn price_candidate(reply: &str, scan: &PriceScan) -> String {
    match scan_price(reply, scan) {
        Some(price) => json!({ "price": price }).to_string(),
        None => json!({ "price": Value::Null }).to_string(),
    }
}

/// Rebuild a code payload whose `code` string was emitted with raw newlines.
///
/// The code runs from the opening quote of `code` to the end of the input (or
/// to the `description` key when that comes later), with the closing quote and
/// brace trimmed.
pub fn recover_code_payload(text: &str) -> Option<String> {
    let description = DESCRIPTION_FIELD_RE.captures(text)?;
    let description_match = description.get(0)?;
    let code_start = CODE_FIELD_RE.find(text)?.end();

    let code_end = if description_match.start() >= code_start {
        description_match.start()
    } else {
        text.len()
    };
    let mut code = text[code_start..code_end].trim_end();
    code = code.strip_suffix('}').unwrap_or(code).trim_end();
    code = code.strip_suffix(',').unwrap_or(code).trim_end();
    code = code.strip_suffix('"').unwrap_or(code);
    if code.trim().is_empty() {
        return None;
    }

    Some(
        json!({
            "description": unescape(&description[1]),
            "code": unescape(code),
        })
        .to_string(),
    )
}

fn unescape(text: &str) -> String {
    text.replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\\"", "\"")
}

fn parses_as_object(candidate: &str) -> bool {
    serde_json::from_str::<Value>(candidate).is_ok_and(|value| value.is_object())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan() -> PriceScan {
        PriceScan {
            min_price: 50_000.0,
            max_price: 300_000.0,
            currency_tokens: vec!["руб".into(), "₽".into(), "RUB".into()],
        }
    }

    fn extract(reply: &str, kind: SchemaKind) -> Result<Extraction, NoCandidate> {
        extract_candidate(reply, kind, &scan())
    }

    /// The fenced interior is returned no matter how much prose surrounds it.
    #[test]
    fn fenced_block_interior_wins_regardless_of_prose() {
        let interior = r#"{"plan": ["a", "b"]}"#;
        for padding in [0, 1, 50, 5_000] {
            let prose = "Here is my answer. {not json} ".repeat(padding);
            let reply = format!("{prose}\n```json\n{interior}\n```\n{prose}");
            let found = extract(&reply, SchemaKind::Plan).expect("candidate");
            assert_eq!(found.candidate, interior);
            assert_eq!(found.strategy, Strategy::FencedBlock);
        }
    }

    #[test]
    fn balanced_object_spans_nested_braces() {
        let reply = r#"Sure thing: {"description": "d", "code": "def f():\n    return {'a': {'b': 1}}"} trailing {x}"#;
        let found = extract(reply, SchemaKind::GeneratedCode).expect("candidate");
        assert_eq!(found.strategy, Strategy::BalancedObject);
        let value: Value = serde_json::from_str(&found.candidate).expect("json");
        assert_eq!(value["description"], "d");
    }

    #[test]
    fn reasoning_segments_are_skipped() {
        let reply = "<think>maybe {\"plan\": [\"wrong\"]}</think>{\"plan\": [\"right\"]}";
        let found = extract(reply, SchemaKind::Plan).expect("candidate");
        assert_eq!(found.candidate, r#"{"plan": ["right"]}"#);
    }

    #[test]
    fn no_braces_is_no_candidate() {
        assert_eq!(extract("I cannot help with that.", SchemaKind::Plan), Err(NoCandidate));
        assert_eq!(extract("", SchemaKind::CodeReview), Err(NoCandidate));
    }

    #[test]
    fn unparseable_primary_is_still_returned_for_plain_schemas() {
        let found = extract("{plan: missing quotes}", SchemaKind::Plan).expect("candidate");
        assert_eq!(found.candidate, "{plan: missing quotes}");
    }

    #[test]
    fn price_object_is_used_when_it_parses() {
        let found = extract(r#"The price is {"price": 129990}"#, SchemaKind::ExtractedPrice)
            .expect("candidate");
        assert_eq!(found.strategy, Strategy::BalancedObject);
    }

    #[test]
    fn price_scan_accepts_separated_digits_in_range() {
        let reply = "Found offers: 1 500 руб for a case, the phone itself costs 139 990 ₽.";
        let found = extract(reply, SchemaKind::ExtractedPrice).expect("candidate");
        assert_eq!(found.strategy, Strategy::PriceScan);
        let value: Value = serde_json::from_str(&found.candidate).expect("json");
        assert_eq!(value["price"].as_f64(), Some(139_990.0));
    }

    #[test]
    fn price_scan_out_of_range_yields_null_price() {
        let found =
            extract("Only 990 руб or 9 000 000 RUB", SchemaKind::ExtractedPrice).expect("candidate");
        assert_eq!(found.candidate, r#"{"price":null}"#);
        let found = extract("", SchemaKind::ExtractedPrice).expect("candidate");
        assert_eq!(found.candidate, r#"{"price":null}"#);
    }

    #[test]
    fn price_scan_handles_comma_and_dot_separators() {
        assert_eq!(scan_price("costs 149,990 rub", &scan()), Some(149_990.0));
        assert_eq!(scan_price("costs 99.990₽", &scan()), Some(99_990.0));
        assert_eq!(scan_price("costs 99990", &scan()), None);
    }

    /// Literal newlines inside the code string break JSON parsing; the
    /// recovery rebuilds the payload from the raw text.
    #[test]
    fn code_recovery_handles_literal_newlines() {
        let reply = "{\"description\": \"doubles a number\", \"code\": \"def f(x):\n    return x * 2\n\"}";
        let found = extract(reply, SchemaKind::GeneratedCode).expect("candidate");
        assert_eq!(found.strategy, Strategy::CodeFieldRecovery);
        let value: Value = serde_json::from_str(&found.candidate).expect("json");
        assert_eq!(value["description"], "doubles a number");
        assert_eq!(value["code"], "def f(x):\n    return x * 2\n");
    }

    #[test]
    fn code_recovery_unescapes_fixed_sequences() {
        let text = r#""description": "d", "code": "print(\"hi\")\n\tpass"#;
        let recovered = recover_code_payload(text).expect("recovered");
        let value: Value = serde_json::from_str(&recovered).expect("json");
        assert_eq!(value["code"], "print(\"hi\")\n\tpass");
    }

    #[test]
    fn code_recovery_stops_at_later_description() {
        let text = "{\"code\": \"def f():\n    pass\", \"description\": \"noop\"}";
        let recovered = recover_code_payload(text).expect("recovered");
        let value: Value = serde_json::from_str(&recovered).expect("json");
        assert_eq!(value["code"], "def f():\n    pass");
        assert_eq!(value["description"], "noop");
    }

    #[test]
    fn code_recovery_needs_both_fields() {
        assert_eq!(recover_code_payload(r#"{"code": "x = 1"}"#), None);
    }

    #[test]
    fn unbalanced_braces_widen_to_last_close() {
        assert_eq!(balanced_object(r#"a {"x": "unterminated b"#), None);
        assert_eq!(
            balanced_object(r#"a {"x": "open} "y": {1} z"#),
            Some(r#"{"x": "open} "y": {1}"#)
        );
    }

    #[test]
    fn strategy_order_is_visible() {
        assert_eq!(
            strategies_for(SchemaKind::ExtractedPrice),
            &[Strategy::FencedBlock, Strategy::BalancedObject, Strategy::PriceScan]
        );
        assert_eq!(
            strategies_for(SchemaKind::Documentation),
            &[Strategy::FencedBlock, Strategy::BalancedObject]
        );
    }
}
