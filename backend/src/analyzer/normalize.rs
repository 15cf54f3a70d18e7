//! Shape enforcement for model responses.
//!
//! Models drift: fences around JSON, prose before it, missing keys,
//! strings where objects were asked for. Everything that reaches the
//! report passes through here first, and every function is idempotent.

use serde_json::{json, Value};

/// Strip markdown fences and slice to the outermost JSON object.
pub fn clean_json_response(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    if text.starts_with("```") {
        if let Some(first_nl) = text.find('\n') {
            text = text[first_nl + 1..].to_string();
        }
        if text.ends_with("```") {
            text = text[..text.len() - 3].to_string();
        }
        text = text.trim().to_string();
    }
    let brace_start = text.find('{');
    let brace_end = text.rfind('}');
    if let (Some(start), Some(end)) = (brace_start, brace_end) {
        if end > start {
            text = text[start..=end].to_string();
        }
    }
    text
}

/// Best-effort verdict from plain text when JSON parsing fails.
pub fn infer_verdict_from_text(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    if ["malicious", "malware", "trojan", "ransomware", "backdoor"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return "malicious";
    }
    if ["suspicious", "anomal", "unusual", "concerning"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return "suspicious";
    }
    if ["benign", "clean", "legitimate", "safe"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return "benign";
    }
    "inconclusive"
}

pub fn clamp_score(value: i64) -> i64 {
    value.clamp(0, 100)
}

/// Accept a number, a numeric string, or garbage; clamp to [0, 100].
pub fn coerce_score(value: Option<&Value>) -> i64 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    clamp_score(raw)
}

fn str_of(item: &Value, key: &str, default: &str) -> String {
    match item.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => default.to_string(),
        Some(other) => other.to_string(),
    }
}

fn as_list(value: &Value) -> Vec<Value> {
    value.as_array().cloned().unwrap_or_default()
}

/// Per-tool findings: `{severity, indicator, description}`.
pub fn normalize_tool_findings(items: &Value) -> Vec<Value> {
    as_list(items)
        .iter()
        .filter_map(|item| match item {
            Value::Object(_) => Some(json!({
                "severity": str_of(item, "severity", "medium"),
                "indicator": str_of(item, "indicator", ""),
                "description": str_of(item, "description", ""),
            })),
            Value::String(s) => Some(json!({
                "severity": "medium",
                "indicator": s.chars().take(80).collect::<String>(),
                "description": s,
            })),
            _ => None,
        })
        .collect()
}

/// Per-tool IOCs: `{type, value}`.
pub fn normalize_tool_iocs(items: &Value) -> Vec<Value> {
    as_list(items)
        .iter()
        .filter_map(|item| match item {
            Value::Object(_) => Some(json!({
                "type": str_of(item, "type", "unknown"),
                "value": str_of(item, "value", ""),
            })),
            Value::String(s) => Some(json!({ "type": "unknown", "value": s })),
            _ => None,
        })
        .collect()
}

/// Summary findings: `{source, severity, description}`.
pub fn normalize_findings(items: &Value) -> Vec<Value> {
    as_list(items)
        .iter()
        .filter_map(|item| match item {
            Value::Object(map) => {
                let description = if map.contains_key("description") {
                    str_of(item, "description", "")
                } else {
                    str_of(item, "text", "")
                };
                Some(json!({
                    "source": str_of(item, "source", ""),
                    "severity": str_of(item, "severity", "medium"),
                    "description": description,
                }))
            }
            Value::String(s) => Some(json!({
                "source": "",
                "severity": "medium",
                "description": s,
            })),
            _ => None,
        })
        .collect()
}

/// Summary IOCs: `{type, severity, value}`.
pub fn normalize_iocs(items: &Value) -> Vec<Value> {
    as_list(items)
        .iter()
        .filter_map(|item| match item {
            Value::Object(_) => Some(json!({
                "type": str_of(item, "type", "unknown"),
                "severity": str_of(item, "severity", "medium"),
                "value": str_of(item, "value", ""),
            })),
            Value::String(s) => Some(json!({
                "type": "unknown",
                "severity": "medium",
                "value": s,
            })),
            _ => None,
        })
        .collect()
}

/// MITRE entries: `{id, name, tactic, description}`; `technique_id` is
/// accepted as a synonym for `id`.
pub fn normalize_mitre(items: &Value) -> Vec<Value> {
    as_list(items)
        .iter()
        .filter_map(|item| match item {
            Value::Object(map) => {
                let id = if map.contains_key("id") {
                    str_of(item, "id", "")
                } else {
                    str_of(item, "technique_id", "")
                };
                Some(json!({
                    "id": id,
                    "name": str_of(item, "name", ""),
                    "tactic": str_of(item, "tactic", ""),
                    "description": str_of(item, "description", ""),
                }))
            }
            Value::String(s) => Some(json!({
                "id": "",
                "name": s,
                "tactic": "",
                "description": "",
            })),
            _ => None,
        })
        .collect()
}

/// Recommendations: `{priority, action}`.
pub fn normalize_recommendations(items: &Value) -> Vec<Value> {
    as_list(items)
        .iter()
        .filter_map(|item| match item {
            Value::Object(map) => {
                let action = if map.contains_key("action") {
                    str_of(item, "action", "")
                } else {
                    str_of(item, "text", "")
                };
                Some(json!({
                    "priority": str_of(item, "priority", "medium"),
                    "action": action,
                }))
            }
            Value::String(s) => Some(json!({ "priority": "medium", "action": s })),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_fences_and_prose() {
        let raw = "Here is the result:\n```json\n{\"verdict\": \"benign\"}\n```\nHope this helps!";
        assert_eq!(clean_json_response(raw), "{\"verdict\": \"benign\"}");
    }

    #[test]
    fn clean_is_idempotent() {
        for raw in [
            "```json\n{\"a\": 1}\n```",
            "prose {\"a\": {\"b\": 2}} trailing",
            "{\"a\": 1}",
            "no json here at all",
            "",
        ] {
            let once = clean_json_response(raw);
            let twice = clean_json_response(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn verdict_heuristic_keyword_tiers() {
        assert_eq!(
            infer_verdict_from_text("This binary is clearly malicious."),
            "malicious"
        );
        assert_eq!(
            infer_verdict_from_text("Behavior looks unusual and concerning"),
            "suspicious"
        );
        assert_eq!(infer_verdict_from_text("A clean installer"), "benign");
        assert_eq!(infer_verdict_from_text("cannot tell"), "inconclusive");
        // Malicious keywords outrank suspicious ones.
        assert_eq!(
            infer_verdict_from_text("suspicious trojan behavior"),
            "malicious"
        );
    }

    #[test]
    fn scores_are_clamped() {
        assert_eq!(coerce_score(Some(&json!(150))), 100);
        assert_eq!(coerce_score(Some(&json!(-3))), 0);
        assert_eq!(coerce_score(Some(&json!("72"))), 72);
        assert_eq!(coerce_score(Some(&json!("high"))), 0);
        assert_eq!(coerce_score(None), 0);
    }

    #[test]
    fn normalizers_fix_shapes_and_accept_strings() {
        let findings = normalize_tool_findings(&json!([
            { "severity": "high", "indicator": "x", "description": "y", "extra": 1 },
            "bare string finding"
        ]));
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0]["severity"], "high");
        assert_eq!(findings[1]["severity"], "medium");
        assert_eq!(findings[1]["description"], "bare string finding");
        assert!(findings[0].get("extra").is_none());

        let mitre = normalize_mitre(&json!([{ "technique_id": "T1055", "name": "Injection" }]));
        assert_eq!(mitre[0]["id"], "T1055");
    }

    #[test]
    fn normalizers_are_idempotent() {
        let input = json!([
            { "severity": "high", "indicator": "x", "description": "y" },
            "loose"
        ]);
        let once = Value::Array(normalize_tool_findings(&input));
        let twice = Value::Array(normalize_tool_findings(&once));
        assert_eq!(once, twice);

        let iocs = json!([{ "type": "dns", "value": "evil.test" }, "10.0.0.1"]);
        let once = Value::Array(normalize_iocs(&iocs));
        let twice = Value::Array(normalize_iocs(&once));
        assert_eq!(once, twice);

        let recs = json!([{ "priority": "high", "action": "isolate" }, "patch"]);
        let once = Value::Array(normalize_recommendations(&recs));
        let twice = Value::Array(normalize_recommendations(&once));
        assert_eq!(once, twice);

        let mitre = json!([{ "id": "T1055", "name": "x", "tactic": "", "description": "" }]);
        let once = Value::Array(normalize_mitre(&mitre));
        let twice = Value::Array(normalize_mitre(&once));
        assert_eq!(once, twice);
    }

    #[test]
    fn non_list_input_yields_empty() {
        assert!(normalize_findings(&json!("not a list")).is_empty());
        assert!(normalize_iocs(&json!(null)).is_empty());
    }
}
