//! Node settings accessors. A missing or malformed required setting is a
//! validation error, which the lifecycle controller never retries.

use chrono::NaiveTime;
use leadflow_core::{LeadflowError, Node, Result};
use serde_json::Value;

pub fn required_str<'a>(node: &'a Node, key: &str) -> Result<&'a str> {
    optional_str(node, key).ok_or_else(|| {
        LeadflowError::validation(format!("Node '{}' is missing setting '{key}'", node.id))
    })
}

/// Non-empty string setting.
pub fn optional_str<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.settings
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Present, non-null and non-empty setting of any JSON type.
pub fn required_value<'a>(node: &'a Node, key: &str) -> Result<&'a Value> {
    let value = match node.settings.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::Array(a)) if a.is_empty() => None,
        Some(Value::Object(o)) if o.is_empty() => None,
        Some(v) => Some(v),
    };
    value.ok_or_else(|| {
        LeadflowError::validation(format!("Node '{}' is missing setting '{key}'", node.id))
    })
}

/// Boolean setting; accepts `true`/`false` and their string forms.
pub fn flag(node: &Node, key: &str) -> Option<bool> {
    match node.settings.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Unsigned integer setting given as a number or numeric string.
pub fn uint(node: &Node, key: &str) -> Result<Option<u32>> {
    let parsed = match node.settings.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
    };
    parsed.map(Some).ok_or_else(|| {
        LeadflowError::validation(format!("Node '{}' setting '{key}' is not a number", node.id))
    })
}

/// Time-of-day setting: `"HH:MM"` or a whole hour.
pub fn time_of_day(node: &Node, key: &str) -> Result<Option<NaiveTime>> {
    let invalid = || {
        LeadflowError::validation(format!(
            "Node '{}' setting '{key}' is not a time of day",
            node.id
        ))
    };
    match node.settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            NaiveTime::parse_from_str(s, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
                .ok()
                .or_else(|| s.parse::<u32>().ok().and_then(|h| NaiveTime::from_hms_opt(h, 0, 0)))
                .map(Some)
                .ok_or_else(invalid)
        }
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|h| u32::try_from(h).ok())
            .and_then(|h| NaiveTime::from_hms_opt(h, 0, 0))
            .map(Some)
            .ok_or_else(invalid),
        Some(_) => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(settings: Value) -> Node {
        Node {
            id: "googleCalendar_1".into(),
            settings,
        }
    }

    #[test]
    fn test_required_str() {
        let n = node(serde_json::json!({"connection": "c1", "blank": "  "}));
        assert_eq!(required_str(&n, "connection").unwrap(), "c1");
        assert!(matches!(required_str(&n, "blank"), Err(LeadflowError::Validation(_))));
        assert!(required_str(&n, "absent").is_err());
    }

    #[test]
    fn test_required_value_rejects_empty() {
        let n = node(serde_json::json!({"criteria": [], "other": {"a": 1}}));
        assert!(required_value(&n, "criteria").is_err());
        assert!(required_value(&n, "other").is_ok());
    }

    #[test]
    fn test_time_forms() {
        let n = node(serde_json::json!({
            "a": "09:30", "b": 14, "c": "8", "d": "noon", "e": 25
        }));
        assert_eq!(time_of_day(&n, "a").unwrap(), NaiveTime::from_hms_opt(9, 30, 0));
        assert_eq!(time_of_day(&n, "b").unwrap(), NaiveTime::from_hms_opt(14, 0, 0));
        assert_eq!(time_of_day(&n, "c").unwrap(), NaiveTime::from_hms_opt(8, 0, 0));
        assert!(time_of_day(&n, "d").is_err());
        assert!(time_of_day(&n, "e").is_err());
        assert_eq!(time_of_day(&n, "missing").unwrap(), None);
    }

    #[test]
    fn test_numbers_and_flags() {
        let n = node(serde_json::json!({
            "duration": "30", "startWorkday": 1, "bad": -2, "on": "true", "off": false
        }));
        assert_eq!(uint(&n, "duration").unwrap(), Some(30));
        assert_eq!(uint(&n, "startWorkday").unwrap(), Some(1));
        assert!(uint(&n, "bad").is_err());
        assert_eq!(flag(&n, "on"), Some(true));
        assert_eq!(flag(&n, "off"), Some(false));
        assert_eq!(flag(&n, "missing"), None);
    }
}
