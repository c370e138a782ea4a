//! Delivery metadata normalization

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};

/// Canonical rendering of `generated_at`
pub const GENERATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const PLACEHOLDERS: &[&str] = &[
    "",
    "untitled",
    "untitled project",
    "untitled task",
    "unknown",
    "n/a",
    "none",
];

fn is_placeholder(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    PLACEHOLDERS.contains(&value.as_str())
}

/// Normalize caller-supplied metadata.
///
/// `project_name` and `task_name` are trimmed and placeholder literals are
/// replaced by defaults; `generated_at` is coerced to local time.
pub fn normalize(
    metadata: Option<Value>,
    default_project: &str,
    title: &str,
    now: DateTime<Utc>,
) -> Result<Map<String, Value>> {
    let mut map = match metadata {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(AppError::validation(
                "invalid_metadata",
                "metadata must be an object",
            ))
        }
    };

    for (key, default) in [("project_name", default_project), ("task_name", title)] {
        let value = match map.get(key) {
            Some(Value::String(s)) if !is_placeholder(s) => s.trim().to_string(),
            _ => default.trim().to_string(),
        };
        map.insert(key.to_string(), Value::String(value));
    }

    let generated_at = map
        .get("generated_at")
        .and_then(parse_timestamp)
        .unwrap_or(now);
    map.insert(
        "generated_at".to_string(),
        Value::String(
            generated_at
                .with_timezone(&Local)
                .format(GENERATED_AT_FORMAT)
                .to_string(),
        ),
    );

    Ok(map)
}

/// Parse the timestamp shapes agents send for `generated_at`
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in [GENERATED_AT_FORMAT, "%Y-%m-%dT%H:%M:%S"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Local
                        .from_local_datetime(&naive)
                        .earliest()
                        .map(|dt| dt.with_timezone(&Utc));
                }
            }
            s.parse::<i64>().ok().and_then(from_unix)
        }
        Value::Number(n) => n.as_i64().and_then(from_unix),
        _ => None,
    }
}

fn from_unix(n: i64) -> Option<DateTime<Utc>> {
    // Values past year 2286 in seconds are taken as milliseconds
    if n.abs() >= 10_000_000_000 {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

/// Project name used when the caller does not provide one
pub fn default_project_name() -> String {
    std::env::current_dir()
        .ok()
        .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "handoff".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholders_replaced_by_defaults() {
        let map = normalize(
            Some(json!({"project_name": "  Untitled Project ", "task_name": "N/A"})),
            "my-repo",
            "Review login page",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(map["project_name"], "my-repo");
        assert_eq!(map["task_name"], "Review login page");
    }

    #[test]
    fn test_real_names_are_trimmed() {
        let map = normalize(
            Some(json!({"project_name": "  shop  ", "task_name": "checkout ", "extra": 1})),
            "my-repo",
            "title",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(map["project_name"], "shop");
        assert_eq!(map["task_name"], "checkout");
        assert_eq!(map["extra"], 1);
    }

    #[test]
    fn test_generated_at_canonicalized() {
        let map = normalize(
            Some(json!({"generated_at": "2026-03-01T10:00:00Z"})),
            "p",
            "t",
            Utc::now(),
        )
        .unwrap();
        let expected = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Local)
            .format(GENERATED_AT_FORMAT)
            .to_string();
        assert_eq!(map["generated_at"], expected);
    }

    #[test]
    fn test_unparseable_generated_at_defaults_to_now() {
        let now = Utc::now();
        let map = normalize(Some(json!({"generated_at": "yesterday"})), "p", "t", now).unwrap();
        let expected = now.with_timezone(&Local).format(GENERATED_AT_FORMAT).to_string();
        assert_eq!(map["generated_at"], expected);
    }

    #[test]
    fn test_unix_timestamps_accepted() {
        let secs = parse_timestamp(&json!(1_760_000_000)).unwrap();
        let millis = parse_timestamp(&json!(1_760_000_000_000i64)).unwrap();
        assert_eq!(secs, millis);
        assert!(parse_timestamp(&json!(true)).is_none());
    }

    #[test]
    fn test_non_object_metadata_rejected() {
        let err = normalize(Some(json!(["x"])), "p", "t", Utc::now()).unwrap_err();
        assert_eq!(err.code(), "invalid_metadata");
    }
}
