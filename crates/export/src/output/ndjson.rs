//! Bundle decomposition into newline-delimited entries

use serde_json::Value;

/// Split a bundle-shaped payload into one compact JSON line per `entry`
///
/// A bundle with no `entry` array yields no lines. Payloads that are not
/// JSON objects are an error.
pub fn ndjson_entries(payload: &str) -> Result<Vec<String>, serde_json::Error> {
    let bundle: Value = serde_json::from_str(payload)?;
    if !bundle.is_object() {
        return Err(serde::de::Error::custom("payload is not a JSON object"));
    }

    match bundle.get("entry").and_then(Value::as_array) {
        Some(entries) => entries.iter().map(serde_json::to_string).collect(),
        None => Ok(vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_become_lines() {
        let payload = r#"{
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "Patient", "id": "1"}},
                {"resource": {"resourceType": "Patient", "id": "2"}}
            ]
        }"#;

        let lines = ndjson_entries(payload).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"resource":{"id":"1","resourceType":"Patient"}}"#);
        assert!(lines.iter().all(|l| !l.contains('\n')));
    }

    #[test]
    fn test_bundle_without_entries() {
        assert!(ndjson_entries(r#"{"resourceType": "Bundle", "total": 0}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unreadable_payload() {
        assert!(ndjson_entries("not json").is_err());
        assert!(ndjson_entries("[1, 2]").is_err());
    }
}
