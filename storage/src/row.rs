use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One cached directory record: a flat field map in which nested structures
/// are carried as embedded JSON strings.
///
/// Rows are stored in the all-varchar relational model: scalars are coerced
/// to strings at construction so a row survives a persist/reload round trip
/// byte-identically, which keeps content hashes stable across runs. The
/// structured view is recovered lazily through [`Row::decode_embedded`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(pub Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Flattens a fetched JSON object into a row. Nested lists and objects
    /// become embedded JSON strings; non-object inputs yield an empty row.
    pub fn from_object(value: Value) -> Self {
        match value {
            Value::Object(fields) => {
                Self(fields.into_iter().map(|(k, v)| (k, scalarize(v))).collect())
            }
            _ => Self::default()
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Structured read-out view: embedded JSON strings are decoded back into
    /// lists/objects; strings that do not parse as JSON stay plain strings.
    /// The stored row is never mutated.
    pub fn decode_embedded(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), decode_value(v)))
                .collect()
        )
    }
}

fn scalarize(value: Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(s),
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Number(n) => Value::String(n.to_string()),
        nested @ (Value::Array(_) | Value::Object(_)) => Value::String(nested.to_string())
    }
}

fn decode_value(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
        other => other.clone()
    }
}

/// Union of field names across a row set, in first-seen order.
pub(crate) fn column_union(rows: &[Row]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut columns = Vec::new();
    for row in rows {
        for field in row.0.keys() {
            if seen.insert(field.clone()) {
                columns.push(field.clone());
            }
        }
    }
    columns
}

/// Text form of a stored value for a varchar column, `None` for SQL NULL.
pub(crate) fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_object_scalarizes_nested_values() {
        let row = Row::from_object(json!({
            "id": "sp-1",
            "displayName": "Test App",
            "accountEnabled": true,
            "keyCredentials": [{"keyId": "k1"}],
            "tags": []
        }));

        assert_eq!(row.get_str("id"), Some("sp-1"));
        assert_eq!(row.get_str("accountEnabled"), Some("true"));
        assert_eq!(row.get_str("keyCredentials"), Some(r#"[{"keyId":"k1"}]"#));
        assert_eq!(row.get_str("tags"), Some("[]"));
    }

    #[test]
    fn test_decode_embedded_round_trips_structures() {
        let row = Row::from_object(json!({
            "id": "sp-1",
            "keyCredentials": [{"keyId": "k1"}],
            "displayName": "Plain Name"
        }));

        let decoded = row.decode_embedded();
        assert_eq!(decoded["keyCredentials"], json!([{"keyId": "k1"}]));
        assert_eq!(decoded["displayName"], json!("Plain Name"));
    }

    #[test]
    fn test_decode_embedded_keeps_malformed_json_as_string() {
        let mut row = Row::new();
        row.insert("broken", json!("{not json"));

        let decoded = row.decode_embedded();
        assert_eq!(decoded["broken"], json!("{not json"));
    }

    #[test]
    fn test_column_union_preserves_first_seen_order() {
        let a = Row::from_object(json!({"id": "1", "name": "a"}));
        let b = Row::from_object(json!({"id": "2", "extra": "x"}));

        assert_eq!(column_union(&[a, b]), vec!["id", "name", "extra"]);
    }
}
