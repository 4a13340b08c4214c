//! Content-hash change detection between table snapshots.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::row::Row;

/// Maps a table name to the field subset whose values participate in the
/// change-detection digest.
#[derive(Debug, Clone, Default)]
pub struct DiffConfig {
    watched: HashMap<String, Vec<String>>
}

impl DiffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(
        mut self,
        table: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>
    ) -> Self {
        self.watched
            .insert(table.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn fields(&self, table: &str) -> Option<&[String]> {
        self.watched.get(table).map(Vec::as_slice)
    }
}

/// Row-level changes of one table between two sync runs.
#[derive(Debug, Clone, Default)]
pub struct TableDiff {
    /// Rows present only in the new snapshot that carry a watched-field
    /// signal.
    pub new: Vec<Row>,
    /// Rows present only in the previous snapshot.
    pub deleted: Vec<Row>,
    /// Previous-snapshot rows whose watched-field digest changed.
    pub modified: Vec<Row>
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }
}

/// Classifies table changes across sync runs.
///
/// Watched fields are supplied once through [`DiffConfig`]; per-run results
/// are retained by table name until the engine is dropped.
pub struct DiffEngine {
    config: DiffConfig,
    results: Mutex<HashMap<String, TableDiff>>
}

impl DiffEngine {
    pub fn new(config: DiffConfig) -> Self {
        Self {
            config,
            results: Mutex::new(HashMap::new())
        }
    }

    /// Compares the previous snapshot of `table` against the incoming one.
    ///
    /// An empty previous snapshot means there is no baseline yet and yields
    /// an empty result, as does comparing a table with no registered
    /// watched-field set.
    pub fn compare(&self, table: &str, previous: &[Row], current: &[Row]) -> TableDiff {
        if previous.is_empty() {
            warn!(table, "empty previous snapshot, first run?");
            return TableDiff::default();
        }

        let Some(fields) = self.config.fields(table) else {
            warn!(table, "no watched fields registered for table");
            return TableDiff::default();
        };

        let prev_hashes: HashMap<&str, Option<String>> = index_hashes(previous, fields);
        let curr_hashes: HashMap<&str, Option<String>> = index_hashes(current, fields);

        let mut result = TableDiff::default();

        for row in current {
            let Some(id) = row.id() else { continue };
            if !prev_hashes.contains_key(id) && curr_hashes.get(id).is_some_and(Option::is_some) {
                result.new.push(row.clone());
            }
        }

        for row in previous {
            let Some(id) = row.id() else { continue };
            match curr_hashes.get(id) {
                None => result.deleted.push(row.clone()),
                Some(curr_hash) => {
                    let prev_hash = prev_hashes.get(id).cloned().flatten();
                    if let (Some(prev), Some(curr)) = (prev_hash, curr_hash.as_ref()) {
                        if prev != *curr {
                            result.modified.push(row.clone());
                        }
                    }
                }
            }
        }

        debug!(
            table,
            new = result.new.len(),
            deleted = result.deleted.len(),
            modified = result.modified.len(),
            "snapshot comparison complete"
        );

        self.results
            .lock()
            .insert(table.to_string(), result.clone());
        result
    }

    /// The retained result for one table, if a comparison has run.
    pub fn result(&self, table: &str) -> Option<TableDiff> {
        self.results.lock().get(table).cloned()
    }

    /// All retained results for this run.
    pub fn results(&self) -> HashMap<String, TableDiff> {
        self.results.lock().clone()
    }
}

fn index_hashes<'a>(rows: &'a [Row], fields: &[String]) -> HashMap<&'a str, Option<String>> {
    rows.iter()
        .filter_map(|row| row.id().map(|id| (id, hash_row(row, fields))))
        .collect()
}

/// Digest over the watched-field subset of a row, in stable field order.
///
/// Fields that are absent or semantically empty do not participate; a row
/// with no participating field has no signal and hashes to `None`.
pub fn hash_row(row: &Row, fields: &[String]) -> Option<String> {
    let mut watched = BTreeMap::new();
    for field in fields {
        if let Some(value) = row.get(field) {
            if is_signal_value(value) {
                watched.insert(field.as_str(), value);
            }
        }
    }

    if watched.is_empty() {
        return None;
    }

    let encoded = serde_json::to_string(&watched).expect("watched field serialization");
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

fn is_signal_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => {
            !s.is_empty() && !matches!(s.as_str(), "[]" | "{}" | "null" | "None")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        _ => true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn sp_row(id: &str, key_creds: &str, pwd_creds: &str) -> Row {
        Row::from_object(json!({
            "id": id,
            "displayName": format!("sp {id}"),
            "keyCredentials": key_creds,
            "passwordCredentials": pwd_creds
        }))
    }

    fn engine() -> DiffEngine {
        DiffEngine::new(
            DiffConfig::new()
                .watch("service_principals", ["keyCredentials", "passwordCredentials"])
        )
    }

    #[test]
    fn test_identical_snapshots_yield_empty_result() {
        let rows = vec![sp_row("a", r#"[{"keyId":"k1"}]"#, "[]"), sp_row("b", "[]", "[]")];
        let result = engine().compare("service_principals", &rows, &rows.clone());
        assert!(result.is_empty());
    }

    #[test]
    fn test_empty_previous_snapshot_short_circuits() {
        let current = vec![sp_row("a", r#"[{"keyId":"k1"}]"#, "[]")];
        let result = engine().compare("service_principals", &[], &current);
        assert!(result.is_empty());
    }

    #[test]
    fn test_unregistered_table_yields_empty_result() {
        let rows = vec![sp_row("a", r#"[{"keyId":"k1"}]"#, "[]")];
        let result = engine().compare("applications", &rows, &rows.clone());
        assert!(result.is_empty());
    }

    #[test]
    fn test_classification() {
        let previous = vec![
            sp_row("kept", r#"[{"keyId":"k1"}]"#, "[]"),
            sp_row("rotated", r#"[{"keyId":"old"}]"#, "[]"),
            sp_row("removed", r#"[{"keyId":"k2"}]"#, "[]"),
        ];
        let current = vec![
            sp_row("kept", r#"[{"keyId":"k1"}]"#, "[]"),
            sp_row("rotated", r#"[{"keyId":"new"}]"#, "[]"),
            sp_row("added", r#"[{"keyId":"k3"}]"#, "[]"),
        ];

        let result = engine().compare("service_principals", &previous, &current);

        let ids = |rows: &[Row]| -> Vec<String> {
            rows.iter().filter_map(|r| r.id().map(String::from)).collect()
        };
        assert_eq!(ids(&result.new), vec!["added"]);
        assert_eq!(ids(&result.deleted), vec!["removed"]);
        assert_eq!(ids(&result.modified), vec!["rotated"]);
    }

    #[test]
    fn test_new_row_without_signal_is_excluded() {
        let previous = vec![sp_row("a", r#"[{"keyId":"k1"}]"#, "[]")];
        let current = vec![
            sp_row("a", r#"[{"keyId":"k1"}]"#, "[]"),
            sp_row("no-signal", "[]", ""),
        ];

        let result = engine().compare("service_principals", &previous, &current);
        assert!(result.new.is_empty());
    }

    #[test]
    fn test_deleted_row_without_signal_is_still_reported() {
        let previous = vec![
            sp_row("a", r#"[{"keyId":"k1"}]"#, "[]"),
            sp_row("no-signal", "[]", ""),
        ];
        let current = vec![sp_row("a", r#"[{"keyId":"k1"}]"#, "[]")];

        let result = engine().compare("service_principals", &previous, &current);
        assert_eq!(result.deleted.len(), 1);
        assert_eq!(result.deleted[0].id(), Some("no-signal"));
    }

    #[test]
    fn test_no_signal_rows_never_compare_as_modified() {
        let previous = vec![sp_row("a", "[]", "")];
        let current = vec![sp_row("a", "null", "None")];

        let result = engine().compare("service_principals", &previous, &current);
        assert!(result.modified.is_empty());
    }

    #[test]
    fn test_partition_completeness() {
        let previous = vec![
            sp_row("both-same", r#"[{"keyId":"k1"}]"#, "[]"),
            sp_row("both-changed", r#"[{"keyId":"old"}]"#, "[]"),
            sp_row("prev-only", "[]", "[]"),
        ];
        let current = vec![
            sp_row("both-same", r#"[{"keyId":"k1"}]"#, "[]"),
            sp_row("both-changed", r#"[{"keyId":"new"}]"#, "[]"),
            sp_row("curr-only", r#"[{"keyId":"k9"}]"#, "[]"),
        ];

        let result = engine().compare("service_principals", &previous, &current);

        let classified: Vec<&str> = result
            .new
            .iter()
            .chain(&result.deleted)
            .chain(&result.modified)
            .filter_map(Row::id)
            .collect();
        let classified_set: HashSet<&str> = classified.iter().copied().collect();
        assert_eq!(classified.len(), classified_set.len(), "no id is double-classified");

        let all_ids: HashSet<&str> = previous
            .iter()
            .chain(&current)
            .filter_map(Row::id)
            .collect();
        for id in &classified_set {
            assert!(all_ids.contains(id));
        }
        // both-same is the only unchanged id
        assert_eq!(all_ids.len(), classified_set.len() + 1);
        assert!(!classified_set.contains("both-same"));
    }

    #[test]
    fn test_hash_is_stable_and_ignores_unrelated_fields() {
        let fields = vec!["keyCredentials".to_string(), "passwordCredentials".to_string()];

        let row = sp_row("a", r#"[{"keyId":"k1"}]"#, "[]");
        assert_eq!(hash_row(&row, &fields), hash_row(&row, &fields));

        let mut renamed = row.clone();
        renamed.insert("displayName", json!("entirely different name"));
        renamed.insert("extraField", json!("noise"));
        assert_eq!(hash_row(&row, &fields), hash_row(&renamed, &fields));
    }

    #[test]
    fn test_hash_no_signal_marker() {
        let fields = vec!["keyCredentials".to_string(), "passwordCredentials".to_string()];
        let row = sp_row("a", "[]", "");
        assert_eq!(hash_row(&row, &fields), None);
    }

    #[test]
    fn test_results_are_retained_per_table() {
        let engine = engine();
        let previous = vec![sp_row("gone", r#"[{"keyId":"k1"}]"#, "[]")];
        let current = vec![sp_row("here", r#"[{"keyId":"k2"}]"#, "[]")];

        engine.compare("service_principals", &previous, &current);

        let retained = engine.result("service_principals").unwrap();
        assert_eq!(retained.new.len(), 1);
        assert_eq!(retained.deleted.len(), 1);
        assert!(engine.result("applications").is_none());
    }
}
