//! Diff report sink: per-table change summaries on the log, optional
//! credential detail report appended to a file.

use std::io::{self, Write};
use std::path::Path;

use serde_json::Value;
use tracing::info;

use storage::{DiffEngine, Row, TableDiff};

pub fn report_diff(engine: &DiffEngine, output_file: Option<&Path>) -> io::Result<()> {
    let results = engine.results();
    if results.is_empty() {
        info!("no snapshot comparisons were performed");
        return Ok(());
    }

    for (table, diff) in &results {
        info!(
            table = %table,
            new = diff.new.len(),
            deleted = diff.deleted.len(),
            modified = diff.modified.len(),
            "change summary"
        );
    }

    if let Some(path) = output_file {
        let mut out = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        for (table, diff) in &results {
            write_result(&mut out, table, diff)?;
        }
        info!(path = %path.display(), "diff detail report written");
    }

    Ok(())
}

fn write_result(out: &mut impl Write, table: &str, diff: &TableDiff) -> io::Result<()> {
    writeln!(out, "Type: {table}")?;
    write_creds_section(out, "Modified SPs with Client Credentials", &diff.modified)?;
    write_creds_section(out, "New SPs with Client Credentials     ", &diff.new)?;
    writeln!(out)
}

fn write_creds_section(out: &mut impl Write, title: &str, rows: &[Row]) -> io::Result<()> {
    writeln!(out, "==========[ {title} ]==========")?;
    for row in rows {
        writeln!(
            out,
            "\tID: {}, Name: {}",
            row.get_str("id").unwrap_or(""),
            row.get_str("displayName").unwrap_or("")
        )?;

        for (label, field) in [
            ("Key Credentials", "keyCredentials"),
            ("Password Credentials", "passwordCredentials"),
        ] {
            if let Some(creds) = row.get_str(field) {
                if creds.trim().len() > 2 && !matches!(creds, "[]" | "{}" | "null" | "None") {
                    writeln!(out, "\t\t[{label}]")?;
                    write_creds_array(out, creds)?;
                }
            }
        }
    }
    writeln!(out)
}

fn write_creds_array(out: &mut impl Write, creds: &str) -> io::Result<()> {
    let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(creds) else {
        writeln!(out, "\t\t\t{creds}")?;
        return Ok(());
    };

    for (idx, entry) in entries.iter().enumerate() {
        writeln!(out, "\t\t\tCredential #{}:", idx + 1)?;
        match entry {
            Value::Object(fields) => {
                for (key, value) in fields {
                    writeln!(out, "\t\t\t\t{key}: {}", truncate_value(value))?;
                }
            }
            other => writeln!(out, "\t\t\t\t{other}")?
        }
        writeln!(out)?;
    }
    Ok(())
}

fn truncate_value(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string()
    };
    if text.chars().count() > 50 {
        format!("{}...", text.chars().take(60).collect::<String>())
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_result_lists_credentials() {
        let diff = TableDiff {
            new: vec![Row::from_object(json!({
                "id": "sp-9",
                "displayName": "Newcomer",
                "keyCredentials": [{"keyId": "k9"}],
                "passwordCredentials": []
            }))],
            deleted: vec![],
            modified: vec![]
        };

        let mut buf = Vec::new();
        write_result(&mut buf, "service_principals", &diff).expect("write");
        let text = String::from_utf8(buf).expect("utf8");

        assert!(text.contains("Type: service_principals"));
        assert!(text.contains("ID: sp-9, Name: Newcomer"));
        assert!(text.contains("[Key Credentials]"));
        assert!(text.contains("keyId: k9"));
        assert!(!text.contains("[Password Credentials]"));
    }

    #[test]
    fn test_truncate_value_caps_long_secrets() {
        let long = Value::String("x".repeat(200));
        let shown = truncate_value(&long);
        assert!(shown.ends_with("..."));
        assert!(shown.len() <= 63);
    }
}
