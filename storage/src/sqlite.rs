//! SQLite snapshot mirror.
//!
//! Every stored table is mirrored into a sibling SQLite file so external
//! tooling can read the cache, and a SQLite-format store file can bootstrap
//! the in-memory relation set. Columns are plain TEXT throughout.

use std::path::Path;

use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _};
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::row::{column_union, value_to_text, Row};

/// Replaces one table in the mirror file with the given snapshot, inside a
/// single transaction.
pub(crate) async fn write_table(path: &Path, name: &str, rows: &[Row]) -> StoreResult<()> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    let columns = column_union(rows);
    if columns.is_empty() {
        warn!(table = name, "no columns to mirror");
        pool.close().await;
        return Ok(());
    }
    let column_list = columns
        .iter()
        .map(|c| format!("\"{c}\" TEXT"))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let insert = format!("INSERT INTO \"{name}\" VALUES ({placeholders})");

    let mut tx = pool.begin().await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS \"{name}\""))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!("CREATE TABLE \"{name}\" ({column_list})"))
        .execute(&mut *tx)
        .await?;
    for row in rows {
        let mut query = sqlx::query(&insert);
        for column in &columns {
            query = query.bind(row.get(column).and_then(value_to_text));
        }
        query.execute(&mut *tx).await?;
    }
    tx.commit().await?;
    pool.close().await;

    debug!(table = name, rows = rows.len(), path = %path.display(), "mirrored table to sqlite");
    Ok(())
}

/// Reads every tracked table present in a SQLite-format store file. Values
/// come back as text regardless of the declared column affinity.
pub(crate) async fn read_tables(
    path: &Path,
    tables: &[&str]
) -> StoreResult<Vec<(String, Vec<Row>)>> {
    let options = SqliteConnectOptions::new().filename(path).read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    let mut out = Vec::new();
    for table in tables {
        match sqlx::query(&format!("SELECT * FROM \"{table}\""))
            .fetch_all(&pool)
            .await
        {
            Ok(db_rows) => {
                let rows = db_rows.iter().map(row_from_sqlite).collect::<Vec<_>>();
                out.push(((*table).to_string(), rows));
            }
            Err(sqlx::Error::Database(e)) if e.message().contains("no such table") => {
                warn!(table = %table, "table missing from sqlite store");
            }
            Err(e) => return Err(e.into())
        }
    }
    pool.close().await;
    Ok(out)
}

fn row_from_sqlite(db_row: &SqliteRow) -> Row {
    let mut fields = Map::new();
    for (idx, column) in db_row.columns().iter().enumerate() {
        fields.insert(column.name().to_string(), read_value(db_row, idx));
    }
    Row(fields)
}

fn read_value(db_row: &SqliteRow, idx: usize) -> Value {
    if let Ok(text) = db_row.try_get::<Option<String>, _>(idx) {
        return text.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(int) = db_row.try_get::<Option<i64>, _>(idx) {
        return int.map(|i| Value::String(i.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(float) = db_row.try_get::<Option<f64>, _>(idx) {
        return float.map(|f| Value::String(f.to_string())).unwrap_or(Value::Null);
    }
    Value::Null
}
