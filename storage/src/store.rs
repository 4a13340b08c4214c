//! Named-relation cache with atomic whole-table replacement.
//!
//! Tables live in an in-memory DuckDB connection behind a mutex, so readers
//! observe either the previous snapshot of a table or the new one, never a
//! partial mix. Replacements are written through to a DuckDB-native file at
//! the store path plus a SQLite sibling (`<path>.sqlite`); on startup the
//! store file's leading byte signature decides which format-specific copy
//! path materializes the tracked tables back into memory.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use duckdb::types::ValueRef;
use duckdb::{params, params_from_iter, Connection};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::diff::DiffEngine;
use crate::error::{StoreError, StoreResult};
use crate::row::{column_union, value_to_text, Row};
use crate::sqlite;

/// Tables mirrored from the directory.
pub const TRACKED_TABLES: [&str; 7] = [
    "service_principals",
    "app_role_assignments",
    "app_role_assigned_to",
    "app_roles",
    "sp_oauth_grants",
    "sp_member_of",
    "applications",
];

const SQLITE_SIGNATURE: &[u8] = b"SQLite format 3\0";

pub struct DirectoryStore {
    state: Mutex<StoreState>,
    db_path: PathBuf,
    diff: Option<DiffEngine>
}

struct StoreState {
    conn: Connection,
    tables: HashSet<String>
}

impl DirectoryStore {
    /// Opens the store, bootstrapping from an existing store file when one
    /// is present. A missing file starts the store empty; an unrecognized
    /// container signature is fatal.
    pub async fn open(
        db_path: impl Into<PathBuf>,
        diff: Option<DiffEngine>
    ) -> StoreResult<Self> {
        let db_path = db_path.into();
        let conn = Connection::open_in_memory()?;
        let store = Self {
            state: Mutex::new(StoreState {
                conn,
                tables: HashSet::new()
            }),
            db_path,
            diff
        };
        store.load_from_disk().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn diff(&self) -> Option<&DiffEngine> {
        self.diff.as_ref()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state.lock().tables.contains(name)
    }

    /// True when the store file exists and is younger than `refresh_days`.
    pub fn fresh(&self, refresh_days: i64) -> bool {
        match std::fs::metadata(&self.db_path).and_then(|m| m.modified()) {
            Ok(modified) => {
                let modified: chrono::DateTime<chrono::Utc> = modified.into();
                let age = chrono::Utc::now().signed_duration_since(modified);
                age.num_days() < refresh_days
            }
            Err(_) => false
        }
    }

    async fn load_from_disk(&self) -> StoreResult<()> {
        if !self.db_path.exists() {
            info!(path = %self.db_path.display(), "no existing store, starting empty");
            return Ok(());
        }

        info!(path = %self.db_path.display(), "opening store");
        let header = read_signature(&self.db_path)?;

        if header.starts_with(SQLITE_SIGNATURE) {
            self.load_sqlite().await
        } else if header.len() >= 12 && &header[8..12] == b"DUCK" {
            self.load_duckdb()
        } else {
            let err = StoreError::UnknownFormat {
                path: self.db_path.display().to_string()
            };
            error!(path = %self.db_path.display(), "unrecognized store file signature");
            Err(err)
        }
    }

    fn load_duckdb(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.conn.execute(
            &format!(
                "ATTACH DATABASE '{}' AS disk_db",
                sql_escape(&self.db_path.display().to_string())
            ),
            []
        )?;
        for table in TRACKED_TABLES {
            match state.conn.execute(
                &format!("CREATE OR REPLACE TABLE {table} AS SELECT * FROM disk_db.{table}"),
                []
            ) {
                Ok(_) => {
                    state.tables.insert(table.to_string());
                }
                Err(e) => warn!(table, error = %e, "table missing from store file")
            }
        }
        state.conn.execute("DETACH DATABASE disk_db", [])?;
        info!(path = %self.db_path.display(), tables = state.tables.len(), "loaded duckdb store into memory");
        Ok(())
    }

    async fn load_sqlite(&self) -> StoreResult<()> {
        let loaded = sqlite::read_tables(&self.db_path, &TRACKED_TABLES).await?;
        let mut state = self.state.lock();
        for (table, rows) in loaded {
            if rows.is_empty() {
                warn!(table = %table, "empty table in sqlite store, skipping");
                continue;
            }
            Self::replace_table(&mut state, &table, &rows)?;
        }
        info!(path = %self.db_path.display(), tables = state.tables.len(), "loaded sqlite store into memory");
        Ok(())
    }

    /// Replaces `name` with the given snapshot.
    ///
    /// When a diff engine is configured and a previous snapshot exists, the
    /// two snapshots are compared before the replacement. Empty incoming row
    /// sets are rejected so a failed fetch can never silently wipe a table.
    /// The in-memory replacement commits before persistence; a persistence
    /// fault is surfaced but leaves the in-memory copy intact.
    pub async fn store_table(&self, name: &str, rows: Vec<Row>, persist: bool) -> StoreResult<()> {
        {
            let mut state = self.state.lock();

            if let Some(diff) = &self.diff {
                if state.tables.contains(name) {
                    let previous = read_rows(&state.conn, &format!("SELECT * FROM {name}"))?;
                    diff.compare(name, &previous, &rows);
                }
            }

            if rows.is_empty() {
                warn!(table = name, "empty row set for table, keeping previous snapshot");
                return Ok(());
            }

            Self::replace_table(&mut state, name, &rows)?;
            info!(table = name, rows = rows.len(), "stored table");

            if persist {
                if let Err(e) = Self::persist_to_disk(&state.conn, &self.db_path, name) {
                    error!(table = name, error = %e, "failed to persist table");
                    return Err(StoreError::Persist {
                        table: name.to_string(),
                        message: e.to_string()
                    });
                }
            }
        }

        if persist {
            let mirror = sqlite_mirror_path(&self.db_path);
            if let Err(e) = sqlite::write_table(&mirror, name, &rows).await {
                error!(table = name, error = %e, "failed to mirror table to sqlite");
                return Err(StoreError::Persist {
                    table: name.to_string(),
                    message: e.to_string()
                });
            }
        }

        Ok(())
    }

    fn replace_table(state: &mut StoreState, name: &str, rows: &[Row]) -> StoreResult<()> {
        let columns = column_union(rows);
        if columns.is_empty() {
            warn!(table = name, "rows carry no fields, keeping previous snapshot");
            return Ok(());
        }

        let column_list = columns
            .iter()
            .map(|c| format!("\"{c}\" VARCHAR"))
            .collect::<Vec<_>>()
            .join(", ");
        state
            .conn
            .execute(&format!("CREATE OR REPLACE TABLE {name} ({column_list})"), [])?;

        let placeholders = vec!["?"; columns.len()].join(", ");
        let mut stmt = state
            .conn
            .prepare(&format!("INSERT INTO {name} VALUES ({placeholders})"))?;
        for row in rows {
            let values: Vec<Option<String>> = columns
                .iter()
                .map(|c| row.get(c).and_then(value_to_text))
                .collect();
            stmt.execute(params_from_iter(values))?;
        }

        state.tables.insert(name.to_string());
        Ok(())
    }

    fn persist_to_disk(conn: &Connection, db_path: &Path, name: &str) -> StoreResult<()> {
        conn.execute(
            &format!(
                "ATTACH DATABASE '{}' AS disk_db",
                sql_escape(&db_path.display().to_string())
            ),
            []
        )?;
        let copied = conn.execute(
            &format!("CREATE OR REPLACE TABLE disk_db.{name} AS SELECT * FROM {name}"),
            []
        );
        let detached = conn.execute("DETACH DATABASE disk_db", []);
        copied?;
        detached?;
        debug!(table = name, path = %db_path.display(), "table persisted to disk");
        Ok(())
    }

    /// Generic read surface: runs a SQL query against the in-memory relation
    /// set. A query against a table that does not exist yet degrades to an
    /// empty result.
    pub fn query(&self, sql: &str) -> StoreResult<Vec<Row>> {
        let state = self.state.lock();
        match read_rows(&state.conn, sql) {
            Ok(rows) => Ok(rows),
            Err(StoreError::DuckDb(e)) if e.to_string().contains("does not exist") => {
                info!("query returned empty result due to missing table");
                Ok(Vec::new())
            }
            Err(e) => {
                error!(error = %e, sql, "query failed");
                Err(e)
            }
        }
    }

    /// Row count of one table; zero when the table does not exist yet.
    pub fn row_count(&self, name: &str) -> StoreResult<usize> {
        let rows = self.query(&format!("SELECT count(*) AS n FROM {name}"))?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    /// Enrichment lookup: full service-principal rows for the given id set,
    /// with role assignments (import/export, scope-resolved), OAuth grants,
    /// the joined application and directory memberships nested in. All seven
    /// tracked tables must exist.
    pub fn get_by_id(&self, sp_ids: &[String]) -> StoreResult<Vec<Value>> {
        let state = self.state.lock();

        for table in TRACKED_TABLES {
            if !state.tables.contains(table) {
                let err = StoreError::MissingTable {
                    table: table.to_string()
                };
                error!(table, "enrichment lookup requires table");
                return Err(err);
            }
        }

        let id_list = sp_ids
            .iter()
            .map(|id| format!("'{}'", sql_escape(id)))
            .collect::<Vec<_>>()
            .join(",");
        let sp_rows = read_rows(
            &state.conn,
            &format!("SELECT * FROM service_principals WHERE id IN ({id_list})")
        )?;
        if sp_rows.is_empty() {
            warn!("no entries found in service_principals");
            return Ok(Vec::new());
        }

        let mut enriched = Vec::new();
        for sp in sp_rows {
            let Some(sp_id) = sp.id().map(ToString::to_string) else {
                warn!("service principal row is missing id property");
                continue;
            };
            let sp_id = sql_escape(&sp_id);

            let imports = read_rows(
                &state.conn,
                &format!(
                    r#"
                    SELECT a.*, COALESCE(r."value", 'No matching role') AS scope
                    FROM (
                        SELECT * FROM app_role_assigned_to WHERE "principalId" IN ('{sp_id}')
                    ) a
                    LEFT JOIN app_roles r
                        ON lower(a."appRoleId") = lower(r.id)
                        AND r.service_principal_id = a."resourceId"
                    "#
                )
            )?;

            let exports = read_rows(
                &state.conn,
                &format!(
                    r#"
                    SELECT a.*, COALESCE(r."value", 'No matching role') AS scope
                    FROM (
                        SELECT * FROM app_role_assignments WHERE "resourceId" IN ('{sp_id}')
                        UNION BY NAME
                        SELECT * FROM app_role_assigned_to WHERE "resourceId" IN ('{sp_id}')
                    ) a
                    LEFT JOIN app_roles r ON a."appRoleId" = r.id
                    "#
                )
            )?;

            let grants = read_rows(
                &state.conn,
                &format!(
                    r#"
                    SELECT g.*, COALESCE(sp."displayName", 'No matching resource') AS "resourceDisplayName"
                    FROM sp_oauth_grants g
                    LEFT JOIN service_principals sp ON lower(g."resourceId") = lower(sp.id)
                    WHERE g.service_principal_id IN ('{sp_id}')
                    "#
                )
            )?;

            let applications = read_rows(
                &state.conn,
                &format!(
                    r#"
                    SELECT a.*, sp.id AS service_principal_id
                    FROM applications a
                    INNER JOIN service_principals sp ON lower(sp."appId") = lower(a."appId")
                    WHERE sp.id IN ('{sp_id}')
                    "#
                )
            )?;

            let memberships = read_rows(
                &state.conn,
                &format!("SELECT * FROM sp_member_of WHERE service_principal_id = '{sp_id}'")
            )?;

            let application = match applications.into_iter().next() {
                Some(app) => {
                    let mut decoded = app.decode_embedded();
                    enrich_resource_access(&state.conn, &mut decoded)?;
                    decoded
                }
                None => Value::Null
            };

            let mut obj = match sp.decode_embedded() {
                Value::Object(fields) => fields,
                _ => Map::new()
            };
            obj.insert("appRoleImports".to_string(), decode_rows(&imports));
            obj.insert("appRoleExports".to_string(), decode_rows(&exports));
            obj.insert("oauth2PermissionGrants".to_string(), decode_rows(&grants));
            obj.insert("application".to_string(), application);
            obj.insert("member_of".to_string(), decode_rows(&memberships));
            enriched.push(Value::Object(obj));
        }

        Ok(enriched)
    }
}

/// Resolves display names and role labels for an application's
/// `requiredResourceAccess` entries. Missing matches leave the enrichment
/// fields absent.
fn enrich_resource_access(conn: &Connection, app: &mut Value) -> StoreResult<()> {
    let Some(rra_list) = app
        .get_mut("requiredResourceAccess")
        .and_then(Value::as_array_mut)
    else {
        return Ok(());
    };

    for rra in rra_list {
        let resource_app_id = rra
            .get("resourceAppId")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_lowercase();
        if resource_app_id.is_empty() {
            continue;
        }

        let mut stmt = conn.prepare(
            r#"SELECT "displayName" FROM service_principals WHERE lower("appId") = ?"#
        )?;
        let mut rows = stmt.query(params![resource_app_id])?;
        if let Some(row) = rows.next()? {
            let display_name: Option<String> = row.get(0)?;
            if let Some(display_name) = display_name {
                rra["resourceDisplayName"] = Value::String(display_name);
            }
        }

        let Some(access_list) = rra.get_mut("resourceAccess").and_then(Value::as_array_mut)
        else {
            continue;
        };
        for access in access_list {
            if access.get("type").and_then(Value::as_str) != Some("Role") {
                continue;
            }
            let role_id = access
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_lowercase();
            if role_id.is_empty() {
                continue;
            }
            let mut stmt = conn
                .prepare(r#"SELECT "value", description FROM app_roles WHERE lower(id) = ?"#)?;
            let mut rows = stmt.query(params![role_id])?;
            if let Some(row) = rows.next()? {
                let value: Option<String> = row.get(0)?;
                let description: Option<String> = row.get(1)?;
                if let Some(value) = value {
                    access["scope"] = Value::String(value);
                }
                if let Some(description) = description {
                    access["description"] = Value::String(description);
                }
            }
        }
    }

    Ok(())
}

fn decode_rows(rows: &[Row]) -> Value {
    Value::Array(rows.iter().map(Row::decode_embedded).collect())
}

fn read_rows(conn: &Connection, sql: &str) -> StoreResult<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let mut db_rows = stmt.query([])?;
    let mut names: Vec<String> = Vec::new();
    let mut out = Vec::new();
    while let Some(db_row) = db_rows.next()? {
        if names.is_empty() {
            let stmt: &duckdb::Statement<'_> = db_row.as_ref();
            names = stmt
                .column_names()
                .iter()
                .map(ToString::to_string)
                .collect();
        }
        let mut fields = Map::new();
        for (idx, name) in names.iter().enumerate() {
            fields.insert(name.clone(), value_ref_to_json(db_row.get_ref(idx)?));
        }
        out.push(Row(fields));
    }
    Ok(out)
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i),
        ValueRef::SmallInt(i) => Value::from(i),
        ValueRef::Int(i) => Value::from(i),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::HugeInt(i) => Value::String(i.to_string()),
        ValueRef::UTinyInt(i) => Value::from(i),
        ValueRef::USmallInt(i) => Value::from(i),
        ValueRef::UInt(i) => Value::from(i),
        ValueRef::UBigInt(i) => Value::from(i),
        ValueRef::Float(f) => Value::from(f64::from(f)),
        ValueRef::Double(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        _ => Value::Null
    }
}

fn read_signature(path: &Path) -> StoreResult<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 16];
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(header[..read].to_vec())
}

fn sql_escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn sqlite_mirror_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".sqlite");
    PathBuf::from(name)
}
