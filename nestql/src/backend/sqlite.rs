use super::connection::{ConnectionState, LazyConnection};
use crate::error::{NestqlError, Result};
use crate::migration::create_statements;
use crate::relational::layout::{quote, RESOURCE_ID, ROW_ID};
use crate::relational::{Catalog, Mode, ResourceMetadata, Row, SqlQuery, SqlValue, StructuredPayload};
use crate::schema::IS_DELETED;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::{ffi, params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b.as_slice())),
        })
    }
}

/// Normalized resource storage in SQLite.
pub struct SqliteBackend {
    connection: LazyConnection<Mutex<Connection>>,
    queries: AtomicUsize,
}

impl SqliteBackend {
    /// Open (or create) a database file on first use.
    pub fn open(path: &Path) -> Self {
        let path: PathBuf = path.to_path_buf();
        Self::with_connector(move || {
            Connection::open(&path).map_err(|e| {
                NestqlError::ConnectionFailed(format!("{}: {e}", path.display()))
            })
        })
    }

    /// A private in-memory database (for testing).
    pub fn open_in_memory() -> Self {
        Self::with_connector(|| {
            Connection::open_in_memory().map_err(|e| NestqlError::ConnectionFailed(e.to_string()))
        })
    }

    fn with_connector(connect: impl Fn() -> Result<Connection> + Send + Sync + 'static) -> Self {
        SqliteBackend {
            connection: LazyConnection::new(move || {
                let conn = connect()?;
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                initialize_tables(&conn)?;
                Ok(Mutex::new(conn))
            }),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Number of read statements executed so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn with<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mutex = self.connection.get()?;
        let mut conn = mutex
            .lock()
            .map_err(|_| NestqlError::Other("SQLite connection lock poisoned".into()))?;
        f(&mut conn)
    }

    // ── Schema State ─────────────────────────────────────────────

    /// Create every table of the catalog that does not exist yet.
    pub fn apply_schema(&self, catalog: &Catalog) -> Result<()> {
        let mut statements = Vec::new();
        for metadata in catalog.resources() {
            let structures: Vec<_> = metadata.structures.values().collect();
            statements.extend(create_statements(&structures));
        }
        self.execute_batch(&statements)?;
        log::info!("Applied schema: {} statements", statements.len());
        Ok(())
    }

    /// Run DDL statements in one transaction.
    pub fn execute_batch(&self, statements: &[String]) -> Result<()> {
        self.with(|conn| {
            let tx = conn.transaction()?;
            for statement in statements {
                log::debug!("{statement}");
                tx.execute_batch(statement)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Most recent model hash and source.
    pub fn last_schema(&self) -> Result<Option<(String, String)>> {
        self.with(|conn| {
            let result = conn
                .query_row(
                    "SELECT hash, model_yaml FROM schema_history ORDER BY id DESC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(result)
        })
    }

    pub fn record_schema(&self, hash: &str, yaml: &str) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO schema_history (hash, model_yaml) VALUES (?1, ?2)",
                params![hash, yaml],
            )?;
            Ok(())
        })
    }

    pub fn record_migration(&self, description: &str) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO migrations (description) VALUES (?1)",
                params![description],
            )?;
            Ok(())
        })
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn execute(&self, query: &SqlQuery) -> Result<Vec<Row>> {
        self.query_rows(&query.sql, &query.params)
    }

    /// Run a read statement; each row becomes a column → value map.
    pub fn query_rows(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        log::debug!("{sql}");
        self.with(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;

            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let mut map = Row::new();
                for (i, name) in names.iter().enumerate() {
                    let value: SqliteValue = row.get(i)?;
                    map.insert(name.clone(), to_json(value));
                }
                results.push(map);
            }
            Ok(results)
        })
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Write a structured resource in one transaction. Replaced sub-tables
    /// are cleared children first, then rows are inserted parents first.
    pub fn write(
        &self,
        metadata: &ResourceMetadata,
        payload: &StructuredPayload,
        mode: Mode,
    ) -> Result<()> {
        let resource = payload.resource.as_str();
        let id = payload.root_id.as_str();
        self.with(|conn| {
            let tx = conn.transaction()?;

            if mode == Mode::Update {
                let changed = match payload.root_row() {
                    Some(row) => update_row(&tx, metadata, resource, row, id)?,
                    None => 0,
                };
                if changed == 0 {
                    return Err(NestqlError::NoResource {
                        collection: resource.to_string(),
                        id: id.to_string(),
                    });
                }
            }

            let replaced: Vec<&String> = payload.tables.keys().filter(|t| *t != resource).collect();
            for table in replaced.iter().rev() {
                tx.execute(
                    &format!("DELETE FROM {} WHERE {} = ?1", quote(table), quote(RESOURCE_ID)),
                    params![id],
                )?;
            }

            for (table, rows) in &payload.tables {
                if mode == Mode::Update && table == resource {
                    continue;
                }
                for row in rows {
                    insert_row(&tx, metadata, table, row)?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .map_err(|e| translate(e, resource, id, false))
    }

    /// Delete a root row; sub-table rows go with it.
    pub fn delete_root(&self, metadata: &ResourceMetadata, id: &str) -> Result<()> {
        let resource = metadata.resource.as_str();
        let changed = self
            .with(|conn| {
                Ok(conn.execute(
                    &format!("DELETE FROM {} WHERE {} = ?1", quote(resource), quote(ROW_ID)),
                    params![id],
                )?)
            })
            .map_err(|e| translate(e, resource, id, true))?;
        if changed == 0 {
            return Err(NestqlError::NoResource {
                collection: resource.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Flag a root row as deleted, stamping `columns` (e.g. the update
    /// timestamp) at the same time.
    pub fn soft_delete(&self, resource: &str, id: &str, columns: &[(&str, SqlValue)]) -> Result<()> {
        let mut assignments = vec![format!("{} = 1", quote(IS_DELETED))];
        let mut values: Vec<SqlValue> = Vec::new();
        for (column, value) in columns {
            assignments.push(format!("{} = ?", quote(column)));
            values.push(value.clone());
        }
        values.push(SqlValue::Text(id.to_string()));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ? AND {} = 0",
            quote(resource),
            assignments.join(", "),
            quote(ROW_ID),
            quote(IS_DELETED)
        );
        let changed = self.with(|conn| Ok(conn.execute(&sql, params_from_iter(values.iter()))?))?;
        if changed == 0 {
            return Err(NestqlError::NoResource {
                collection: resource.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn initialize_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash TEXT NOT NULL,
            model_yaml TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

fn column_values(metadata: &ResourceMetadata, table: &str, row: &Row) -> Result<Vec<(String, SqlValue)>> {
    let structure = metadata
        .structure(table)
        .ok_or_else(|| NestqlError::Other(format!("Unknown table '{table}'")))?;
    row.iter()
        .map(|(column, value)| {
            let ty = structure
                .fields
                .get(column)
                .map(|meta| meta.ty)
                .ok_or_else(|| NestqlError::Other(format!("Unknown column '{table}.{column}'")))?;
            Ok((column.clone(), SqlValue::from_column(ty, value)))
        })
        .collect()
}

fn insert_row(conn: &Connection, metadata: &ResourceMetadata, table: &str, row: &Row) -> Result<()> {
    let values = column_values(metadata, table, row)?;
    let columns: Vec<String> = values.iter().map(|(c, _)| quote(c)).collect();
    let placeholders = vec!["?"; values.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        quote(table),
        columns.join(", ")
    );
    conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))?;
    Ok(())
}

fn update_row(
    conn: &Connection,
    metadata: &ResourceMetadata,
    table: &str,
    row: &Row,
    id: &str,
) -> Result<usize> {
    let mut values: Vec<(String, SqlValue)> = column_values(metadata, table, row)?
        .into_iter()
        .filter(|(column, _)| column != ROW_ID)
        .collect();
    let assignments = if values.is_empty() {
        format!("{0} = {0}", quote(ROW_ID))
    } else {
        values
            .iter()
            .map(|(column, _)| format!("{} = ?", quote(column)))
            .collect::<Vec<_>>()
            .join(", ")
    };
    values.push((ROW_ID.to_string(), SqlValue::Text(id.to_string())));
    let sql = format!("UPDATE {} SET {assignments} WHERE {} = ?", quote(table), quote(ROW_ID));
    Ok(conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))?)
}

fn to_json(value: SqliteValue) -> Value {
    match value {
        SqliteValue::Null => Value::Null,
        SqliteValue::Integer(n) => Value::from(n),
        SqliteValue::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqliteValue::Text(s) => Value::String(s),
        SqliteValue::Blob(b) => Value::Array(b.into_iter().map(Value::from).collect()),
    }
}

/// Map SQLite constraint failures onto resource errors.
fn translate(err: NestqlError, collection: &str, id: &str, deleting: bool) -> NestqlError {
    let code = match &err {
        NestqlError::Sqlite(rusqlite::Error::SqliteFailure(failure, message)) => {
            Some((failure.extended_code, message.clone().unwrap_or_default()))
        }
        _ => None,
    };
    match code {
        Some((ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY, detail)) => {
            NestqlError::DuplicateResource {
                collection: collection.to_string(),
                detail,
            }
        }
        Some((ffi::SQLITE_CONSTRAINT_FOREIGNKEY, _)) if deleting => {
            NestqlError::ResourceReferenced {
                collection: collection.to_string(),
                id: id.to_string(),
            }
        }
        Some((ffi::SQLITE_CONSTRAINT_FOREIGNKEY, _)) => NestqlError::NoResource {
            collection: collection.to_string(),
            id: id.to_string(),
        },
        _ => err,
    }
}
