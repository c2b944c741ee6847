use rusqlite::{Connection, OptionalExtension};

use eventsync_core::schema::{ColumnDef, Schema, TableDef};

use crate::error::StorageError;
use crate::sqlite::to_sql_value;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS eventlog (
    seq_num_global INTEGER NOT NULL,
    seq_num_client INTEGER NOT NULL,
    parent_seq_num_global INTEGER NOT NULL,
    parent_seq_num_client INTEGER NOT NULL,
    name TEXT NOT NULL,
    args_json TEXT NOT NULL,
    client_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    schema_hash INTEGER NOT NULL,
    sync_metadata_json TEXT,
    PRIMARY KEY (seq_num_global, seq_num_client)
);

CREATE TABLE IF NOT EXISTS sync_status (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    head INTEGER NOT NULL
);
INSERT OR IGNORE INTO sync_status (id, head) VALUES (0, 0);

CREATE TABLE IF NOT EXISTS session_changeset_meta (
    seq_num_global INTEGER NOT NULL,
    seq_num_client INTEGER NOT NULL,
    changeset BLOB,
    debug TEXT,
    materializer_hash INTEGER,
    PRIMARY KEY (seq_num_global, seq_num_client)
);

CREATE TABLE IF NOT EXISTS schema_meta (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    schema_hash INTEGER NOT NULL,
    tables_json TEXT NOT NULL
);
";

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_ddl(column: &ColumnDef, primary_key: bool) -> Result<String, StorageError> {
    let mut ddl = format!("{} {}", quote_ident(&column.name), column.column_type.sql_name());
    if primary_key {
        ddl.push_str(" PRIMARY KEY");
    }
    if !column.nullable {
        ddl.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        let literal = match to_sql_value(default) {
            rusqlite::types::Value::Null => "NULL".to_string(),
            rusqlite::types::Value::Integer(i) => i.to_string(),
            rusqlite::types::Value::Real(r) => r.to_string(),
            rusqlite::types::Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            rusqlite::types::Value::Blob(_) => {
                return Err(StorageError::InvalidStatement(format!(
                    "blob default on column {}",
                    column.name
                )));
            }
        };
        ddl.push_str(" DEFAULT ");
        ddl.push_str(&literal);
    }
    Ok(ddl)
}

pub fn table_ddl(table: &TableDef) -> Result<String, StorageError> {
    let columns = table
        .columns
        .iter()
        .map(|c| column_ddl(c, c.name == table.primary_key))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&table.name),
        columns.join(", ")
    ))
}

pub fn stored_schema_hash(conn: &Connection) -> Result<Option<u64>, StorageError> {
    let hash: Option<i64> = conn
        .query_row("SELECT schema_hash FROM schema_meta WHERE id = 0", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(hash.map(|h| h as u64))
}

fn stored_table_names(conn: &Connection) -> Result<Vec<String>, StorageError> {
    let json: Option<String> = conn
        .query_row("SELECT tables_json FROM schema_meta WHERE id = 0", [], |row| {
            row.get(0)
        })
        .optional()?;
    match json {
        Some(json) => {
            serde_json::from_str(&json).map_err(|e| StorageError::Serialization(e.to_string()))
        }
        None => Ok(Vec::new()),
    }
}

fn write_schema_meta(conn: &Connection, schema: &Schema) -> Result<(), StorageError> {
    let names: Vec<&str> = schema.tables().iter().map(|t| t.name.as_str()).collect();
    let tables_json =
        serde_json::to_string(&names).map_err(|e| StorageError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO schema_meta (id, schema_hash, tables_json) VALUES (0, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET schema_hash = excluded.schema_hash, tables_json = excluded.tables_json",
        rusqlite::params![schema.hash() as i64, tables_json],
    )?;
    Ok(())
}

/// Creates the state tables of `schema`. On a fresh database also records
/// the schema hash; an existing, different hash is left for migration.
pub fn init_state_tables(conn: &Connection, schema: &Schema) -> Result<(), StorageError> {
    for table in schema.tables() {
        conn.execute_batch(&table_ddl(table)?)?;
    }
    if stored_schema_hash(conn)?.is_none() {
        write_schema_meta(conn, schema)?;
    }
    Ok(())
}

/// Drops every state table (old and new layout) and recreates the tables of
/// `schema` empty.
pub fn recreate_state_tables(conn: &Connection, schema: &Schema) -> Result<(), StorageError> {
    let mut names = stored_table_names(conn)?;
    names.extend(schema.tables().iter().map(|t| t.name.clone()));
    names.sort();
    names.dedup();
    for name in &names {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
    }
    for table in schema.tables() {
        conn.execute_batch(&table_ddl(table)?)?;
    }
    write_schema_meta(conn, schema)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_quotes_and_defaults() {
        let table = TableDef::new("uiState", ColumnDef::text("id"))
            .column(ColumnDef::text("filter").default_value("it's"))
            .column(ColumnDef::integer("count").default_value(0))
            .column(ColumnDef::real("ratio").nullable());
        let ddl = table_ddl(&table).unwrap();
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS \"uiState\" (\"id\" TEXT PRIMARY KEY NOT NULL, \
             \"filter\" TEXT NOT NULL DEFAULT 'it''s', \"count\" INTEGER NOT NULL DEFAULT 0, \
             \"ratio\" REAL)"
        );
    }

    #[test]
    fn blob_default_rejected() {
        let table = TableDef::new("t", ColumnDef::text("id"))
            .column(ColumnDef::blob("data").default_value(vec![1u8, 2]));
        assert!(matches!(
            table_ddl(&table),
            Err(StorageError::InvalidStatement(_))
        ));
    }

    #[test]
    fn schema_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        let head: i64 = conn
            .query_row("SELECT head FROM sync_status", [], |row| row.get(0))
            .unwrap();
        assert_eq!(head, 0);
        assert_eq!(stored_schema_hash(&conn).unwrap(), None);
    }

    #[test]
    fn only_engine_tables_are_created() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            tables,
            vec!["eventlog", "schema_meta", "session_changeset_meta", "sync_status"]
        );
    }
}
