use std::path::Path;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use eventsync_core::{
    ClientId, CoreError, Event, EventMeta, MaterializerHash, OnConflict, Row, Schema,
    SequenceNumber, SessionChangeset, SessionId, SqlValue, StateReader, Statement, TableDef,
};

use crate::changeset::Changeset;
use crate::error::StorageError;
use crate::schema::quote_ident;
use crate::traits::Storage;

pub(crate) fn to_sql_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(r) => Value::Real(*r),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn from_sql_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

fn seq_params(seq_num: SequenceNumber) -> [i64; 2] {
    [seq_num.global() as i64, seq_num.client() as i64]
}

/// Serialized state tables, ordered by table then primary key.
#[derive(Debug, Serialize, Deserialize)]
struct StateDump {
    schema_hash: u64,
    tables: Vec<TableDump>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableDump {
    name: String,
    rows: Vec<Row>,
}

pub struct SqliteStore {
    conn: Connection,
    schema: Schema,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, schema: &Schema) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::init(conn, schema)
    }

    pub fn open_in_memory(schema: &Schema) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, schema)
    }

    fn init(conn: Connection, schema: &Schema) -> Result<Self, StorageError> {
        crate::schema::init_schema(&conn)?;
        crate::schema::init_state_tables(&conn, schema)?;
        Ok(Self {
            conn,
            schema: schema.clone(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn stored_schema_hash(&self) -> Result<Option<u64>, StorageError> {
        crate::schema::stored_schema_hash(&self.conn)
    }

    /// False when the state tables were created by a different schema.
    pub fn schema_matches(&self) -> Result<bool, StorageError> {
        Ok(self.stored_schema_hash()? == Some(self.schema.hash()))
    }

    /// Drops and recreates the state tables. The event log is untouched.
    pub fn recreate_state(&mut self) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        crate::schema::recreate_state_tables(&sp, &self.schema)?;
        sp.commit()?;
        info!(schema_hash = self.schema.hash(), "recreated state tables");
        Ok(())
    }

    /// All rows of a state table, by primary key.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        select_rows(&self.conn, self.table_def(table)?, &[])
    }

    fn table_def(&self, name: &str) -> Result<&TableDef, StorageError> {
        self.schema
            .table(name)
            .ok_or_else(|| StorageError::InvalidStatement(format!("unknown table {name}")))
    }
}

const EVENT_COLUMNS: &str = "e.seq_num_global, e.seq_num_client, e.parent_seq_num_global, \
     e.parent_seq_num_client, e.name, e.args_json, e.client_id, e.session_id, \
     e.sync_metadata_json, c.seq_num_global IS NOT NULL, c.changeset, c.materializer_hash";

const EVENT_JOIN: &str = "FROM eventlog e LEFT JOIN session_changeset_meta c \
     ON c.seq_num_global = e.seq_num_global AND c.seq_num_client = e.seq_num_client";

fn read_event(row: &rusqlite::Row) -> Result<Event, StorageError> {
    let global: i64 = row.get(0)?;
    let client: i64 = row.get(1)?;
    let parent_global: i64 = row.get(2)?;
    let parent_client: i64 = row.get(3)?;
    let name: String = row.get(4)?;
    let args_json: String = row.get(5)?;
    let client_id: String = row.get(6)?;
    let session_id: String = row.get(7)?;
    let sync_metadata_json: Option<String> = row.get(8)?;
    let has_changeset: bool = row.get(9)?;
    let changeset: Option<Vec<u8>> = row.get(10)?;
    let materializer_hash: Option<i64> = row.get(11)?;

    let args = serde_json::from_str(&args_json)
        .map_err(|e| StorageError::Serialization(format!("args of {name}: {e}")))?;
    let sync_metadata = sync_metadata_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| StorageError::Serialization(format!("sync metadata of {name}: {e}")))?;
    let session_changeset = match (has_changeset, changeset) {
        (false, _) => SessionChangeset::Unset,
        (true, None) => SessionChangeset::NoOp,
        (true, Some(bytes)) => SessionChangeset::Changeset(bytes),
    };

    Ok(Event {
        name,
        args,
        seq_num: SequenceNumber::new(global as u64, client as u64),
        parent_seq_num: SequenceNumber::new(parent_global as u64, parent_client as u64),
        client_id: ClientId::parse(&client_id)?,
        session_id: SessionId::parse(&session_id)?,
        meta: EventMeta {
            session_changeset,
            sync_metadata,
            materializer_hash: materializer_hash.map(|h| h as MaterializerHash),
        },
    })
}

fn tunnel(e: StorageError) -> rusqlite::Error {
    match e {
        StorageError::Sqlite(sq) => sq,
        other => rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(OpaqueStorageError(other.to_string())),
        ),
    }
}

// ============================================================================
// State tables
// ============================================================================

fn check_columns<'a>(
    table: &TableDef,
    columns: impl IntoIterator<Item = &'a String>,
) -> Result<(), StorageError> {
    for column in columns {
        if table.get_column(column).is_none() {
            return Err(StorageError::InvalidStatement(format!(
                "unknown column {}.{column}",
                table.name
            )));
        }
    }
    Ok(())
}

fn where_clause(
    table: &TableDef,
    filter: &[(String, SqlValue)],
) -> Result<(String, Vec<Value>), StorageError> {
    check_columns(table, filter.iter().map(|(c, _)| c))?;
    if filter.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let clause = filter
        .iter()
        .map(|(c, _)| format!("{} IS ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let params = filter.iter().map(|(_, v)| to_sql_value(v)).collect();
    Ok((format!(" WHERE {clause}"), params))
}

fn select_rows(
    conn: &Connection,
    table: &TableDef,
    filter: &[(String, SqlValue)],
) -> Result<Vec<Row>, StorageError> {
    let (clause, params) = where_clause(table, filter)?;
    let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(&c.name)).collect();
    let sql = format!(
        "SELECT {} FROM {}{clause} ORDER BY {}",
        columns.join(", "),
        quote_ident(&table.name),
        quote_ident(&table.primary_key)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            let mut out = Row::new();
            for (i, column) in table.columns.iter().enumerate() {
                out.insert(column.name.clone(), from_sql_ref(row.get_ref(i)?));
            }
            Ok(out)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn get_row(
    conn: &Connection,
    table: &TableDef,
    primary_key: &SqlValue,
) -> Result<Option<Row>, StorageError> {
    let filter = [(table.primary_key.clone(), primary_key.clone())];
    Ok(select_rows(conn, table, &filter)?.into_iter().next())
}

fn row_primary_key(table: &TableDef, row: &Row) -> Result<SqlValue, StorageError> {
    row.get(&table.primary_key).cloned().ok_or_else(|| {
        StorageError::InvalidStatement(format!("row of {} without primary key", table.name))
    })
}

fn insert_row(
    conn: &Connection,
    table: &TableDef,
    verb: &str,
    values: &[(String, SqlValue)],
) -> Result<(), StorageError> {
    check_columns(table, values.iter().map(|(c, _)| c))?;
    let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(c)).collect();
    let placeholders = vec!["?"; values.len()].join(", ");
    let sql = format!(
        "{verb} INTO {} ({}) VALUES ({placeholders})",
        quote_ident(&table.name),
        columns.join(", ")
    );
    let params: Vec<Value> = values.iter().map(|(_, v)| to_sql_value(v)).collect();
    conn.execute(&sql, params_from_iter(params.iter()))?;
    Ok(())
}

fn execute_statement(
    conn: &Connection,
    table: &TableDef,
    statement: &Statement,
    changeset: &mut Changeset,
) -> Result<(), StorageError> {
    match statement {
        Statement::Insert {
            values,
            on_conflict,
            ..
        } => {
            let primary_key = values
                .iter()
                .find(|(c, _)| *c == table.primary_key)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| {
                    StorageError::InvalidStatement(format!(
                        "insert into {} without primary key",
                        table.name
                    ))
                })?;
            let verb = match on_conflict {
                OnConflict::Abort => "INSERT",
                OnConflict::Ignore => "INSERT OR IGNORE",
                OnConflict::Replace => "INSERT OR REPLACE",
            };
            let before = get_row(conn, table, &primary_key)?;
            insert_row(conn, table, verb, values)?;
            let after = get_row(conn, table, &primary_key)?;
            changeset.record(&table.name, primary_key, before, after);
        }

        Statement::Update { set, filter, .. } => {
            if set.iter().any(|(c, _)| *c == table.primary_key) {
                return Err(StorageError::InvalidStatement(format!(
                    "update of primary key {}.{}",
                    table.name, table.primary_key
                )));
            }
            check_columns(table, set.iter().map(|(c, _)| c))?;
            if set.is_empty() {
                return Ok(());
            }

            let before_rows = select_rows(conn, table, filter)?;
            let (clause, filter_params) = where_clause(table, filter)?;
            let assignments = set
                .iter()
                .map(|(c, _)| format!("{} = ?", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let mut params: Vec<Value> = set.iter().map(|(_, v)| to_sql_value(v)).collect();
            params.extend(filter_params);
            conn.execute(
                &format!("UPDATE {} SET {assignments}{clause}", quote_ident(&table.name)),
                params_from_iter(params.iter()),
            )?;

            for before in before_rows {
                let primary_key = row_primary_key(table, &before)?;
                let after = get_row(conn, table, &primary_key)?;
                changeset.record(&table.name, primary_key, Some(before), after);
            }
        }

        Statement::Delete { filter, .. } => {
            let before_rows = select_rows(conn, table, filter)?;
            let (clause, params) = where_clause(table, filter)?;
            conn.execute(
                &format!("DELETE FROM {}{clause}", quote_ident(&table.name)),
                params_from_iter(params.iter()),
            )?;
            for before in before_rows {
                let primary_key = row_primary_key(table, &before)?;
                changeset.record(&table.name, primary_key, Some(before), None);
            }
        }
    }
    Ok(())
}

impl StateReader for SqliteStore {
    fn select(&self, table: &str, filter: &[(String, SqlValue)]) -> Result<Vec<Row>, CoreError> {
        let def = self
            .schema
            .table(table)
            .ok_or_else(|| CoreError::StateQuery(format!("unknown table {table}")))?;
        select_rows(&self.conn, def, filter).map_err(|e| CoreError::StateQuery(e.to_string()))
    }

    fn get(&self, table: &str, primary_key: &SqlValue) -> Result<Option<Row>, CoreError> {
        let def = self
            .schema
            .table(table)
            .ok_or_else(|| CoreError::StateQuery(format!("unknown table {table}")))?;
        get_row(&self.conn, def, primary_key).map_err(|e| CoreError::StateQuery(e.to_string()))
    }
}

impl Storage for SqliteStore {
    fn append_event(&mut self, event: &Event, check_parent: bool) -> Result<(), StorageError> {
        if check_parent && !event.parent_seq_num.is_root() {
            let [g, c] = seq_params(event.parent_seq_num);
            let exists: bool = self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM eventlog WHERE seq_num_global = ?1 AND seq_num_client = ?2)",
                rusqlite::params![g, c],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StorageError::SchemaMismatch(format!(
                    "parent {} of event {} is not in the eventlog",
                    event.parent_seq_num, event.seq_num
                )));
            }
        }

        let sync_metadata_json = event
            .meta
            .sync_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let [g, c] = seq_params(event.seq_num);
        let [pg, pc] = seq_params(event.parent_seq_num);
        self.conn.execute(
            "INSERT INTO eventlog (seq_num_global, seq_num_client, parent_seq_num_global, parent_seq_num_client, name, args_json, client_id, session_id, schema_hash, sync_metadata_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                g,
                c,
                pg,
                pc,
                event.name,
                event.args_json()?,
                event.client_id.to_string(),
                event.session_id.to_string(),
                self.schema.hash() as i64,
                sync_metadata_json,
            ],
        )?;
        Ok(())
    }

    fn events_since(&self, cursor: SequenceNumber) -> Result<Vec<Event>, StorageError> {
        let [g, c] = seq_params(cursor);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} {EVENT_JOIN}
             WHERE (e.seq_num_global, e.seq_num_client) > (?1, ?2)
             ORDER BY e.seq_num_global, e.seq_num_client"
        ))?;
        let events = stmt
            .query_map(rusqlite::params![g, c], |row| read_event(row).map_err(tunnel))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn get_event(&self, seq_num: SequenceNumber) -> Result<Option<Event>, StorageError> {
        let [g, c] = seq_params(seq_num);
        let event = self
            .conn
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} {EVENT_JOIN}
                     WHERE e.seq_num_global = ?1 AND e.seq_num_client = ?2"
                ),
                rusqlite::params![g, c],
                |row| read_event(row).map_err(tunnel),
            )
            .optional()?;
        Ok(event)
    }

    fn local_head(&self) -> Result<SequenceNumber, StorageError> {
        let head: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT seq_num_global, seq_num_client FROM eventlog
                 ORDER BY seq_num_global DESC, seq_num_client DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(head
            .map(|(g, c)| SequenceNumber::new(g as u64, c as u64))
            .unwrap_or(SequenceNumber::ROOT))
    }

    fn head(&self) -> Result<SequenceNumber, StorageError> {
        let head: i64 =
            self.conn
                .query_row("SELECT head FROM sync_status WHERE id = 0", [], |row| row.get(0))?;
        Ok(SequenceNumber::global_only(head as u64))
    }

    fn update_head(&mut self, head: SequenceNumber) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE sync_status SET head = ?1 WHERE id = 0",
            rusqlite::params![head.global() as i64],
        )?;
        Ok(())
    }

    fn event_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM eventlog", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn delete_events_after(&mut self, seq_num: SequenceNumber) -> Result<usize, StorageError> {
        let [g, c] = seq_params(seq_num);
        let sp = self.conn.savepoint()?;
        sp.execute(
            "DELETE FROM session_changeset_meta WHERE (seq_num_global, seq_num_client) > (?1, ?2)",
            rusqlite::params![g, c],
        )?;
        let deleted = sp.execute(
            "DELETE FROM eventlog WHERE (seq_num_global, seq_num_client) > (?1, ?2)",
            rusqlite::params![g, c],
        )?;
        sp.commit()?;
        debug!(after = %seq_num, deleted, "deleted events");
        Ok(deleted)
    }

    fn set_sync_metadata(
        &mut self,
        seq_num: SequenceNumber,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), StorageError> {
        let json = metadata
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let [g, c] = seq_params(seq_num);
        let updated = self.conn.execute(
            "UPDATE eventlog SET sync_metadata_json = ?1 WHERE seq_num_global = ?2 AND seq_num_client = ?3",
            rusqlite::params![json, g, c],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("event {seq_num}")));
        }
        Ok(())
    }

    fn record_changeset(
        &mut self,
        seq_num: SequenceNumber,
        changeset: &SessionChangeset,
        materializer_hash: Option<MaterializerHash>,
        debug: Option<&str>,
    ) -> Result<(), StorageError> {
        let [g, c] = seq_params(seq_num);
        let blob = match changeset {
            SessionChangeset::Unset => {
                self.conn.execute(
                    "DELETE FROM session_changeset_meta WHERE seq_num_global = ?1 AND seq_num_client = ?2",
                    rusqlite::params![g, c],
                )?;
                return Ok(());
            }
            SessionChangeset::NoOp => None,
            SessionChangeset::Changeset(bytes) => Some(bytes.as_slice()),
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO session_changeset_meta (seq_num_global, seq_num_client, changeset, debug, materializer_hash) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![g, c, blob, debug, materializer_hash.map(|h| h as i64)],
        )?;
        Ok(())
    }

    fn delete_changesets_up_to(&mut self, seq_num: SequenceNumber) -> Result<usize, StorageError> {
        let [g, c] = seq_params(seq_num);
        let deleted = self.conn.execute(
            "DELETE FROM session_changeset_meta WHERE (seq_num_global, seq_num_client) <= (?1, ?2)",
            rusqlite::params![g, c],
        )?;
        Ok(deleted)
    }

    fn execute_tracked(&mut self, statements: &[Statement]) -> Result<Changeset, StorageError> {
        let mut changeset = Changeset::new();
        let sp = self.conn.savepoint()?;
        for statement in statements {
            let table = self.schema.table(statement.table()).ok_or_else(|| {
                StorageError::InvalidStatement(format!("unknown table {}", statement.table()))
            })?;
            execute_statement(&sp, table, statement, &mut changeset)?;
        }
        sp.commit()?;
        changeset.prune();
        debug!(
            statements = statements.len(),
            changed_rows = changeset.len(),
            "executed statements"
        );
        Ok(changeset)
    }

    fn apply_changeset(&mut self, changeset: &Changeset) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        for entry in changeset.entries() {
            let table = self.schema.table(&entry.table).ok_or_else(|| {
                StorageError::InvalidStatement(format!("unknown table {}", entry.table))
            })?;
            match &entry.after {
                Some(row) => {
                    let values: Vec<(String, SqlValue)> =
                        row.iter().map(|(c, v)| (c.clone(), v.clone())).collect();
                    insert_row(&sp, table, "INSERT OR REPLACE", &values)?;
                }
                None => {
                    sp.execute(
                        &format!(
                            "DELETE FROM {} WHERE {} IS ?1",
                            quote_ident(&table.name),
                            quote_ident(&table.primary_key)
                        ),
                        [to_sql_value(&entry.primary_key)],
                    )?;
                }
            }
        }
        sp.commit()?;
        Ok(())
    }

    fn export_state(&self) -> Result<Vec<u8>, StorageError> {
        let mut tables = Vec::with_capacity(self.schema.tables().len());
        for table in self.schema.tables() {
            tables.push(TableDump {
                name: table.name.clone(),
                rows: select_rows(&self.conn, table, &[])?,
            });
        }
        let dump = StateDump {
            schema_hash: self.schema.hash(),
            tables,
        };
        rmp_serde::to_vec_named(&dump).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn import_state(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let dump: StateDump =
            rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if dump.schema_hash != self.schema.hash() {
            return Err(StorageError::SchemaMismatch(format!(
                "state dump for schema {} does not match {}",
                dump.schema_hash,
                self.schema.hash()
            )));
        }

        let sp = self.conn.savepoint()?;
        for table in self.schema.tables() {
            sp.execute_batch(&format!("DELETE FROM {}", quote_ident(&table.name)))?;
        }
        for table_dump in &dump.tables {
            let table = self.schema.table(&table_dump.name).ok_or_else(|| {
                StorageError::SchemaMismatch(format!("unknown table {}", table_dump.name))
            })?;
            for row in &table_dump.rows {
                let values: Vec<(String, SqlValue)> =
                    row.iter().map(|(c, v)| (c.clone(), v.clone())).collect();
                insert_row(&sp, table, "INSERT", &values)?;
            }
        }
        sp.commit()?;
        Ok(())
    }
}

/// Wrapper error type used to tunnel StorageError through rusqlite's error system
/// in query_map closures that must return rusqlite::Error.
#[derive(Debug)]
struct OpaqueStorageError(String);

impl std::fmt::Display for OpaqueStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpaqueStorageError {}
