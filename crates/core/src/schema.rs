use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::event::MaterializerHash;
use crate::facts::{EventFacts, FactsTracker};
use crate::value::SqlValue;

/// A materialized row keyed by column name.
pub type Row = BTreeMap<String, SqlValue>;

/// Column/value pairs, used both for assignments and equality filters.
pub type Assignments = Vec<(String, SqlValue)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
}

impl ColumnType {
    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<SqlValue>,
}

impl ColumnDef {
    fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: false,
            default: None,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: &str) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn blob(name: &str) -> Self {
        Self::new(name, ColumnType::Blob)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<SqlValue>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// A state table the materializers write to. Every table has a single-column
/// primary key, which is how changesets address rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(name: &str, primary_key: ColumnDef) -> Self {
        Self {
            name: name.to_string(),
            primary_key: primary_key.name.clone(),
            columns: vec![primary_key],
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnConflict {
    Abort,
    Ignore,
    Replace,
}

/// A state mutation produced by a materializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Insert {
        table: String,
        values: Assignments,
        on_conflict: OnConflict,
    },
    Update {
        table: String,
        set: Assignments,
        filter: Assignments,
    },
    Delete {
        table: String,
        filter: Assignments,
    },
}

impl Statement {
    pub fn insert(table: &str, values: Assignments) -> Self {
        Self::Insert {
            table: table.to_string(),
            values,
            on_conflict: OnConflict::Abort,
        }
    }

    pub fn upsert(table: &str, values: Assignments) -> Self {
        Self::Insert {
            table: table.to_string(),
            values,
            on_conflict: OnConflict::Replace,
        }
    }

    pub fn update(table: &str, set: Assignments, filter: Assignments) -> Self {
        Self::Update {
            table: table.to_string(),
            set,
            filter,
        }
    }

    pub fn delete(table: &str, filter: Assignments) -> Self {
        Self::Delete {
            table: table.to_string(),
            filter,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                table
            }
        }
    }
}

/// Stable hash of a statement list, used to catch materializers whose output
/// depends on something other than their arguments and queried state.
pub fn hash_statements(statements: &[Statement]) -> Result<MaterializerHash, CoreError> {
    let bytes =
        rmp_serde::to_vec(statements).map_err(|e| CoreError::Serialization(e.to_string()))?;
    let digest = blake3::hash(&bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    Ok(u64::from_le_bytes(prefix))
}

/// Read-only view of materialized state handed to materializers.
pub trait StateReader {
    /// Rows of `table` matching every `(column, value)` pair in `filter`.
    fn select(&self, table: &str, filter: &[(String, SqlValue)]) -> Result<Vec<Row>, CoreError>;

    fn get(&self, table: &str, primary_key: &SqlValue) -> Result<Option<Row>, CoreError>;
}

pub type MaterializerFn =
    fn(&serde_json::Value, &dyn StateReader) -> Result<Vec<Statement>, CoreError>;

pub type FactsFn = fn(&serde_json::Value, &mut FactsTracker<'_>) -> Result<EventFacts, CoreError>;

#[derive(Clone, Copy)]
pub struct EventDef {
    pub name: &'static str,
    /// Client-only events stay in the local log and are never pushed.
    pub client_only: bool,
    pub materializer: MaterializerFn,
    pub facts: Option<FactsFn>,
}

impl EventDef {
    pub const fn synced(name: &'static str, materializer: MaterializerFn) -> Self {
        Self {
            name,
            client_only: false,
            materializer,
            facts: None,
        }
    }

    pub const fn client_only(name: &'static str, materializer: MaterializerFn) -> Self {
        Self {
            name,
            client_only: true,
            materializer,
            facts: None,
        }
    }

    pub const fn with_facts(mut self, facts: FactsFn) -> Self {
        self.facts = Some(facts);
        self
    }
}

impl fmt::Debug for EventDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDef")
            .field("name", &self.name)
            .field("client_only", &self.client_only)
            .field("has_facts", &self.facts.is_some())
            .finish()
    }
}

/// The closed set of tables and event kinds known to this store.
#[derive(Debug, Clone)]
pub struct Schema {
    tables: Vec<TableDef>,
    /// Sorted by name for lookup.
    events: Vec<EventDef>,
    hash: u64,
}

impl Schema {
    pub fn new(tables: Vec<TableDef>, events: &[EventDef]) -> Result<Self, CoreError> {
        let mut table_names = BTreeSet::new();
        for table in &tables {
            if !table_names.insert(table.name.as_str()) {
                return Err(CoreError::DuplicateDefinition(format!("table {}", table.name)));
            }
            let mut columns = BTreeSet::new();
            for column in &table.columns {
                if !columns.insert(column.name.as_str()) {
                    return Err(CoreError::DuplicateDefinition(format!(
                        "column {}.{}",
                        table.name, column.name
                    )));
                }
            }
        }

        let mut sorted: Vec<EventDef> = events.to_vec();
        sorted.sort_by(|a, b| a.name.cmp(b.name));
        for pair in sorted.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(CoreError::DuplicateDefinition(format!("event {}", pair[0].name)));
            }
        }

        let hash = schema_hash(&tables, &sorted)?;
        Ok(Self {
            tables,
            events: sorted,
            hash,
        })
    }

    pub fn event(&self, name: &str) -> Result<&EventDef, CoreError> {
        self.events
            .binary_search_by(|def| def.name.cmp(name))
            .map(|i| &self.events[i])
            .map_err(|_| CoreError::UnknownEvent(name.to_string()))
    }

    pub fn events(&self) -> &[EventDef] {
        &self.events
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    /// Changes whenever a table layout or the set of event kinds changes.
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

fn schema_hash(tables: &[TableDef], events: &[EventDef]) -> Result<u64, CoreError> {
    let mut hasher = blake3::Hasher::new();
    let table_bytes =
        rmp_serde::to_vec(tables).map_err(|e| CoreError::Serialization(e.to_string()))?;
    hasher.update(&table_bytes);
    for def in events {
        hasher.update(def.name.as_bytes());
        hasher.update(&[u8::from(def.client_only)]);
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    // Stored in an INTEGER column, keep it positive.
    Ok(u64::from_le_bytes(prefix) >> 1)
}
