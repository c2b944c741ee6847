//! Demo schemas used across the integration tests.

use eventsync_core::{
    ColumnDef, CoreError, EventDef, EventFacts, FactsTracker, Schema, SqlValue, StateReader,
    Statement, TableDef,
};
use serde_json::{Value, json};

fn int_arg(args: &Value, key: &str) -> Result<i64, CoreError> {
    args.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| CoreError::InvalidArgs {
            name: key.to_string(),
            reason: "expected an integer".to_string(),
        })
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, CoreError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::InvalidArgs {
            name: key.to_string(),
            reason: "expected a string".to_string(),
        })
}

// ============================================================================
// Counter
// ============================================================================

pub const COUNTER_ID: &str = "main";
const COUNT: &str = "count";

fn current_count(state: &dyn StateReader) -> Result<i64, CoreError> {
    Ok(state
        .get("counter", &SqlValue::from(COUNTER_ID))?
        .and_then(|row| row.get("value").and_then(SqlValue::as_integer))
        .unwrap_or(0))
}

fn write_count(value: i64) -> Vec<Statement> {
    vec![Statement::upsert(
        "counter",
        vec![("id".into(), COUNTER_ID.into()), ("value".into(), value.into())],
    )]
}

fn counter_add(args: &Value, state: &dyn StateReader) -> Result<Vec<Statement>, CoreError> {
    Ok(write_count(current_count(state)? + int_arg(args, "n")?))
}

fn counter_multiply(args: &Value, state: &dyn StateReader) -> Result<Vec<Statement>, CoreError> {
    Ok(write_count(current_count(state)? * int_arg(args, "n")?))
}

fn counter_reset(_: &Value, _: &dyn StateReader) -> Result<Vec<Statement>, CoreError> {
    Ok(write_count(0))
}

fn add_facts(args: &Value, facts: &mut FactsTracker<'_>) -> Result<EventFacts, CoreError> {
    let prev = facts.get(COUNT).and_then(Value::as_i64).unwrap_or(0);
    Ok(EventFacts::new().set(COUNT, json!(prev + int_arg(args, "n")?)))
}

fn multiply_facts(args: &Value, facts: &mut FactsTracker<'_>) -> Result<EventFacts, CoreError> {
    let n = int_arg(args, "n")?;
    if n == 0 {
        return Ok(EventFacts::new().set(COUNT, json!(0)));
    }
    let prev = facts.get(COUNT).and_then(Value::as_i64).unwrap_or(0);
    Ok(EventFacts::new().set(COUNT, json!(prev * n)))
}

fn reset_facts(_: &Value, _: &mut FactsTracker<'_>) -> Result<EventFacts, CoreError> {
    Ok(EventFacts::new().set(COUNT, json!(0)))
}

/// A single counter row driven by `add`, `multiply` and `reset`.
pub fn counter_schema() -> Result<Schema, CoreError> {
    Schema::new(
        vec![TableDef::new("counter", ColumnDef::text("id")).column(ColumnDef::integer("value"))],
        &[
            EventDef::synced("add", counter_add).with_facts(add_facts),
            EventDef::synced("multiply", counter_multiply).with_facts(multiply_facts),
            EventDef::synced("reset", counter_reset).with_facts(reset_facts),
        ],
    )
}

pub fn counter_value(state: &dyn StateReader) -> Result<i64, CoreError> {
    current_count(state)
}

// ============================================================================
// Bookmarks
// ============================================================================

pub const BOOKMARK_CREATED: &str = "v1.BookmarkCreated";
pub const BOOKMARK_UPDATED: &str = "v1.BookmarkUpdated";
pub const BOOKMARK_DELETED: &str = "v1.BookmarkDeleted";
pub const UI_STATE_SET: &str = "uiStateSet";

pub fn bookmark_exists(id: &str) -> String {
    format!("bookmark-exists-{id}")
}

fn bookmark_created(args: &Value, _: &dyn StateReader) -> Result<Vec<Statement>, CoreError> {
    Ok(vec![Statement::insert(
        "bookmarks",
        vec![
            ("id".into(), str_arg(args, "id")?.into()),
            ("url".into(), str_arg(args, "url")?.into()),
            ("title".into(), str_arg(args, "title")?.into()),
        ],
    )])
}

fn bookmark_updated(args: &Value, _: &dyn StateReader) -> Result<Vec<Statement>, CoreError> {
    Ok(vec![Statement::update(
        "bookmarks",
        vec![("title".into(), str_arg(args, "title")?.into())],
        vec![("id".into(), str_arg(args, "id")?.into())],
    )])
}

fn bookmark_deleted(args: &Value, _: &dyn StateReader) -> Result<Vec<Statement>, CoreError> {
    Ok(vec![Statement::delete(
        "bookmarks",
        vec![("id".into(), str_arg(args, "id")?.into())],
    )])
}

fn ui_state_set(args: &Value, _: &dyn StateReader) -> Result<Vec<Statement>, CoreError> {
    Ok(vec![Statement::upsert(
        "ui_state",
        vec![
            ("id".into(), "default".into()),
            ("filter".into(), str_arg(args, "filter")?.into()),
        ],
    )])
}

fn created_facts(args: &Value, _: &mut FactsTracker<'_>) -> Result<EventFacts, CoreError> {
    let id = str_arg(args, "id")?;
    Ok(EventFacts::new().set(bookmark_exists(id), json!(true)))
}

fn updated_facts(args: &Value, _: &mut FactsTracker<'_>) -> Result<EventFacts, CoreError> {
    let id = str_arg(args, "id")?;
    Ok(EventFacts::new()
        .require(bookmark_exists(id), json!(true))
        .set(format!("bookmark-title-{id}"), json!(str_arg(args, "title")?)))
}

fn deleted_facts(args: &Value, _: &mut FactsTracker<'_>) -> Result<EventFacts, CoreError> {
    let id = str_arg(args, "id")?;
    Ok(EventFacts::new().unset(bookmark_exists(id)))
}

fn bookmark_tables(extra_columns: bool) -> Vec<TableDef> {
    let mut bookmarks = TableDef::new("bookmarks", ColumnDef::text("id"))
        .column(ColumnDef::text("url"))
        .column(ColumnDef::text("title").default_value(""));
    if extra_columns {
        bookmarks = bookmarks.column(ColumnDef::integer("visits").default_value(0));
    }
    vec![
        bookmarks,
        TableDef::new("ui_state", ColumnDef::text("id"))
            .column(ColumnDef::text("filter").default_value("")),
    ]
}

const BOOKMARK_EVENTS: [EventDef; 4] = [
    EventDef::synced(BOOKMARK_CREATED, bookmark_created).with_facts(created_facts),
    EventDef::synced(BOOKMARK_UPDATED, bookmark_updated).with_facts(updated_facts),
    EventDef::synced(BOOKMARK_DELETED, bookmark_deleted).with_facts(deleted_facts),
    EventDef::client_only(UI_STATE_SET, ui_state_set),
];

/// Bookmarks plus a client-only UI state row.
pub fn bookmarks_schema() -> Result<Schema, CoreError> {
    Schema::new(bookmark_tables(false), &BOOKMARK_EVENTS)
}

/// Same events, one more column on `bookmarks`.
pub fn bookmarks_schema_v2() -> Result<Schema, CoreError> {
    Schema::new(bookmark_tables(true), &BOOKMARK_EVENTS)
}

pub fn bookmark_created_args(id: &str, url: &str, title: &str) -> Value {
    json!({ "id": id, "url": url, "title": title })
}
