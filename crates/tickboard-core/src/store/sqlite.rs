//! `SQLite`-backed [`DocumentStore`].
//!
//! Documents live in a single `documents(collection, id, body)` table with
//! the fields stored as JSON text. Filters and sorts are compiled to JSON1
//! expressions (`json_type` / `json_extract` / `json_each`) with bound
//! parameters, so the store answers queries with the same type-strict
//! semantics as [`MemoryStore`](super::MemoryStore):
//!
//! - a comparison only matches values of the same JSON type,
//! - sorting ranks types before values and breaks ties on id ascending,
//! - documents missing the sort field are left out of sorted results.
//!
//! Runtime defaults follow the projection database: WAL journal and a
//! 5 second busy timeout.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::query::{self, Direction, Filter, FilterOp, Query};
use super::registry::Registry;
use super::{
    Collection, Document, DocumentSink, DocumentStore, Fields, SnapshotSink, StoreError,
    Subscription, new_document_id,
};

/// Busy timeout used for document store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (collection, id)
) WITHOUT ROWID";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    registry: Registry,
}

impl SqliteStore {
    /// Open (or create) a document database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create document db directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open document database {}", path.display()))?;
        let _journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("enable WAL journal")?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory document database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .context("set busy timeout")?;
        conn.execute_batch(SCHEMA).context("create documents table")?;
        Ok(Self {
            conn: Mutex::new(conn),
            registry: Registry::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(
        &self,
        collection: Collection,
        apply: impl FnOnce(&Connection) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let staged = {
            let conn = self.lock();
            apply(&conn)?;
            self.registry.publish(collection, &snapshot(&conn, collection)?)
        };
        debug!(%collection, "sqlite write committed");
        staged.deliver();
        Ok(())
    }
}

fn unavailable(err: &rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn parse_body(id: &str, body: &str) -> Result<Fields, StoreError> {
    serde_json::from_str(body)
        .map_err(|err| StoreError::Unavailable(format!("corrupt document {id}: {err}")))
}

fn render_body(fields: &Fields) -> Result<String, StoreError> {
    serde_json::to_string(fields).map_err(|err| StoreError::Denied(err.to_string()))
}

fn snapshot(conn: &Connection, collection: Collection) -> Result<Vec<Document>, StoreError> {
    select(
        conn,
        "SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id ASC",
        &[SqlValue::Text(collection.as_str().to_string())],
    )
}

fn select(conn: &Connection, sql: &str, values: &[SqlValue]) -> Result<Vec<Document>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(|err| unavailable(&err))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|err| unavailable(&err))?;
    let mut docs = Vec::new();
    for row in rows {
        let (id, body) = row.map_err(|err| unavailable(&err))?;
        let fields = parse_body(&id, &body)?;
        docs.push(Document::new(id, fields));
    }
    Ok(docs)
}

fn load(conn: &Connection, collection: Collection, id: &str) -> Result<Option<Fields>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| unavailable(&err))?;
    body.map(|body| parse_body(id, &body)).transpose()
}

fn store_body(
    conn: &Connection,
    collection: Collection,
    id: &str,
    fields: &Fields,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)
         ON CONFLICT(collection, id) DO UPDATE SET body = excluded.body",
        params![collection.as_str(), id, render_body(fields)?],
    )
    .map_err(|err| unavailable(&err))?;
    Ok(())
}

/// `$."a"."b"` for the dotted path `a.b`.
fn json_path(field: &str) -> String {
    let mut path = String::from("$");
    for segment in field.split('.') {
        let _ = write!(path, ".\"{segment}\"");
    }
    path
}

/// Bound parameters plus the SQL fragments that reference them.
struct SqlBuilder {
    values: Vec<SqlValue>,
}

impl SqlBuilder {
    fn new(collection: Collection) -> Self {
        Self {
            values: vec![SqlValue::Text(collection.as_str().to_string())],
        }
    }

    fn bind(&mut self, value: SqlValue) -> String {
        self.values.push(value);
        format!("?{}", self.values.len())
    }

    fn bind_json(&mut self, value: &Value) -> String {
        let bound = match value {
            Value::Null => SqlValue::Null,
            Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
            Value::Number(number) => number.as_i64().map_or_else(
                || SqlValue::Real(number.as_f64().unwrap_or_default()),
                SqlValue::Integer,
            ),
            Value::String(text) => SqlValue::Text(text.clone()),
            Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
        };
        let placeholder = self.bind(bound);
        if matches!(value, Value::Array(_) | Value::Object(_)) {
            format!("json({placeholder})")
        } else {
            placeholder
        }
    }

    /// Type-strict equality of `(type_expr, value_expr)` with `value`.
    fn equals(&mut self, type_expr: &str, value_expr: &str, value: &Value) -> String {
        match value {
            Value::Null => format!("{type_expr} = 'null'"),
            Value::Bool(true) => format!("{type_expr} = 'true'"),
            Value::Bool(false) => format!("{type_expr} = 'false'"),
            Value::Number(_) => {
                let bound = self.bind_json(value);
                format!("({type_expr} IN ('integer', 'real') AND {value_expr} = {bound})")
            }
            Value::String(_) => {
                let bound = self.bind_json(value);
                format!("({type_expr} = 'text' AND {value_expr} = {bound})")
            }
            Value::Array(_) => {
                let bound = self.bind_json(value);
                format!("({type_expr} = 'array' AND {value_expr} = {bound})")
            }
            Value::Object(_) => {
                let bound = self.bind_json(value);
                format!("({type_expr} = 'object' AND {value_expr} = {bound})")
            }
        }
    }

    fn equals_any(&mut self, type_expr: &str, value_expr: &str, values: &[Value]) -> String {
        let alternatives: Vec<String> = values
            .iter()
            .map(|value| self.equals(type_expr, value_expr, value))
            .collect();
        format!("({})", alternatives.join(" OR "))
    }

    fn range(&mut self, type_expr: &str, value_expr: &str, op: &str, value: &Value) -> String {
        let types = match value {
            Value::Bool(_) => "('true', 'false')",
            Value::Number(_) => "('integer', 'real')",
            _ => "('text')",
        };
        let bound = self.bind_json(value);
        format!("({type_expr} IN {types} AND {value_expr} {op} {bound})")
    }

    fn condition(&mut self, filter: &Filter) -> String {
        let path = self.bind(SqlValue::Text(json_path(&filter.field)));
        let type_expr = format!("json_type(body, {path})");
        let value_expr = format!("json_extract(body, {path})");
        let Some(value) = filter.value.as_ref() else {
            return "0".to_string();
        };
        let items = value.as_array().map_or(&[][..], Vec::as_slice);
        let present = format!("{type_expr} IS NOT NULL AND {type_expr} != 'null'");
        match filter.op {
            FilterOp::Eq => self.equals(&type_expr, &value_expr, value),
            FilterOp::NotEq => {
                let eq = self.equals(&type_expr, &value_expr, value);
                format!("({present} AND NOT {eq})")
            }
            FilterOp::Lt => self.range(&type_expr, &value_expr, "<", value),
            FilterOp::Lte => self.range(&type_expr, &value_expr, "<=", value),
            FilterOp::Gt => self.range(&type_expr, &value_expr, ">", value),
            FilterOp::Gte => self.range(&type_expr, &value_expr, ">=", value),
            FilterOp::In => self.equals_any(&type_expr, &value_expr, items),
            FilterOp::NotIn => {
                let any = self.equals_any(&type_expr, &value_expr, items);
                format!("({present} AND NOT {any})")
            }
            FilterOp::ArrayContains => {
                let eq = self.equals("je.type", "je.value", value);
                format!(
                    "({type_expr} = 'array' AND EXISTS (SELECT 1 FROM json_each(body, {path}) je WHERE {eq}))"
                )
            }
            FilterOp::ArrayContainsAny => {
                let any = self.equals_any("je.type", "je.value", items);
                format!(
                    "({type_expr} = 'array' AND EXISTS (SELECT 1 FROM json_each(body, {path}) je WHERE {any}))"
                )
            }
        }
    }

    fn where_clause(&mut self, filters: &[Filter]) -> String {
        let mut conditions = vec!["collection = ?1".to_string()];
        for filter in filters {
            conditions.push(self.condition(filter));
        }
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

fn compile_query(query: &Query) -> (String, Vec<SqlValue>) {
    let mut builder = SqlBuilder::new(query.collection);
    let mut where_clause = builder.where_clause(&query.filters);

    let sort_clause = query.order_by.as_ref().map_or_else(
        || " ORDER BY id ASC".to_string(),
        |order| {
            let path = builder.bind(SqlValue::Text(json_path(&order.field)));
            let _ = write!(where_clause, " AND json_type(body, {path}) IS NOT NULL");
            let dir = match order.direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            format!(
                " ORDER BY CASE json_type(body, {path}) \
                 WHEN 'null' THEN 0 \
                 WHEN 'true' THEN 1 WHEN 'false' THEN 1 \
                 WHEN 'integer' THEN 2 WHEN 'real' THEN 2 \
                 WHEN 'text' THEN 3 \
                 WHEN 'array' THEN 4 \
                 ELSE 5 END {dir}, json_extract(body, {path}) {dir}, id ASC"
            )
        },
    );

    let limit_clause = query
        .limit
        .map_or_else(String::new, |limit| format!(" LIMIT {limit}"));

    let sql = format!("SELECT id, body FROM documents{where_clause}{sort_clause}{limit_clause}");
    (sql, builder.values)
}

impl DocumentStore for SqliteStore {
    fn subscribe(
        &self,
        collection: Collection,
        sink: SnapshotSink,
    ) -> Result<Subscription, StoreError> {
        let (subscription, initial) = {
            let conn = self.lock();
            let docs = snapshot(&conn, collection)?;
            self.registry.register_collection(collection, sink, docs)
        };
        initial.deliver();
        Ok(subscription)
    }

    fn subscribe_one(
        &self,
        collection: Collection,
        id: &str,
        sink: DocumentSink,
    ) -> Result<Subscription, StoreError> {
        let (subscription, initial) = {
            let conn = self.lock();
            let doc = load(&conn, collection, id)?.map(|fields| Document::new(id, fields));
            self.registry.register_document(collection, id, sink, doc)
        };
        initial.deliver();
        Ok(subscription)
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let fields = load(&self.lock(), collection, id)?;
        Ok(fields.map(|fields| Document::new(id, fields)))
    }

    fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        query::validate(query)?;
        let (sql, values) = compile_query(query);
        debug!(%sql, "sqlite query");
        select(&self.lock(), &sql, &values)
    }

    fn count(&self, collection: Collection, filters: &[Filter]) -> Result<u64, StoreError> {
        query::validate_filters(filters)?;
        let mut builder = SqlBuilder::new(collection);
        let where_clause = builder.where_clause(filters);
        let sql = format!("SELECT COUNT(*) FROM documents{where_clause}");
        let count: i64 = self
            .lock()
            .query_row(&sql, params_from_iter(builder.values.iter()), |row| {
                row.get(0)
            })
            .map_err(|err| unavailable(&err))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn create(&self, collection: Collection, fields: Fields) -> Result<String, StoreError> {
        let id = new_document_id();
        self.write(collection, |conn| store_body(conn, collection, &id, &fields))?;
        Ok(id)
    }

    fn set(
        &self,
        collection: Collection,
        id: &str,
        fields: Fields,
        merge: bool,
    ) -> Result<(), StoreError> {
        self.write(collection, |conn| {
            let mut body = if merge {
                load(conn, collection, id)?.unwrap_or_default()
            } else {
                Fields::new()
            };
            body.extend(fields);
            store_body(conn, collection, id, &body)
        })
    }

    fn update(&self, collection: Collection, id: &str, fields: Fields) -> Result<(), StoreError> {
        self.write(collection, |conn| {
            let mut body = load(conn, collection, id)?.ok_or_else(|| StoreError::NotFound {
                collection,
                id: id.to_string(),
            })?;
            body.extend(fields);
            store_body(conn, collection, id, &body)
        })
    }

    fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        self.write(collection, |conn| {
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id],
            )
            .map_err(|err| unavailable(&err))?;
            Ok(())
        })
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OrderBy;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        let Value::Object(map) = value else {
            panic!("fields must be an object");
        };
        map
    }

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("open store");
        let rows = [
            ("a", json!({"status": "todo", "createdAt": 3, "tags": ["ui"], "done": false})),
            ("b", json!({"status": "fixed", "createdAt": 2, "tags": ["api", "ui"], "done": true})),
            ("c", json!({"status": "todo", "createdAt": 1, "tags": [], "done": false})),
            ("d", json!({"status": 7, "createdAt": "late"})),
        ];
        for (id, body) in rows {
            store
                .set(Collection::Tickets, id, fields(body), false)
                .expect("seed");
        }
        store
    }

    fn ids(docs: Vec<Document>) -> Vec<String> {
        docs.into_iter().map(|d| d.id).collect()
    }

    #[test]
    fn json_paths_quote_each_segment() {
        assert_eq!(json_path("media.type"), "$.\"media\".\"type\"");
    }

    #[test]
    fn equality_is_type_strict() {
        let store = seeded();
        let q = Query::new(Collection::Tickets).filter(Filter::eq("status", "todo"));
        assert_eq!(ids(store.query(&q).unwrap()), vec!["a", "c"]);
        let q = Query::new(Collection::Tickets).filter(Filter::eq("done", true));
        assert_eq!(ids(store.query(&q).unwrap()), vec!["b"]);
        let q = Query::new(Collection::Tickets).filter(Filter::eq("status", 7));
        assert_eq!(ids(store.query(&q).unwrap()), vec!["d"]);
    }

    #[test]
    fn sort_ranks_types_and_skips_missing_fields() {
        let store = seeded();
        store
            .set(Collection::Tickets, "e", fields(json!({"status": "todo"})), false)
            .unwrap();
        let q = Query::new(Collection::Tickets).order_by(OrderBy::desc("createdAt"));
        assert_eq!(ids(store.query(&q).unwrap()), vec!["d", "a", "b", "c"]);
        let q = q.limit(2);
        assert_eq!(ids(store.query(&q).unwrap()), vec!["d", "a"]);
    }

    #[test]
    fn array_membership_and_negations() {
        let store = seeded();
        let q = Query::new(Collection::Tickets)
            .filter(Filter::new("tags", FilterOp::ArrayContains, "ui"));
        assert_eq!(ids(store.query(&q).unwrap()), vec!["a", "b"]);
        let q = Query::new(Collection::Tickets)
            .filter(Filter::new("status", FilterOp::NotIn, json!(["todo"])));
        assert_eq!(ids(store.query(&q).unwrap()), vec!["b", "d"]);
        assert_eq!(
            store
                .count(
                    Collection::Tickets,
                    &[Filter::new("createdAt", FilterOp::Lt, 3)]
                )
                .unwrap(),
            2
        );
    }

    #[test]
    fn rejected_queries_keep_store_message() {
        let store = seeded();
        let q = Query::new(Collection::Tickets)
            .filter(Filter::new("status", FilterOp::NotEq, "todo"))
            .order_by(OrderBy::desc("createdAt"));
        let err = store.query(&q).unwrap_err();
        assert!(matches!(err, StoreError::Rejected(ref m) if m.contains("orderBy()")));
    }

    #[test]
    fn documents_survive_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("tickboard.sqlite3");
        {
            let store = SqliteStore::open(&path).expect("open");
            store
                .set(Collection::Boards, "b1", fields(json!({"name": "BU"})), false)
                .unwrap();
        }
        let store = SqliteStore::open(&path).expect("reopen");
        let doc = store.get(Collection::Boards, "b1").unwrap().unwrap();
        assert_eq!(doc.fields["name"], "BU");
    }

    #[test]
    fn update_requires_existing_document() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .update(Collection::Users, "ghost", fields(json!({"role": "admin"})))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
