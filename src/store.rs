//! SQL store façade.
//!
//! One SQLite database per instance. Statements are cached by source text
//! and rebound on reuse; a statement whose execution fails is evicted from
//! the cache so the next use recompiles it. Query results come back as
//! ordered [`Row`] value queues popped in the declared order of the
//! extraction mapping (`s` = text column, `i` = integer column).

use std::collections::VecDeque;
use std::path::Path;

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, CachedStatement, Connection, ToSql};

use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS REQUESTS (
    NAME  TEXT PRIMARY KEY,
    COUNT INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS ACCESS (
    CHANNEL TEXT NOT NULL,
    NAME    TEXT NOT NULL,
    ACCESS  INTEGER NOT NULL,
    PRIMARY KEY (CHANNEL, NAME)
);
CREATE TABLE IF NOT EXISTS WHITELIST (
    NAME TEXT PRIMARY KEY,
    LIBC INTEGER NOT NULL DEFAULT 0
);
";

/// A bind parameter: `s`/`S` map to text, `i` to integer.
#[derive(Debug, Clone)]
pub enum SqlParam {
    /// Text value.
    Text(String),
    /// Integer value.
    Int(i64),
}

impl SqlParam {
    /// Text parameter from anything stringish.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Integer parameter.
    pub fn int(i: i64) -> Self {
        Self::Int(i)
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(s) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))),
            SqlParam::Int(i) => Ok(ToSqlOutput::from(*i)),
        }
    }
}

/// One extracted value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Text column.
    Text(String),
    /// Integer column.
    Int(i64),
}

/// An ordered queue of extracted values.
#[derive(Debug, Clone, Default)]
pub struct Row {
    values: VecDeque<Value>,
}

impl Row {
    /// Pop the next value as text; `None` if exhausted or the next value
    /// is not text (the value stays queued).
    pub fn pop_text(&mut self) -> Option<String> {
        match self.values.front() {
            Some(Value::Text(_)) => match self.values.pop_front() {
                Some(Value::Text(s)) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    /// Pop the next value as an integer; `None` if exhausted or the next
    /// value is not an integer.
    pub fn pop_int(&mut self) -> Option<i64> {
        match self.values.front() {
            Some(Value::Int(_)) => match self.values.pop_front() {
                Some(Value::Int(i)) => Some(i),
                _ => None,
            },
            _ => None,
        }
    }

    /// Remaining values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether every value has been popped.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The per-instance store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path` and ensure the
    /// core tables exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// An in-memory store, used by tests and ad-hoc tooling.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn run<T>(
        &self,
        sql: &str,
        f: impl FnOnce(&mut CachedStatement<'_>) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        match f(&mut stmt) {
            Ok(value) => Ok(value),
            Err(err) => {
                // A failed step poisons the handle; recompile next use.
                stmt.discard();
                Err(err.into())
            }
        }
    }

    /// Run a statement to completion.
    pub fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<usize, StoreError> {
        self.run(sql, |stmt| stmt.execute(params_from_iter(params.iter())))
    }

    /// Run a query and extract the first row with the given mapping, or
    /// `None` when the query produces no rows.
    pub fn query_row(
        &self,
        sql: &str,
        params: &[SqlParam],
        fields: &str,
    ) -> Result<Option<Row>, StoreError> {
        validate_mapping(fields)?;
        self.run(sql, |stmt| {
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            match rows.next()? {
                Some(row) => Ok(Some(extract(row, fields)?)),
                None => Ok(None),
            }
        })
    }

    /// Run a query and extract every row with the given mapping.
    pub fn query_rows(
        &self,
        sql: &str,
        params: &[SqlParam],
        fields: &str,
    ) -> Result<Vec<Row>, StoreError> {
        validate_mapping(fields)?;
        self.run(sql, |stmt| {
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(extract(row, fields)?);
            }
            Ok(out)
        })
    }

    /// Bump the hit counter for `table`.
    pub fn request(&self, table: &str) -> Result<(), StoreError> {
        self.execute(
            "INSERT INTO REQUESTS(NAME, COUNT) VALUES (?1, 1) \
             ON CONFLICT(NAME) DO UPDATE SET COUNT = COUNT + 1",
            &[SqlParam::text(table)],
        )?;
        Ok(())
    }

    /// Current hit counter for `table`; zero when never requested.
    pub fn request_count(&self, table: &str) -> Result<i64, StoreError> {
        let row = self.query_row(
            "SELECT COUNT FROM REQUESTS WHERE NAME = ?1",
            &[SqlParam::text(table)],
            "i",
        )?;
        Ok(row.and_then(|mut r| r.pop_int()).unwrap_or(0))
    }
}

fn validate_mapping(fields: &str) -> Result<(), StoreError> {
    match fields.chars().find(|&c| c != 's' && c != 'i') {
        Some(c) => Err(StoreError::BadMapping(c)),
        None => Ok(()),
    }
}

fn extract(row: &rusqlite::Row<'_>, fields: &str) -> Result<Row, rusqlite::Error> {
    let mut values = VecDeque::with_capacity(fields.len());
    for (idx, field) in fields.chars().enumerate() {
        match field {
            's' => {
                let text: Option<String> = row.get(idx)?;
                values.push_back(Value::Text(text.unwrap_or_default()));
            }
            'i' => {
                let int: Option<i64> = row.get(idx)?;
                values.push_back(Value::Int(int.unwrap_or(0)));
            }
            // validate_mapping already rejected anything else
            _ => unreachable!(),
        }
    }
    Ok(Row { values })
}
