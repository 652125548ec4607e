//! In-memory [`Store`] that evaluates structured queries directly.
//!
//! It understands the same predicates, relation counts and sort terms the
//! SQL renderer emits, so repository behavior can be exercised without a
//! database. Join tables are ordinary tables without generated ids.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use trellis_core::{IdKind, QueryValue, SortDirection, StoreError, StoreResult, WhereCondition};
use trellis_query::{OrderTerm, Predicate, RelatedRowsQuery, SelectQuery, OWNER_KEY};

use super::{Row, Store};

#[derive(Debug, Default)]
struct Table {
    /// `None` for join tables.
    id_kind: Option<IdKind>,
    rows: Vec<Row>,
    next_id: i64,
}

type Tables = HashMap<String, Table>;

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity table whose ids are generated per `id_kind`.
    pub fn with_table(self, name: &str, id_kind: IdKind) -> Self {
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(
                name.to_string(),
                Table {
                    id_kind: Some(id_kind),
                    ..Default::default()
                },
            );
        }
        self
    }

    /// Add a join table.
    pub fn with_join_table(self, name: &str) -> Self {
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(name.to_string(), Table::default());
        }
        self
    }

    /// Insert a row synchronously. Missing ids are generated for entity
    /// tables; join-table rows are stored as given.
    pub fn insert_row(&self, table: &str, mut row: Row) -> StoreResult<Row> {
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        let target = tables.get_mut(table).ok_or_else(|| unknown(table))?;

        let given = row.get("id").filter(|v| !v.is_null()).cloned();
        match (target.id_kind, given) {
            (Some(IdKind::Integer), None) => {
                target.next_id += 1;
                row.insert("id".to_string(), Value::from(target.next_id));
            }
            (Some(IdKind::Uuid | IdKind::Text), None) => {
                row.insert("id".to_string(), Value::from(Uuid::new_v4().to_string()));
            }
            (Some(IdKind::Integer), Some(existing)) => {
                if let Some(given) = existing.as_i64() {
                    target.next_id = target.next_id.max(given);
                }
            }
            _ => {}
        }

        target.rows.push(row.clone());
        Ok(row)
    }

    /// Snapshot of every row in `table`.
    pub fn rows(&self, table: &str) -> StoreResult<Vec<Row>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        tables
            .get(table)
            .map(|t| t.rows.clone())
            .ok_or_else(|| unknown(table))
    }

    fn select(&self, query: &SelectQuery) -> StoreResult<Vec<Row>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        let source = tables.get(query.table()).ok_or_else(|| unknown(query.table()))?;

        let mut rows = Vec::new();
        for row in &source.rows {
            if matches_all(&tables, row, query.predicates())? {
                let mut row = row.clone();
                for count in query.relation_counts() {
                    let n = count_related(&tables, &row, &count.join_table, &count.owner_column)?;
                    row.insert(count.alias.clone(), Value::from(n));
                }
                rows.push(row);
            }
        }

        let order = query.order_terms();
        rows.sort_by(|a, b| compare_rows(a, b, order));

        let offset = query.offset().unwrap_or(0) as usize;
        let rows = rows.into_iter().skip(offset);
        Ok(match query.limit() {
            Some(limit) => rows.take(limit as usize).collect(),
            None => rows.collect(),
        })
    }
}

fn unknown(table: &str) -> StoreError {
    StoreError::UnknownTable {
        table: table.to_string(),
    }
}

fn column<'a>(row: &'a Row, name: &str) -> &'a Value {
    row.get(name).unwrap_or(&Value::Null)
}

fn meets(row: &Row, criteria: &[WhereCondition]) -> bool {
    criteria
        .iter()
        .all(|c| c.value.matches_json(column(row, &c.field)))
}

fn matches_all(tables: &Tables, row: &Row, predicates: &[Predicate]) -> StoreResult<bool> {
    for predicate in predicates {
        let matched = match predicate {
            Predicate::Eq { column: name, value } => value.matches_json(column(row, name)),
            Predicate::Search { columns, term } => {
                let needle = term.to_lowercase();
                columns.iter().any(|name| match column(row, name) {
                    Value::Null => false,
                    Value::String(s) => s.to_lowercase().contains(&needle),
                    other => other.to_string().to_lowercase().contains(&needle),
                })
            }
            Predicate::RelationExists(sub) => {
                let join = tables.get(&sub.join_table).ok_or_else(|| unknown(&sub.join_table))?;
                let owner = QueryValue::from_json(column(row, "id"));
                join.rows.iter().any(|link| {
                    owner.matches_json(column(link, &sub.owner_column))
                        && sub
                            .related
                            .values()
                            .iter()
                            .any(|v| v.matches_json(column(link, &sub.related_column)))
                })
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn count_related(tables: &Tables, row: &Row, join_table: &str, owner_column: &str) -> StoreResult<u64> {
    let join = tables.get(join_table).ok_or_else(|| unknown(join_table))?;
    let owner = QueryValue::from_json(column(row, "id"));
    Ok(join
        .rows
        .iter()
        .filter(|link| owner.matches_json(column(link, owner_column)))
        .count() as u64)
}

fn compare_rows(a: &Row, b: &Row, order: &[OrderTerm]) -> Ordering {
    for term in order {
        let (name, direction) = match term {
            OrderTerm::Column { column, direction } => (column.as_str(), *direction),
            OrderTerm::RelationCount { alias, direction } => (alias.as_str(), *direction),
        };
        let ordering = compare_json(column(a, name), column(b, name));
        let ordering = match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Total order over JSON scalars. Nulls sort last ascending, as in
/// PostgreSQL.
fn compare_json(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal),
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (x, y) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn fetch_all(&self, query: &SelectQuery) -> StoreResult<Vec<Row>> {
        self.select(query)
    }

    async fn count(&self, query: &SelectQuery) -> StoreResult<u64> {
        Ok(self.select(&query.without_paging())?.len() as u64)
    }

    async fn fetch_related(&self, query: &RelatedRowsQuery) -> StoreResult<Vec<Row>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        let join = tables.get(&query.join_table).ok_or_else(|| unknown(&query.join_table))?;
        let related = tables
            .get(&query.related_table)
            .ok_or_else(|| unknown(&query.related_table))?;

        let mut out = Vec::new();
        for link in &join.rows {
            let owner = column(link, &query.owner_column);
            if !query.owner_ids.iter().any(|id| id.matches_json(owner)) {
                continue;
            }
            let target = QueryValue::from_json(column(link, &query.related_column));
            for row in related.rows.iter().filter(|r| target.matches_json(column(r, "id"))) {
                let mut row = row.clone();
                row.insert(OWNER_KEY.to_string(), owner.clone());
                out.push(row);
            }
        }
        out.sort_by(|a, b| compare_json(column(a, "id"), column(b, "id")));
        Ok(out)
    }

    async fn find_one(
        &self,
        table: &str,
        criteria: &[WhereCondition],
    ) -> StoreResult<Option<Row>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        let source = tables.get(table).ok_or_else(|| unknown(table))?;
        Ok(source.rows.iter().find(|row| meets(row, criteria)).cloned())
    }

    async fn insert(&self, table: &str, row: Row) -> StoreResult<Row> {
        self.insert_row(table, row)
    }

    async fn update(
        &self,
        table: &str,
        criteria: &[WhereCondition],
        changes: Row,
    ) -> StoreResult<Option<Row>> {
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        let target = tables.get_mut(table).ok_or_else(|| unknown(table))?;
        Ok(target
            .rows
            .iter_mut()
            .find(|row| meets(row, criteria))
            .map(|row| {
                row.extend(changes);
                row.clone()
            }))
    }

    async fn delete(&self, table: &str, criteria: &[WhereCondition]) -> StoreResult<u64> {
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        let target = tables.get_mut(table).ok_or_else(|| unknown(table))?;
        let before = target.rows.len();
        target.rows.retain(|row| !meets(row, criteria));
        Ok((before - target.rows.len()) as u64)
    }
}
