//! Structured SELECT builder.
//!
//! Queries are kept as data (predicates, computed columns, sort terms) and
//! rendered to PostgreSQL text on demand. Rendering is pure: the same
//! builder always produces the same SQL and parameter list, because
//! subquery aliases come from a per-builder counter and parameters are
//! numbered in rendering order.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt::Write as _;

use trellis_core::{Entity, QueryValue, SortDirection};

static IDENTIFIER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid identifier regex"));

/// Alias of the outer table in every rendered query.
pub const ROOT_ALIAS: &str = "e";

/// Whether `name` is safe to interpolate as a column or table name.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(name)
}

// ============================================================================
// QUERY PARTS
// ============================================================================

/// Which related ids a relation subquery accepts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RelatedMatch {
    /// `jt.related = $n`
    One(QueryValue),
    /// `jt.related IN ($n, ...)`
    Any(Vec<QueryValue>),
}

impl RelatedMatch {
    /// All accepted values.
    pub fn values(&self) -> &[QueryValue] {
        match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Any(values) => values,
        }
    }
}

/// Correlated `EXISTS` over a join table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationSubquery {
    pub alias: String,
    pub join_table: String,
    pub owner_column: String,
    pub related_column: String,
    pub related: RelatedMatch,
}

/// A WHERE predicate. Predicates are joined with `AND`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Predicate {
    /// `e.column = $n`
    Eq { column: String, value: QueryValue },
    /// `(e.a ILIKE $n OR e.b ILIKE $m)` with `%term%`
    Search { columns: Vec<String>, term: String },
    /// `EXISTS (SELECT 1 FROM join_table ...)`
    RelationExists(RelationSubquery),
}

/// Correlated `COUNT(*)` over a join table, selected as `alias`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationCount {
    pub alias: String,
    pub join_table: String,
    pub owner_column: String,
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OrderTerm {
    Column {
        column: String,
        direction: SortDirection,
    },
    RelationCount {
        alias: String,
        direction: SortDirection,
    },
}

/// Rendered SQL text and its positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<QueryValue>,
}

struct Params(Vec<QueryValue>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Projection {
    Columns,
    Json,
}

fn count_expr(count: &RelationCount) -> String {
    format!(
        "(SELECT COUNT(*) FROM {jt} {a} WHERE {a}.{owner} = {root}.id)",
        jt = count.join_table,
        a = count.alias,
        owner = count.owner_column,
        root = ROOT_ALIAS,
    )
}

impl Params {
    fn push(&mut self, value: QueryValue) -> String {
        self.0.push(value);
        format!("${}", self.0.len())
    }
}

// ============================================================================
// SELECT QUERY
// ============================================================================

/// A SELECT over one entity table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectQuery {
    entity: String,
    table: String,
    predicates: Vec<Predicate>,
    counts: Vec<RelationCount>,
    order: Vec<OrderTerm>,
    limit: Option<u32>,
    offset: Option<u32>,
    next_alias: u32,
}

impl SelectQuery {
    /// Start a query over `table` for the entity tagged `entity`.
    pub fn new(entity: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            predicates: Vec::new(),
            counts: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            next_alias: 0,
        }
    }

    /// Start a query over an [`Entity`] type's table.
    pub fn for_entity<E: Entity>() -> Self {
        Self::new(E::NAME, E::TABLE)
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn relation_counts(&self) -> &[RelationCount] {
        &self.counts
    }

    pub fn order_terms(&self) -> &[OrderTerm] {
        &self.order
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn offset(&self) -> Option<u32> {
        self.offset
    }

    /// Next subquery alias, e.g. `jt1`, `rc2`. Unique within this builder.
    pub fn alloc_alias(&mut self, prefix: &str) -> String {
        self.next_alias += 1;
        format!("{}{}", prefix, self.next_alias)
    }

    /// Append a predicate as-is.
    pub fn push_predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// `e.column = value`. Invalid column names are dropped.
    pub fn where_eq(self, column: &str, value: QueryValue) -> Self {
        if !is_valid_identifier(column) {
            tracing::debug!(column, "Ignoring equality filter on invalid column name");
            return self;
        }
        self.push_predicate(Predicate::Eq {
            column: column.to_string(),
            value,
        })
    }

    /// Case-insensitive substring match over `columns`.
    pub fn where_search(self, columns: &[&str], term: &str) -> Self {
        let columns: Vec<String> = columns
            .iter()
            .filter(|c| is_valid_identifier(c))
            .map(|c| c.to_string())
            .collect();
        if columns.is_empty() || term.trim().is_empty() {
            return self;
        }
        self.push_predicate(Predicate::Search {
            columns,
            term: term.to_string(),
        })
    }

    /// Append a column sort term. Invalid column names are dropped.
    pub fn order_by(mut self, column: &str, direction: SortDirection) -> Self {
        if !is_valid_identifier(column) {
            tracing::debug!(column, "Ignoring sort on invalid column name");
            return self;
        }
        self.order.push(OrderTerm::Column {
            column: column.to_string(),
            direction,
        });
        self
    }

    /// Add a relation count column and sort by it.
    ///
    /// Count orderings go ahead of every column sort, so existing column
    /// sorts break ties between equal counts. Among several count orderings
    /// the earlier one wins.
    pub fn push_relation_count(mut self, count: RelationCount, direction: SortDirection) -> Self {
        let position = self
            .order
            .iter()
            .take_while(|t| matches!(t, OrderTerm::RelationCount { .. }))
            .count();
        self.order.insert(
            position,
            OrderTerm::RelationCount {
                alias: count.alias.clone(),
                direction,
            },
        );
        self.counts.push(count);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Drop pagination and ordering, e.g. for a total count.
    pub fn without_paging(&self) -> Self {
        Self {
            order: Vec::new(),
            counts: Vec::new(),
            limit: None,
            offset: None,
            ..self.clone()
        }
    }

    // ------------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------------

    /// Render the full SELECT, relation counts selected under their aliases.
    pub fn to_sql(&self) -> RenderedQuery {
        self.render(Projection::Columns)
    }

    /// Render the SELECT with each row as one `to_jsonb(e)` value.
    ///
    /// Ordering and paging stay on the same level as the projection, so the
    /// row order is the ORDER BY order. Relation counts only appear in the
    /// ORDER BY.
    pub fn to_json_sql(&self) -> RenderedQuery {
        self.render(Projection::Json)
    }

    fn render(&self, projection: Projection) -> RenderedQuery {
        let mut params = Params(Vec::new());
        let mut sql = match projection {
            Projection::Columns => format!("SELECT {}.*", ROOT_ALIAS),
            Projection::Json => format!("SELECT to_jsonb({})", ROOT_ALIAS),
        };

        if projection == Projection::Columns {
            for count in &self.counts {
                let _ = write!(sql, ", {} AS {}", count_expr(count), count.alias);
            }
        }
        let _ = write!(sql, " FROM {} {}", self.table, ROOT_ALIAS);
        self.render_where(&mut sql, &mut params);

        if !self.order.is_empty() {
            let terms: Vec<String> = self
                .order
                .iter()
                .map(|term| match term {
                    OrderTerm::Column { column, direction } => {
                        format!("{}.{} {}", ROOT_ALIAS, column, direction.as_sql())
                    }
                    OrderTerm::RelationCount { alias, direction } => {
                        let key = match projection {
                            Projection::Columns => alias.clone(),
                            Projection::Json => self
                                .counts
                                .iter()
                                .find(|c| &c.alias == alias)
                                .map(count_expr)
                                .unwrap_or_else(|| alias.clone()),
                        };
                        format!("{} {}", key, direction.as_sql())
                    }
                })
                .collect();
            let _ = write!(sql, " ORDER BY {}", terms.join(", "));
        }
        if let Some(limit) = self.limit {
            let _ = write!(sql, " LIMIT {}", limit);
        }
        if let Some(offset) = self.offset {
            let _ = write!(sql, " OFFSET {}", offset);
        }

        RenderedQuery {
            sql,
            params: params.0,
        }
    }

    /// Render `SELECT COUNT(*)` with the same predicates and no paging.
    pub fn to_count_sql(&self) -> RenderedQuery {
        let mut params = Params(Vec::new());
        let mut sql = format!("SELECT COUNT(*) FROM {} {}", self.table, ROOT_ALIAS);
        self.render_where(&mut sql, &mut params);
        RenderedQuery {
            sql,
            params: params.0,
        }
    }

    fn render_where(&self, sql: &mut String, params: &mut Params) {
        if self.predicates.is_empty() {
            return;
        }
        let clauses: Vec<String> = self
            .predicates
            .iter()
            .map(|p| render_predicate(p, params))
            .collect();
        let _ = write!(sql, " WHERE {}", clauses.join(" AND "));
    }
}

fn render_predicate(predicate: &Predicate, params: &mut Params) -> String {
    match predicate {
        Predicate::Eq { column, value } => {
            format!("{}.{} = {}", ROOT_ALIAS, column, params.push(value.clone()))
        }
        Predicate::Search { columns, term } => {
            let pattern = format!("%{}%", escape_like(term));
            let alternatives: Vec<String> = columns
                .iter()
                .map(|c| {
                    format!(
                        "{}.{} ILIKE {}",
                        ROOT_ALIAS,
                        c,
                        params.push(QueryValue::Text(pattern.clone()))
                    )
                })
                .collect();
            format!("({})", alternatives.join(" OR "))
        }
        Predicate::RelationExists(sub) => {
            let related = match &sub.related {
                RelatedMatch::One(value) => format!("= {}", params.push(value.clone())),
                RelatedMatch::Any(values) => {
                    let placeholders: Vec<String> =
                        values.iter().map(|v| params.push(v.clone())).collect();
                    format!("IN ({})", placeholders.join(", "))
                }
            };
            format!(
                "EXISTS (SELECT 1 FROM {jt} {a} WHERE {a}.{owner} = {root}.id AND {a}.{rel} {related})",
                jt = sub.join_table,
                a = sub.alias,
                owner = sub.owner_column,
                rel = sub.related_column,
                root = ROOT_ALIAS,
                related = related,
            )
        }
    }
}

/// Escape LIKE wildcards so a search term matches literally.
pub fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ============================================================================
// RELATED ROWS
// ============================================================================

/// Column carrying the owning row's id in [`RelatedRowsQuery`] results.
pub const OWNER_KEY: &str = "__owner_id";

/// Batched load of related rows for a set of owners through a join table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedRowsQuery {
    pub related_table: String,
    pub join_table: String,
    pub owner_column: String,
    pub related_column: String,
    pub owner_ids: Vec<QueryValue>,
}

impl RelatedRowsQuery {
    pub fn to_sql(&self) -> RenderedQuery {
        self.render(&format!("r.*, jt.{} AS {}", self.owner_column, OWNER_KEY))
    }

    /// Render with each row as one JSONB value carrying [`OWNER_KEY`].
    pub fn to_json_sql(&self) -> RenderedQuery {
        self.render(&format!(
            "to_jsonb(r) || jsonb_build_object('{}', jt.{})",
            OWNER_KEY, self.owner_column
        ))
    }

    fn render(&self, projection: &str) -> RenderedQuery {
        let mut params = Params(Vec::new());
        let placeholders: Vec<String> = self
            .owner_ids
            .iter()
            .map(|id| params.push(id.clone()))
            .collect();
        let sql = format!(
            "SELECT {projection} FROM {related} r JOIN {jt} jt ON jt.{rel} = r.id \
             WHERE jt.{owner} IN ({ids}) ORDER BY r.id ASC",
            projection = projection,
            owner = self.owner_column,
            related = self.related_table,
            jt = self.join_table,
            rel = self.related_column,
            ids = placeholders.join(", "),
        );
        RenderedQuery {
            sql,
            params: params.0,
        }
    }
}
