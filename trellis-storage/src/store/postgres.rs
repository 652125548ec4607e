//! PostgreSQL [`Store`] over a `deadpool-postgres` pool.
//!
//! Rows come back as `to_jsonb(..)` so every table decodes through the same
//! path. Writes go through `jsonb_populate_record`, which casts each JSON
//! field to the column's declared type; column defaults still apply to
//! fields the caller left out.

use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use postgres_types::{to_sql_checked, IsNull, ToSql, Type};
use serde_json::Value as JsonValue;
use std::error::Error;
use std::time::Duration;
use tokio_postgres::NoTls;
use uuid::Uuid;

use trellis_core::{ConfigError, QueryValue, StoreError, StoreResult, WhereCondition};
use trellis_query::{is_valid_identifier, RelatedRowsQuery, RenderedQuery, SelectQuery};

use super::{into_row, Row, Store};

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait timeout for a pooled connection
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "trellis".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Load from environment variables.
    ///
    /// - `TRELLIS_DB_HOST`, `TRELLIS_DB_PORT`, `TRELLIS_DB_NAME`
    /// - `TRELLIS_DB_USER`, `TRELLIS_DB_PASSWORD`
    /// - `TRELLIS_DB_POOL_SIZE`: maximum pooled connections (default: 16)
    /// - `TRELLIS_DB_TIMEOUT_SECS`: pool wait timeout (default: 30)
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit set of variables. Unparseable numbers keep
    /// their defaults.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        for (name, value) in vars {
            match name.as_str() {
                "TRELLIS_DB_HOST" => config.host = value,
                "TRELLIS_DB_PORT" => config.port = value.parse().unwrap_or(config.port),
                "TRELLIS_DB_NAME" => config.dbname = value,
                "TRELLIS_DB_USER" => config.user = value,
                "TRELLIS_DB_PASSWORD" => config.password = value,
                "TRELLIS_DB_POOL_SIZE" => {
                    config.max_size = value.parse().unwrap_or(config.max_size)
                }
                "TRELLIS_DB_TIMEOUT_SECS" => {
                    if let Ok(secs) = value.parse() {
                        config.timeout = Duration::from_secs(secs);
                    }
                }
                _ => {}
            }
        }
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_size".to_string(),
                value: "0".to_string(),
                reason: "pool size must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> StoreResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = PoolConfig::new(self.max_size);
        pool_config.timeouts.wait = Some(self.timeout);
        cfg.pool = Some(pool_config);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Connection {
                reason: format!("Failed to create pool: {}", e),
            })
    }
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// Binds a [`QueryValue`] to whatever type PostgreSQL inferred for the
/// placeholder, so `7` works against INT4, INT8 and TEXT columns alike and
/// UUID strings bind to UUID columns.
#[derive(Debug)]
struct SqlParam<'a>(&'a QueryValue);

impl SqlParam<'_> {
    fn as_to_sql(&self) -> &(dyn ToSql + Sync) {
        self
    }
}

impl ToSql for SqlParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self.0 {
            QueryValue::Null => Ok(IsNull::Yes),
            QueryValue::Bool(b) => b.to_sql(ty, out),
            QueryValue::Integer(i) => bind_integer(*i, ty, out),
            QueryValue::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::FLOAT8 => f.to_sql(ty, out),
                _ => f.to_string().to_sql(ty, out),
            },
            QueryValue::Text(s) => match *ty {
                Type::UUID => Uuid::parse_str(s)?.to_sql(ty, out),
                Type::INT2 | Type::INT4 | Type::INT8 => bind_integer(s.parse()?, ty, out),
                Type::BOOL => s.parse::<bool>()?.to_sql(ty, out),
                _ => s.as_str().to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_integer(i: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    match *ty {
        Type::INT2 => i16::try_from(i)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(i)?.to_sql(ty, out),
        Type::INT8 => i.to_sql(ty, out),
        Type::FLOAT8 => (i as f64).to_sql(ty, out),
        _ => i.to_string().to_sql(ty, out),
    }
}

// ============================================================================
// SQL TEXT
// ============================================================================

fn checked(name: &str) -> StoreResult<&str> {
    if is_valid_identifier(name) {
        Ok(name)
    } else {
        Err(StoreError::UnknownTable {
            table: name.to_string(),
        })
    }
}

/// `col1 = $n AND col2 = $n+1`, numbering from `first`.
fn where_clause(criteria: &[WhereCondition], first: usize) -> StoreResult<String> {
    if criteria.is_empty() {
        return Ok("TRUE".to_string());
    }
    let clauses = criteria
        .iter()
        .enumerate()
        .map(|(i, c)| -> StoreResult<String> {
            Ok(format!("{} = ${}", checked(&c.field)?, first + i))
        })
        .collect::<StoreResult<Vec<_>>>()?;
    Ok(clauses.join(" AND "))
}

fn find_one_sql(table: &str, criteria: &[WhereCondition]) -> StoreResult<String> {
    let table = checked(table)?;
    Ok(format!(
        "SELECT to_jsonb(t) FROM {} t WHERE {} LIMIT 1",
        table,
        where_clause(criteria, 1)?
    ))
}

fn insert_sql(table: &str, columns: &[&str]) -> StoreResult<String> {
    let table = checked(table)?;
    if columns.is_empty() {
        return Ok(format!(
            "INSERT INTO {t} DEFAULT VALUES RETURNING to_jsonb({t}.*)",
            t = table
        ));
    }
    let columns = columns
        .iter()
        .map(|c| checked(c))
        .collect::<StoreResult<Vec<_>>>()?
        .join(", ");
    Ok(format!(
        "INSERT INTO {t} ({c}) SELECT {c} FROM jsonb_populate_record(NULL::{t}, $1::jsonb) \
         RETURNING to_jsonb({t}.*)",
        t = table,
        c = columns
    ))
}

fn update_sql(table: &str, columns: &[&str], criteria: &[WhereCondition]) -> StoreResult<String> {
    let table = checked(table)?;
    let columns = columns
        .iter()
        .map(|c| checked(c))
        .collect::<StoreResult<Vec<_>>>()?
        .join(", ");
    Ok(format!(
        "UPDATE {t} SET ({c}) = (SELECT {c} FROM jsonb_populate_record(NULL::{t}, $1::jsonb)) \
         WHERE {w} RETURNING to_jsonb({t}.*)",
        t = table,
        c = columns,
        w = where_clause(criteria, 2)?
    ))
}

fn delete_sql(table: &str, criteria: &[WhereCondition]) -> StoreResult<String> {
    let table = checked(table)?;
    Ok(format!("DELETE FROM {} WHERE {}", table, where_clause(criteria, 1)?))
}

// ============================================================================
// STORE
// ============================================================================

/// Store backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> StoreResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> StoreResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| StoreError::Connection {
            reason: e.to_string(),
        })
    }

    async fn query_rows(&self, sql: &str, params: &[QueryValue]) -> StoreResult<Vec<Row>> {
        let conn = self.get_conn().await?;
        let params: Vec<SqlParam> = params.iter().map(SqlParam).collect();
        let sql_params: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_to_sql()).collect();

        let rows = conn
            .query(sql, &sql_params[..])
            .await
            .map_err(query_error)?;
        rows.iter()
            .map(|row| into_row(row.get::<_, JsonValue>(0)))
            .collect()
    }

    async fn query_rendered(&self, rendered: &RenderedQuery) -> StoreResult<Vec<Row>> {
        self.query_rows(&rendered.sql, &rendered.params).await
    }

    /// Run a write whose first parameter is a JSON payload.
    async fn write_returning(
        &self,
        sql: &str,
        payload: &JsonValue,
        criteria: &[WhereCondition],
    ) -> StoreResult<Option<Row>> {
        let conn = self.get_conn().await?;
        let params: Vec<SqlParam> = criteria.iter().map(|c| SqlParam(&c.value)).collect();
        let mut sql_params: Vec<&(dyn ToSql + Sync)> = vec![payload as &(dyn ToSql + Sync)];
        sql_params.extend(params.iter().map(|p| p.as_to_sql()));

        let row = conn
            .query_opt(sql, &sql_params[..])
            .await
            .map_err(query_error)?;
        row.map(|r| into_row(r.get::<_, JsonValue>(0))).transpose()
    }
}

fn query_error(e: tokio_postgres::Error) -> StoreError {
    StoreError::Query {
        reason: e.to_string(),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn fetch_all(&self, query: &SelectQuery) -> StoreResult<Vec<Row>> {
        self.query_rendered(&query.to_json_sql()).await
    }

    async fn count(&self, query: &SelectQuery) -> StoreResult<u64> {
        let rendered = query.to_count_sql();
        let conn = self.get_conn().await?;
        let params: Vec<SqlParam> = rendered.params.iter().map(SqlParam).collect();
        let sql_params: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_to_sql()).collect();

        let row = conn
            .query_one(&rendered.sql, &sql_params[..])
            .await
            .map_err(query_error)?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn fetch_related(&self, query: &RelatedRowsQuery) -> StoreResult<Vec<Row>> {
        if query.owner_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.query_rendered(&query.to_json_sql()).await
    }

    async fn find_one(
        &self,
        table: &str,
        criteria: &[WhereCondition],
    ) -> StoreResult<Option<Row>> {
        let sql = find_one_sql(table, criteria)?;
        let values: Vec<QueryValue> = criteria.iter().map(|c| c.value.clone()).collect();
        Ok(self.query_rows(&sql, &values).await?.into_iter().next())
    }

    async fn insert(&self, table: &str, row: Row) -> StoreResult<Row> {
        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let sql = insert_sql(table, &columns)?;
        let payload = JsonValue::Object(row.clone());

        let inserted = if columns.is_empty() {
            let conn = self.get_conn().await?;
            conn.query_opt(&sql, &[])
                .await
                .map_err(query_error)?
                .map(|r| into_row(r.get::<_, JsonValue>(0)))
                .transpose()?
        } else {
            self.write_returning(&sql, &payload, &[]).await?
        };

        inserted.ok_or_else(|| StoreError::Query {
            reason: format!("INSERT into {} returned no row", table),
        })
    }

    async fn update(
        &self,
        table: &str,
        criteria: &[WhereCondition],
        changes: Row,
    ) -> StoreResult<Option<Row>> {
        if changes.is_empty() {
            return self.find_one(table, criteria).await;
        }
        let columns: Vec<&str> = changes.keys().map(String::as_str).collect();
        let sql = update_sql(table, &columns, criteria)?;
        let payload = JsonValue::Object(changes.clone());
        self.write_returning(&sql, &payload, criteria).await
    }

    async fn delete(&self, table: &str, criteria: &[WhereCondition]) -> StoreResult<u64> {
        let sql = delete_sql(table, criteria)?;
        let conn = self.get_conn().await?;
        let params: Vec<SqlParam> = criteria.iter().map(|c| SqlParam(&c.value)).collect();
        let sql_params: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_to_sql()).collect();
        conn.execute(&sql, &sql_params[..])
            .await
            .map_err(query_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::id_condition;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.max_size, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_db_config_from_vars() {
        let vars = [
            ("TRELLIS_DB_HOST", "db.internal"),
            ("TRELLIS_DB_PORT", "6543"),
            ("TRELLIS_DB_POOL_SIZE", "not-a-number"),
            ("TRELLIS_DB_TIMEOUT_SECS", "5"),
            ("UNRELATED", "x"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()));
        let config = DbConfig::from_vars(vars);
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 6543);
        assert_eq!(config.max_size, 16);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.dbname, "trellis");
    }

    #[test]
    fn test_db_config_rejects_empty_pool() {
        let config = DbConfig {
            max_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_find_one_sql() {
        let sql = find_one_sql("exercises", &[id_condition(42)]).unwrap();
        assert_eq!(sql, "SELECT to_jsonb(t) FROM exercises t WHERE id = $1 LIMIT 1");
    }

    #[test]
    fn test_insert_sql() {
        let sql = insert_sql("exercises", &["name", "difficulty"]).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO exercises (name, difficulty) SELECT name, difficulty \
             FROM jsonb_populate_record(NULL::exercises, $1::jsonb) RETURNING to_jsonb(exercises.*)"
        );
        assert_eq!(
            insert_sql("exercises", &[]).unwrap(),
            "INSERT INTO exercises DEFAULT VALUES RETURNING to_jsonb(exercises.*)"
        );
    }

    #[test]
    fn test_update_sql_numbers_criteria_after_payload() {
        let sql = update_sql("exercises", &["name"], &[id_condition(42)]).unwrap();
        assert_eq!(
            sql,
            "UPDATE exercises SET (name) = (SELECT name FROM jsonb_populate_record(NULL::exercises, $1::jsonb)) \
             WHERE id = $2 RETURNING to_jsonb(exercises.*)"
        );
    }

    #[test]
    fn test_delete_sql() {
        assert_eq!(
            delete_sql("exercises", &[id_condition("7")]).unwrap(),
            "DELETE FROM exercises WHERE id = $1"
        );
    }

    #[test]
    fn test_rejects_unsafe_names() {
        assert!(matches!(
            find_one_sql("exercises; DROP TABLE x", &[]),
            Err(StoreError::UnknownTable { .. })
        ));
        assert!(insert_sql("exercises", &["name\""]).is_err());
    }


    #[test]
    fn test_sql_param_binds_integer_to_int4() {
        let value = QueryValue::Integer(7);
        let mut out = BytesMut::new();
        let is_null = SqlParam(&value).to_sql(&Type::INT4, &mut out).unwrap();
        assert!(matches!(is_null, IsNull::No));
        assert_eq!(&out[..], &7i32.to_be_bytes());
    }

    #[test]
    fn test_sql_param_binds_text_to_uuid() {
        let value = QueryValue::Text("550e8400-e29b-41d4-a716-446655440000".to_string());
        let mut out = BytesMut::new();
        SqlParam(&value).to_sql(&Type::UUID, &mut out).unwrap();
        assert_eq!(out.len(), 16);

        let bad = QueryValue::Text("not-a-uuid".to_string());
        assert!(SqlParam(&bad).to_sql(&Type::UUID, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_sql_param_null() {
        let value = QueryValue::Null;
        let is_null = SqlParam(&value).to_sql(&Type::TEXT, &mut BytesMut::new()).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
    }
}
