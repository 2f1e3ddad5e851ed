use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::BTreeMap;
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use super::{MeasurementStore, Query, QueryResponse};
use crate::batch::Batch;
use crate::config::DatabaseConfig;
use crate::connection::postgres::create_pool;
use crate::error::{Result, StressError};
use crate::point::{FieldValue, Point};
use crate::retry::{RetryConfig, execute_with_retry};

/// Table that holds result points inside each results schema
const POINTS_TABLE: &str = "points";

/// PostgreSQL measurement store.
///
/// Each results database is a schema containing one `points` table; tags
/// and fields are stored as JSONB and timestamps as nanoseconds.
pub struct PostgresStore {
    pool: deadpool_postgres::Pool,
    name: String,
}

impl PostgresStore {
    /// Create a pool and check the server is reachable
    pub async fn connect(config: &DatabaseConfig, retry: &RetryConfig) -> Result<Self> {
        let pool = create_pool(config)
            .map_err(|e| StressError::Connection(format!("{:#}", e)))?;

        let pool_ref = &pool;
        execute_with_retry(|| probe(pool_ref), retry, "connect to results store")
            .await
            .map_err(|e| StressError::Connection(e.to_string()))?;

        info!(
            "Connected to results store at {}:{}/{}",
            config.host, config.port, config.name
        );

        Ok(Self {
            pool,
            name: format!("postgres://{}:{}/{}", config.host, config.port, config.name),
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client> {
        self.pool
            .get()
            .await
            .map_err(|e| StressError::Connection(format!("Failed to get client from pool: {}", e)))
    }
}

async fn probe(pool: &deadpool_postgres::Pool) -> anyhow::Result<()> {
    use anyhow::Context;

    let client = pool.get().await.context("Failed to connect to database")?;
    client
        .execute("SELECT 1", &[])
        .await
        .context("Failed to execute test query")?;
    Ok(())
}

#[async_trait]
impl MeasurementStore for PostgresStore {
    async fn create_database_if_not_exists(&self, name: &str) -> Result<()> {
        let client = self.client().await?;
        let sql = create_database_sql(name);
        debug!("Creating results schema with SQL: {}", sql);
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| StressError::Connection(e.to_string()))
    }

    async fn write(&self, batch: &Batch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StressError::Write(e.to_string()))?;
        let stmt = tx
            .prepare_cached(&insert_sql(batch.database()))
            .await
            .map_err(|e| StressError::Write(e.to_string()))?;

        for point in batch.points() {
            let time_ns = point.timestamp_nanos().ok_or_else(|| {
                StressError::Write(format!("timestamp out of range: {}", point.timestamp()))
            })?;
            let tags = serde_json::to_value(point.tags())
                .map_err(|e| StressError::Write(e.to_string()))?;
            let fields = serde_json::to_value(point.fields())
                .map_err(|e| StressError::Write(e.to_string()))?;
            let measurement = point.name();

            tx.execute(
                &stmt,
                &[&Uuid::new_v4(), &measurement, &tags, &fields, &time_ns],
            )
            .await
            .map_err(|e| StressError::Write(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StressError::Write(e.to_string()))?;
        Ok(batch.len())
    }

    async fn query(&self, query: &Query) -> Result<QueryResponse> {
        let client = self.client().await?;
        let sql = select_sql(query);

        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&query.measurement];
        for condition in &query.conditions {
            params.push(&condition.key);
            params.push(&condition.value);
        }

        debug!("Running results query: {}", sql);
        let rows = client
            .query(sql.as_str(), &params)
            .await
            .map_err(|e| StressError::Query(e.to_string()))?;

        let points = rows
            .iter()
            .map(|row| row_to_point(&query.measurement, row))
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryResponse::from_points(&query.measurement, &points))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn row_to_point(measurement: &str, row: &Row) -> Result<Point> {
    let time_ns: i64 = row
        .try_get("time_ns")
        .map_err(|e| StressError::Query(e.to_string()))?;
    let tags: serde_json::Value = row
        .try_get("tags")
        .map_err(|e| StressError::Query(e.to_string()))?;
    let fields: serde_json::Value = row
        .try_get("fields")
        .map_err(|e| StressError::Query(e.to_string()))?;

    let tags: BTreeMap<String, String> =
        serde_json::from_value(tags).map_err(|e| StressError::Query(e.to_string()))?;
    let fields: BTreeMap<String, FieldValue> =
        serde_json::from_value(fields).map_err(|e| StressError::Query(e.to_string()))?;

    Ok(Point::from_parts(
        measurement,
        tags,
        fields,
        DateTime::<Utc>::from_timestamp_nanos(time_ns),
    ))
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn points_table(database: &str) -> String {
    format!("{}.{}", quote_ident(database), POINTS_TABLE)
}

fn create_database_sql(database: &str) -> String {
    let schema = quote_ident(database);
    let table = points_table(database);
    format!(
        "CREATE SCHEMA IF NOT EXISTS {schema}; \
         CREATE TABLE IF NOT EXISTS {table} (\
         seq BIGSERIAL PRIMARY KEY, \
         id UUID NOT NULL, \
         measurement TEXT NOT NULL, \
         tags JSONB NOT NULL, \
         fields JSONB NOT NULL, \
         time_ns BIGINT NOT NULL); \
         CREATE INDEX IF NOT EXISTS points_measurement_idx ON {table} (measurement)"
    )
}

fn insert_sql(database: &str) -> String {
    format!(
        "INSERT INTO {} (id, measurement, tags, fields, time_ns) VALUES ($1, $2, $3, $4, $5)",
        points_table(database)
    )
}

fn select_sql(query: &Query) -> String {
    let mut sql = format!(
        "SELECT time_ns, tags, fields FROM {} WHERE measurement = $1",
        points_table(&query.database)
    );
    for i in 0..query.conditions.len() {
        let key = 2 + i * 2;
        let value = key + 1;
        sql.push_str(&format!(
            " AND COALESCE(tags ->> ${key}::text, fields ->> ${key}::text) = ${value}::text"
        ));
    }
    sql.push_str(" ORDER BY seq");
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_are_quoted() {
        assert_eq!(quote_ident("_stressTest"), "\"_stressTest\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(points_table("_stressTest"), "\"_stressTest\".points");
    }

    #[test]
    fn test_create_database_sql() {
        let sql = create_database_sql("_stressTest");
        assert!(sql.starts_with("CREATE SCHEMA IF NOT EXISTS \"_stressTest\";"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS \"_stressTest\".points ("));
        assert!(sql.contains("time_ns BIGINT NOT NULL"));
    }

    #[test]
    fn test_insert_sql() {
        assert_eq!(
            insert_sql("db"),
            "INSERT INTO \"db\".points (id, measurement, tags, fields, time_ns) VALUES ($1, $2, $3, $4, $5)"
        );
    }

    #[test]
    fn test_select_sql_numbers_parameters() {
        let query = Query::select("db", "req")
            .filter("statement_id", "a")
            .filter("method", "GET");
        assert_eq!(
            select_sql(&query),
            "SELECT time_ns, tags, fields FROM \"db\".points WHERE measurement = $1 \
             AND COALESCE(tags ->> $2::text, fields ->> $2::text) = $3::text \
             AND COALESCE(tags ->> $4::text, fields ->> $4::text) = $5::text \
             ORDER BY seq"
        );
    }

    #[test]
    fn test_select_sql_without_conditions() {
        let query = Query::select("db", "req");
        assert_eq!(
            select_sql(&query),
            "SELECT time_ns, tags, fields FROM \"db\".points WHERE measurement = $1 ORDER BY seq"
        );
    }
}
