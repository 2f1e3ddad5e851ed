use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;

use crate::batch::Batch;
use crate::error::Result;
use crate::point::Point;

/// In-memory store for testing
pub mod memory;

/// PostgreSQL-backed measurement store
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Time-series sink that results are written to
#[async_trait]
pub trait MeasurementStore: Send + Sync + 'static {
    /// Make sure the named results database exists
    async fn create_database_if_not_exists(&self, name: &str) -> Result<()>;

    /// Write a batch of points, returning how many were written
    async fn write(&self, batch: &Batch) -> Result<usize>;

    /// Run a query against a results database
    async fn query(&self, query: &Query) -> Result<QueryResponse>;

    /// Get a name for this store
    fn name(&self) -> &str;
}

/// An equality filter on a tag (or a field when no such tag exists)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub key: String,
    pub value: String,
}

/// A `SELECT *` query over one measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub database: String,
    pub measurement: String,
    pub conditions: Vec<Condition>,
}

impl Query {
    pub fn select(database: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            measurement: measurement.into(),
            conditions: Vec::new(),
        }
    }

    /// Add an equality filter
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push(Condition {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Whether a point satisfies this query
    pub fn matches(&self, point: &Point) -> bool {
        point.name() == self.measurement
            && self
                .conditions
                .iter()
                .all(|c| point.lookup(&c.key).as_deref() == Some(c.value.as_str()))
    }

    /// The query in InfluxQL form
    pub fn command(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT * FROM \"{}\"", self.measurement.replace('"', "\\\""))?;
        for (i, c) in self.conditions.iter().enumerate() {
            let keyword = if i == 0 { "WHERE" } else { "AND" };
            write!(f, " {} {} = '{}'", keyword, c.key, c.value.replace('\'', "\\'"))?;
        }
        Ok(())
    }
}

/// One series of result rows
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub columns: Vec<String>,
    pub values: Vec<Vec<serde_json::Value>>,
}

impl Series {
    /// Tabulate points into a series.
    /// Columns are `time`, then every tag key, then every field key, each group sorted.
    pub fn from_points(name: impl Into<String>, points: &[Point]) -> Self {
        let tag_keys: BTreeSet<&str> = points
            .iter()
            .flat_map(|p| p.tags().keys().map(String::as_str))
            .collect();
        let field_keys: BTreeSet<&str> = points
            .iter()
            .flat_map(|p| p.fields().keys().map(String::as_str))
            .filter(|k| !tag_keys.contains(k))
            .collect();

        let mut columns = vec!["time".to_string()];
        columns.extend(tag_keys.iter().map(|k| k.to_string()));
        columns.extend(field_keys.iter().map(|k| k.to_string()));

        let values = points
            .iter()
            .map(|p| {
                let mut row = Vec::with_capacity(columns.len());
                row.push(serde_json::Value::from(p.timestamp().to_rfc3339()));
                for key in &tag_keys {
                    row.push(
                        p.tags()
                            .get(*key)
                            .map_or(serde_json::Value::Null, |v| serde_json::Value::from(v.as_str())),
                    );
                }
                for key in &field_keys {
                    row.push(
                        p.fields()
                            .get(*key)
                            .map_or(serde_json::Value::Null, |v| v.to_json()),
                    );
                }
                row
            })
            .collect();

        Self {
            name: name.into(),
            columns,
            values,
        }
    }

    /// Value of `column` in row `row`
    pub fn get(&self, row: usize, column: &str) -> Option<&serde_json::Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(row)?.get(idx)
    }
}

/// The result of a query; an empty response is a normal outcome
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub series: Vec<Series>,
}

impl QueryResponse {
    /// Build a response holding one series, or none if `points` is empty
    pub fn from_points(measurement: &str, points: &[Point]) -> Self {
        if points.is_empty() {
            return Self::default();
        }
        Self {
            series: vec![Series::from_points(measurement, points)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.series.iter().all(|s| s.values.is_empty())
    }
}
