use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{MeasurementStore, Query, QueryResponse};
use crate::batch::Batch;
use crate::error::{Result, StressError};
use crate::point::Point;

/// An in-memory measurement store for testing.
/// Keeps every written batch so tests can inspect batching behaviour.
pub struct MemoryStore {
    databases: RwLock<HashMap<String, Vec<Point>>>,
    batches: RwLock<Vec<Batch>>,
    fail_writes: AtomicBool,
    name: String,
}

impl MemoryStore {
    /// Create a new memory store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            batches: RwLock::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            name: name.into(),
        }
    }

    /// Make subsequent writes fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every batch written so far, in write order
    pub fn batches(&self) -> Result<Vec<Batch>> {
        let batches = self
            .batches
            .read()
            .map_err(|_| StressError::Write("Lock poisoned".to_string()))?;
        Ok(batches.clone())
    }

    /// All points held in a database, in write order
    pub fn points(&self, database: &str) -> Result<Vec<Point>> {
        let databases = self
            .databases
            .read()
            .map_err(|_| StressError::Query("Lock poisoned".to_string()))?;
        Ok(databases.get(database).cloned().unwrap_or_default())
    }

    /// Names of the databases that exist
    pub fn databases(&self) -> Result<Vec<String>> {
        let databases = self
            .databases
            .read()
            .map_err(|_| StressError::Query("Lock poisoned".to_string()))?;
        Ok(databases.keys().cloned().collect())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn create_database_if_not_exists(&self, name: &str) -> Result<()> {
        let mut databases = self
            .databases
            .write()
            .map_err(|_| StressError::Connection("Lock poisoned".to_string()))?;
        databases.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn write(&self, batch: &Batch) -> Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            warn!("Memory store '{}' rejecting write of {} points", self.name, batch.len());
            return Err(StressError::Write(format!(
                "store '{}' is refusing writes",
                self.name
            )));
        }

        let mut databases = self
            .databases
            .write()
            .map_err(|_| StressError::Write("Lock poisoned".to_string()))?;
        let points = databases.get_mut(batch.database()).ok_or_else(|| {
            StressError::Write(format!("database not found: {}", batch.database()))
        })?;
        points.extend_from_slice(batch.points());

        let mut batches = self
            .batches
            .write()
            .map_err(|_| StressError::Write("Lock poisoned".to_string()))?;
        batches.push(batch.clone());

        debug!("Memory store '{}' wrote {} points", self.name, batch.len());
        Ok(batch.len())
    }

    async fn query(&self, query: &Query) -> Result<QueryResponse> {
        let databases = self
            .databases
            .read()
            .map_err(|_| StressError::Query("Lock poisoned".to_string()))?;
        let points = databases
            .get(&query.database)
            .ok_or_else(|| StressError::Query(format!("database not found: {}", query.database)))?;

        let matching: Vec<Point> = points.iter().filter(|p| query.matches(p)).cloned().collect();
        Ok(QueryResponse::from_points(&query.measurement, &matching))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(database: &str, points: Vec<Point>) -> Batch {
        let mut batch = Batch::new(database);
        for p in points {
            batch.push(p);
        }
        batch
    }

    #[tokio::test]
    async fn test_write_requires_database() {
        let store = MemoryStore::default();
        let batch = batch_of("missing", vec![Point::new("req")]);
        assert!(matches!(store.write(&batch).await, Err(StressError::Write(_))));

        store.create_database_if_not_exists("missing").await.unwrap();
        assert_eq!(store.write(&batch).await.unwrap(), 1);
        assert_eq!(store.batches().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_query_filters_rows() {
        let store = MemoryStore::default();
        store.create_database_if_not_exists("db").await.unwrap();
        let batch = batch_of(
            "db",
            vec![
                Point::new("req").tag("statement_id", "a").field("n", 1i64),
                Point::new("req").tag("statement_id", "b").field("n", 2i64),
                Point::new("req").tag("statement_id", "a").field("n", 3i64),
            ],
        );
        store.write(&batch).await.unwrap();

        let res = store
            .query(&Query::select("db", "req").filter("statement_id", "a"))
            .await
            .unwrap();
        assert_eq!(res.series.len(), 1);
        assert_eq!(res.series[0].values.len(), 2);
        assert_eq!(res.series[0].get(1, "n"), Some(&serde_json::Value::from(3)));

        let none = store
            .query(&Query::select("db", "req").filter("statement_id", "zzz"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryStore::default();
        store.create_database_if_not_exists("db").await.unwrap();
        store.set_fail_writes(true);
        let batch = batch_of("db", vec![Point::new("req")]);
        assert!(store.write(&batch).await.is_err());
        assert!(store.points("db").unwrap().is_empty());

        store.set_fail_writes(false);
        assert_eq!(store.write(&batch).await.unwrap(), 1);
    }
}
