//! The statement-facing API that consumes statement output and coordinates test results

use chrono::NaiveDate;
use log::{debug, info, trace, warn};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::commune::CommuneRegistry;
use crate::config::{StressConfig, parse_date};
use crate::error::{Result, StressError};
use crate::listener::{ListenerStats, ResultsListener};
use crate::message::{Directive, Package, Response};
use crate::point::Precision;
use crate::retry::execute_with_retry;
use crate::storage::{MeasurementStore, Query, Series};

/// Length of generated test identifiers
pub const TEST_ID_LEN: usize = 10;

/// Test-state variables held by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestState {
    pub precision: Precision,
    pub start_date: NaiveDate,
    /// Points per results write; also the listener's flush threshold
    pub batch_size: usize,
}

impl Default for TestState {
    fn default() -> Self {
        Self {
            precision: Precision::Seconds,
            start_date: NaiveDate::from_ymd_opt(2016, 1, 2).unwrap_or_default(),
            batch_size: crate::batch::DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

/// Channel ends held by the external worker pool
pub struct WorkerChannels {
    pub packages: mpsc::Receiver<Package>,
    pub directives: mpsc::Receiver<Directive>,
    pub responses: mpsc::Sender<Response>,
}

/// Owns test configuration and the channels to the worker pool, and runs
/// the one results listener for the lifetime of a test.
pub struct Coordinator {
    test_id: String,
    test_db: String,
    state: Arc<RwLock<TestState>>,
    tags: Arc<BTreeMap<String, String>>,
    package_tx: mpsc::Sender<Package>,
    directive_tx: mpsc::Sender<Directive>,
    store: Arc<dyn MeasurementStore>,
    communes: CommuneRegistry,
    listener: Mutex<Option<JoinHandle<Result<ListenerStats>>>>,
}

impl Coordinator {
    /// Bootstrap the results database and start listening for results.
    /// Fails with a connection error if the store cannot be reached.
    pub async fn start(
        config: &StressConfig,
        store: Arc<dyn MeasurementStore>,
    ) -> Result<(Self, WorkerChannels)> {
        config.validate()?;

        let test_id = random_id(TEST_ID_LEN);
        let state = TestState {
            precision: config.precision()?,
            start_date: config.start_date()?,
            batch_size: config.batch_size,
        };

        let sink = store.as_ref();
        let database = config.test_db.as_str();
        execute_with_retry(
            || sink.create_database_if_not_exists(database),
            &config.retry,
            "create results database",
        )
        .await
        .map_err(|e| {
            StressError::Connection(format!(
                "results store '{}' unreachable: {}",
                store.name(),
                e
            ))
        })?;

        let tags = Arc::new(result_tags(&test_id, &config.tags));
        let capacity = config.channel_capacity.max(1);
        let (package_tx, package_rx) = mpsc::channel(capacity);
        let (directive_tx, directive_rx) = mpsc::channel(capacity);
        let (response_tx, response_rx) = mpsc::channel(capacity);

        let state = Arc::new(RwLock::new(state));
        let listener = ResultsListener::new(
            response_rx,
            Arc::clone(&store),
            config.test_db.clone(),
            Arc::clone(&state),
            Arc::clone(&tags),
        )
        .spawn();

        info!(
            "Test {} started, writing results to '{}' via {}",
            test_id,
            config.test_db,
            store.name()
        );

        let coordinator = Self {
            test_id,
            test_db: config.test_db.clone(),
            state,
            tags,
            package_tx,
            directive_tx,
            store,
            communes: CommuneRegistry::new(),
            listener: Mutex::new(Some(listener)),
        };
        let channels = WorkerChannels {
            packages: package_rx,
            directives: directive_rx,
            responses: response_tx,
        };
        Ok((coordinator, channels))
    }

    /// Hand a unit of work to the worker pool.
    /// Waits until the pool has room for it.
    pub async fn send_package(&self, package: Package) -> Result<()> {
        trace!("Sending package for statement {}", package.statement_id);
        self.package_tx
            .send(package)
            .await
            .map_err(|_| StressError::ChannelClosed("package"))
    }

    /// Forward a state change to the worker pool.
    /// Waits until the pool has room for it.
    pub async fn send_directive(&self, directive: Directive) -> Result<()> {
        debug!("Forwarding directive {} = {}", directive.property, directive.value);
        self.directive_tx
            .send(directive)
            .await
            .map_err(|_| StressError::ChannelClosed("directive"))
    }

    /// Wait for the results listener to finish and report how it ended
    pub async fn join_listener(&self) -> Result<ListenerStats> {
        let handle = self
            .listener
            .lock()
            .map_err(|_| StressError::Listener("Lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| StressError::Listener("listener already joined".to_string()))?;

        handle
            .await
            .map_err(|e| StressError::Listener(format!("listener task failed: {}", e)))?
    }

    /// Fetch every result row of `measurement` produced by one statement.
    /// Returns `None` when there are no matching rows.
    pub async fn get_statement_results(
        &self,
        statement_id: &str,
        measurement: &str,
    ) -> Result<Option<Vec<Series>>> {
        let query = Query::select(self.test_db.as_str(), measurement).filter("statement_id", statement_id);
        self.query_test_results(&query).await
    }

    /// Run a query against the results database
    pub async fn query_test_results(&self, query: &Query) -> Result<Option<Vec<Series>>> {
        debug!("Querying results: {}", query.command());
        let response = self.store.query(query).await?;
        if response.is_empty() {
            return Ok(None);
        }
        Ok(Some(response.series))
    }

    pub fn set_precision(&self, value: &str) -> Result<Precision> {
        let precision: Precision = value.parse()?;
        self.write_state(|state| state.precision = precision)?;
        Ok(precision)
    }

    pub fn set_start_date(&self, value: &str) -> Result<NaiveDate> {
        let date = parse_date(value)?;
        self.write_state(|state| state.start_date = date)?;
        Ok(date)
    }

    pub fn set_batch_size(&self, value: &str) -> Result<usize> {
        let size: usize = value
            .parse()
            .map_err(|e: std::num::ParseIntError| StressError::invalid("batchsize", value, e.to_string()))?;
        if size == 0 {
            return Err(StressError::invalid("batchsize", value, "must be at least 1"));
        }
        self.write_state(|state| state.batch_size = size)?;
        Ok(size)
    }

    /// A snapshot of the current test state
    pub fn state(&self) -> Result<TestState> {
        let state = self
            .state
            .read()
            .map_err(|_| StressError::Other("State lock poisoned".to_string()))?;
        Ok(state.clone())
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn test_db(&self) -> &str {
        &self.test_db
    }

    /// Tags merged into every result point
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn communes(&self) -> &CommuneRegistry {
        &self.communes
    }

    fn write_state(&self, apply: impl FnOnce(&mut TestState)) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StressError::Other("State lock poisoned".to_string()))?;
        apply(&mut state);
        debug!("Test state now {:?}", *state);
        Ok(())
    }
}

fn result_tags(test_id: &str, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut tags = extra.clone();
    match hostname::get().map(|h| h.into_string()) {
        Ok(Ok(host)) => {
            tags.insert("host".to_string(), host);
        }
        _ => warn!("Could not read hostname, results will not carry a host tag"),
    }
    tags.insert("test_id".to_string(), test_id.to_string());
    tags
}

fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
