#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use sql_multiplex::config::DatabaseTarget;
use sql_multiplex::{NativeConnection, NativeDriver, ResultSet, RowValues, SqlMultiplexError};

/// Initialize tracing for tests (only logs errors unless `RUST_LOG` says otherwise).
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
pub struct DriverLog {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub executes: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub opened_names: Mutex<Vec<String>>,
}

/// Native driver that records what the multiplexer asks of it.
///
/// Every `execute` holds the connection for `work` and flags an overlap if
/// another thread is inside the same connection at the same time.
#[derive(Debug)]
pub struct RecordingDriver {
    pub log: Arc<DriverLog>,
    pub fail_open: AtomicBool,
    pub work: Duration,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Self::with_work(Duration::ZERO)
    }

    pub fn with_work(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(DriverLog::default()),
            fail_open: AtomicBool::new(false),
            work,
        })
    }

    pub fn opens(&self) -> usize {
        self.log.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.log.closes.load(Ordering::SeqCst)
    }

    pub fn overlaps(&self) -> usize {
        self.log.overlaps.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.log.executes.load(Ordering::SeqCst)
    }
}

impl NativeDriver for RecordingDriver {
    fn name(&self) -> &str {
        "recording"
    }

    fn open(
        &self,
        connection_name: &str,
        _target: &DatabaseTarget,
    ) -> Result<Box<dyn NativeConnection>, SqlMultiplexError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SqlMultiplexError::ConnectionError(format!(
                "{connection_name}: server unreachable"
            )));
        }
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        self.log.opened_names.lock().push(connection_name.to_string());
        Ok(Box::new(RecordingConnection {
            log: Arc::clone(&self.log),
            busy: Arc::new(AtomicUsize::new(0)),
            work: self.work,
        }))
    }
}

struct RecordingConnection {
    log: Arc<DriverLog>,
    busy: Arc<AtomicUsize>,
    work: Duration,
}

impl NativeConnection for RecordingConnection {
    fn prepare(&mut self, sql: &str) -> Result<(), SqlMultiplexError> {
        if sql.trim().is_empty() {
            return Err(SqlMultiplexError::ExecutionError("empty statement".into()));
        }
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlMultiplexError> {
        if self.busy.fetch_add(1, Ordering::SeqCst) > 0 {
            self.log.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.work.is_zero() {
            thread::sleep(self.work);
        }
        self.busy.fetch_sub(1, Ordering::SeqCst);
        self.log.executes.fetch_add(1, Ordering::SeqCst);

        if sql.starts_with("ECHO") {
            let mut result_set = ResultSet::with_capacity(1);
            result_set.set_column_names(Arc::new(
                (0..params.len()).map(|i| format!("p{i}")).collect(),
            ));
            result_set.add_row_values(params.to_vec());
            return Ok(result_set);
        }
        Ok(ResultSet::affected(params.len()))
    }

    fn execute_batch(&mut self, _sql: &str) -> Result<(), SqlMultiplexError> {
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), SqlMultiplexError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn driver_handle(driver: &Arc<RecordingDriver>) -> Arc<dyn NativeDriver> {
    Arc::clone(driver) as Arc<dyn NativeDriver>
}
