//! Reporters - where finished transactions go
//!
//! A reporter receives each finished transaction exactly once. Failures are
//! logged by the caller and never change transaction state.

use crate::clock::Timestamp;
use crate::error::TraceResult;
use crate::span::{SpanData, SpanStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A finished transaction as handed to reporters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedTransaction {
    /// Id of this report
    pub event_id: String,

    pub trace_id: String,

    /// Span id of the transaction's root span
    pub span_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,

    pub start_timestamp: Timestamp,

    pub end_timestamp: Timestamp,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SpanStatus>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// Finished child spans, root excluded
    pub spans: Vec<SpanData>,
}

impl FinishedTransaction {
    pub fn duration_ms(&self) -> i64 {
        (self.end_timestamp - self.start_timestamp)
            .num_milliseconds()
            .max(0)
    }

    /// Find a child span by id
    pub fn span(&self, span_id: &str) -> Option<&SpanData> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }
}

/// Sink for finished transactions
pub trait Reporter: Send + Sync {
    /// Reporter name (for logs)
    fn name(&self) -> &str;

    /// Accept a finished transaction
    fn report(&self, transaction: &FinishedTransaction) -> TraceResult<()>;

    /// Flush buffered output
    fn flush(&self) -> TraceResult<()> {
        Ok(())
    }
}

/// Keeps finished transactions in memory
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<FinishedTransaction>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FinishedTransaction> {
        self.events.lock().clone()
    }

    pub fn last(&self) -> Option<FinishedTransaction> {
        self.events.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drain all stored events
    pub fn take(&self) -> Vec<FinishedTransaction> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl Reporter for MemoryReporter {
    fn name(&self) -> &str {
        "memory"
    }

    fn report(&self, transaction: &FinishedTransaction) -> TraceResult<()> {
        self.events.lock().push(transaction.clone());
        Ok(())
    }
}

/// Logs each finished transaction as one JSON line at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn name(&self) -> &str {
        "log"
    }

    fn report(&self, transaction: &FinishedTransaction) -> TraceResult<()> {
        let json = serde_json::to_string(transaction)?;
        info!(
            "Transaction {} finished after {}ms: {}",
            transaction.name,
            transaction.duration_ms(),
            json
        );
        Ok(())
    }
}

/// Forwards each transaction to several reporters
///
/// Every reporter is tried; the first error is returned.
pub struct MultiReporter {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new(reporters: Vec<Arc<dyn Reporter>>) -> Self {
        Self { reporters }
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Reporter for MultiReporter {
    fn name(&self) -> &str {
        "multi"
    }

    fn report(&self, transaction: &FinishedTransaction) -> TraceResult<()> {
        let mut first_error = None;
        for reporter in &self.reporters {
            if let Err(e) = reporter.report(transaction) {
                warn!("Reporter {} failed: {}", reporter.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn flush(&self) -> TraceResult<()> {
        for reporter in &self.reporters {
            reporter.flush()?;
        }
        Ok(())
    }
}

/// JSONL reporter configuration
#[derive(Debug, Clone)]
pub struct JsonlReporterConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to existing file
    pub append: bool,

    /// Flush after each write
    pub flush_each: bool,
}

impl Default for JsonlReporterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/idletrace-transactions.jsonl"),
            append: true,
            flush_each: true,
        }
    }
}

/// Appends one JSON object per finished transaction to a file
pub struct JsonlReporter {
    config: JsonlReporterConfig,
    writer: Mutex<BufWriter<File>>,
    written: AtomicU64,
}

impl JsonlReporter {
    /// Open (or create) the output file
    pub fn open(config: JsonlReporterConfig) -> TraceResult<Self> {
        let file = if config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?
        } else {
            File::create(&config.path)?
        };
        info!("JSONL reporter writing to: {:?}", config.path);

        Ok(Self {
            config,
            writer: Mutex::new(BufWriter::new(file)),
            written: AtomicU64::new(0),
        })
    }

    /// Number of transactions written so far
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl Reporter for JsonlReporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn report(&self, transaction: &FinishedTransaction) -> TraceResult<()> {
        let line = serde_json::to_string(transaction)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        if self.config.flush_each {
            writer.flush()?;
        }
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> TraceResult<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}
