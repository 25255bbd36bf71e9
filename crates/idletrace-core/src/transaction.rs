//! Base transaction - a root span plus its recorder
//!
//! A transaction owns the root span and the recorder that collects every
//! span started beneath it. Finishing stamps the root, builds a
//! [`FinishedTransaction`] from the finished children and hands it to the
//! hub's reporter.

use crate::clock::{SharedClock, SystemClock, Timestamp};
use crate::hub::Hub;
use crate::recorder::{SharedRecorder, SpanRecorder};
use crate::reporter::FinishedTransaction;
use crate::span::{generate_span_id, generate_trace_id, Span, SpanData, SpanStatus};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name used when a transaction is finished without one
pub const UNLABELED_TRANSACTION: &str = "<unlabeled transaction>";

/// Parameters for starting a transaction
#[derive(Debug, Clone, Default)]
pub struct TransactionContext {
    pub name: String,

    pub op: Option<String>,

    /// Continue an existing trace instead of starting a new one
    pub trace_id: Option<String>,

    pub parent_span_id: Option<String>,

    pub tags: BTreeMap<String, String>,
}

impl TransactionContext {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: Some(op.into()),
            ..Default::default()
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, parent_span_id: Option<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.parent_span_id = parent_span_id;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Root unit of a trace
pub struct Transaction {
    root: Span,
    /// Upstream span this transaction continues, if any
    parent_span_id: Option<String>,
    name: Mutex<String>,
    recorder: SharedRecorder,
    hub: Option<Arc<Hub>>,
    finished: AtomicBool,
}

impl Transaction {
    pub fn new(context: TransactionContext, hub: Option<Arc<Hub>>) -> Self {
        Self::with_clock(context, hub, Arc::new(SystemClock))
    }

    pub fn with_clock(context: TransactionContext, hub: Option<Arc<Hub>>, clock: SharedClock) -> Self {
        let recorder: SharedRecorder = Arc::new(Mutex::new(None));
        let root = Span::from_data(
            SpanData {
                span_id: generate_span_id(),
                trace_id: context.trace_id.unwrap_or_else(generate_trace_id),
                parent_span_id: None,
                op: context.op,
                description: None,
                start_timestamp: clock.now(),
                end_timestamp: None,
                status: None,
                tags: context.tags,
                data: BTreeMap::new(),
            },
            clock,
            Some(Arc::downgrade(&recorder)),
        );

        Self {
            root,
            parent_span_id: context.parent_span_id,
            name: Mutex::new(context.name),
            recorder,
            hub,
            finished: AtomicBool::new(false),
        }
    }

    /// Span id of the root span
    pub fn id(&self) -> String {
        self.root.span_id()
    }

    pub fn trace_id(&self) -> String {
        self.root.trace_id()
    }

    pub fn root(&self) -> &Span {
        &self.root
    }

    pub fn hub(&self) -> Option<&Arc<Hub>> {
        self.hub.as_ref()
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.root.start_timestamp()
    }

    pub fn end_timestamp(&self) -> Option<Timestamp> {
        self.root.end_timestamp()
    }

    pub fn op(&self) -> Option<String> {
        self.root.op()
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    pub fn status(&self) -> Option<SpanStatus> {
        self.root.status()
    }

    pub fn set_status(&self, status: SpanStatus) {
        self.root.set_status(status);
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.root.set_tag(key, value);
    }

    pub fn now(&self) -> Timestamp {
        self.root.clock().now()
    }

    /// Start a child of the root span; recorded if a recorder is installed
    pub fn start_child(&self, op: impl Into<String>) -> Span {
        self.root.start_child(op)
    }

    /// Install a plain recorder and record the root span in it
    pub fn init_span_recorder(&self, max_spans: Option<usize>) {
        self.install_span_recorder(SpanRecorder::new(max_spans));
    }

    /// Install `recorder` and record the root span in it
    ///
    /// Does nothing if a recorder is already installed.
    pub fn install_span_recorder(&self, mut recorder: SpanRecorder) {
        let mut slot = self.recorder.lock();
        if slot.is_some() {
            debug!("Transaction {} already has a span recorder", self.id());
            return;
        }
        recorder.add(self.root.clone());
        *slot = Some(recorder);
    }

    pub fn has_span_recorder(&self) -> bool {
        self.recorder.lock().is_some()
    }

    /// Snapshot of every recorded span, root included
    pub fn spans(&self) -> Vec<SpanData> {
        self.recorder
            .lock()
            .as_ref()
            .map(|r| r.spans().iter().map(Span::snapshot).collect())
            .unwrap_or_default()
    }

    pub(crate) fn recorder(&self) -> &SharedRecorder {
        &self.recorder
    }

    /// Build the report for this transaction ending at `end`
    pub fn to_finished(&self, end: Timestamp) -> FinishedTransaction {
        let root = self.root.snapshot();
        let spans = self
            .recorder
            .lock()
            .as_ref()
            .map(|r| {
                r.spans()
                    .iter()
                    .filter(|s| !s.ptr_eq(&self.root))
                    .map(Span::snapshot)
                    .filter(|s| s.end_timestamp.is_some())
                    .collect()
            })
            .unwrap_or_default();

        FinishedTransaction {
            event_id: uuid::Uuid::new_v4().simple().to_string(),
            trace_id: root.trace_id,
            span_id: root.span_id,
            parent_span_id: self.parent_span_id.clone(),
            name: self.name(),
            op: root.op,
            start_timestamp: root.start_timestamp,
            end_timestamp: root.end_timestamp.unwrap_or(end),
            status: root.status,
            tags: root.tags,
            spans,
        }
    }

    /// Finish the transaction and report it
    ///
    /// Returns the reported event id, or `None` if the transaction was
    /// already finished or there is nowhere to report it.
    pub fn finish(&self, end: Option<Timestamp>) -> Option<String> {
        if self.finished.swap(true, Ordering::SeqCst) || self.root.is_finished() {
            return None;
        }

        {
            let mut name = self.name.lock();
            if name.is_empty() {
                warn!(
                    "Transaction has no name, falling back to `{}`",
                    UNLABELED_TRANSACTION
                );
                *name = UNLABELED_TRANSACTION.to_string();
            }
        }

        self.root.finish(end);
        if self.root.status().is_none() {
            self.root.set_status(SpanStatus::Ok);
        }

        let end = self.root.end_timestamp().unwrap_or_else(|| self.now());
        let event = self.to_finished(end);
        debug!(
            "Finishing transaction {} ({} spans, {}ms)",
            event.name,
            event.spans.len(),
            event.duration_ms()
        );

        match &self.hub {
            Some(hub) => hub.capture_transaction(event),
            None => {
                debug!("Transaction {} has no hub, not reporting", event.name);
                None
            }
        }
    }
}
