//! Spans - timed operations within a transaction
//!
//! A [`Span`] is a cheap, cloneable handle around shared span data. The
//! transaction's recorder keeps one handle per child while callers keep their
//! own to tag and finish the span. A recorder may install a single completion
//! hook on a span; the hook runs after the span's own `finish` has stamped the
//! end timestamp.

use crate::clock::{SharedClock, Timestamp};
use crate::recorder::RecorderRef;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Hook invoked with the span id once a span completes
pub type CompletionHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Span status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    DeadlineExceeded,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    ResourceExhausted,
    InvalidArgument,
    Unimplemented,
    Unavailable,
    InternalError,
    UnknownError,
    Cancelled,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    DataLoss,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Ok => "ok",
            SpanStatus::DeadlineExceeded => "deadline_exceeded",
            SpanStatus::Unauthenticated => "unauthenticated",
            SpanStatus::PermissionDenied => "permission_denied",
            SpanStatus::NotFound => "not_found",
            SpanStatus::ResourceExhausted => "resource_exhausted",
            SpanStatus::InvalidArgument => "invalid_argument",
            SpanStatus::Unimplemented => "unimplemented",
            SpanStatus::Unavailable => "unavailable",
            SpanStatus::InternalError => "internal_error",
            SpanStatus::UnknownError => "unknown_error",
            SpanStatus::Cancelled => "cancelled",
            SpanStatus::AlreadyExists => "already_exists",
            SpanStatus::FailedPrecondition => "failed_precondition",
            SpanStatus::Aborted => "aborted",
            SpanStatus::OutOfRange => "out_of_range",
            SpanStatus::DataLoss => "data_loss",
        }
    }

    /// Map an HTTP response status code onto a span status
    pub fn from_http_code(code: u16) -> Self {
        match code {
            200..=299 => SpanStatus::Ok,
            401 => SpanStatus::Unauthenticated,
            403 => SpanStatus::PermissionDenied,
            404 => SpanStatus::NotFound,
            409 => SpanStatus::AlreadyExists,
            413 => SpanStatus::FailedPrecondition,
            429 => SpanStatus::ResourceExhausted,
            400..=499 => SpanStatus::InvalidArgument,
            501 => SpanStatus::Unimplemented,
            503 => SpanStatus::Unavailable,
            504 => SpanStatus::DeadlineExceeded,
            500..=599 => SpanStatus::InternalError,
            _ => SpanStatus::UnknownError,
        }
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain data of a span, as serialized into reports and debug logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanData {
    pub span_id: String,

    pub trace_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub start_timestamp: Timestamp,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SpanStatus>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl SpanData {
    /// Duration in milliseconds, if finished
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_timestamp
            .map(|end| (end - self.start_timestamp).num_milliseconds().max(0))
    }
}

/// 32 hex chars
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// 16 hex chars
pub fn generate_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

struct SpanInner {
    data: Mutex<SpanData>,
    clock: SharedClock,
    recorder: Option<RecorderRef>,
    on_finish: OnceCell<CompletionHook>,
}

/// Handle to a span
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("data", &*self.inner.data.lock())
            .field("hooked", &self.inner.on_finish.get().is_some())
            .finish()
    }
}

impl Span {
    pub(crate) fn from_data(data: SpanData, clock: SharedClock, recorder: Option<RecorderRef>) -> Self {
        Self {
            inner: Arc::new(SpanInner {
                data: Mutex::new(data),
                clock,
                recorder,
                on_finish: OnceCell::new(),
            }),
        }
    }

    pub fn span_id(&self) -> String {
        self.inner.data.lock().span_id.clone()
    }

    pub fn trace_id(&self) -> String {
        self.inner.data.lock().trace_id.clone()
    }

    pub fn parent_span_id(&self) -> Option<String> {
        self.inner.data.lock().parent_span_id.clone()
    }

    pub fn op(&self) -> Option<String> {
        self.inner.data.lock().op.clone()
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.inner.data.lock().start_timestamp
    }

    pub fn end_timestamp(&self) -> Option<Timestamp> {
        self.inner.data.lock().end_timestamp
    }

    pub fn status(&self) -> Option<SpanStatus> {
        self.inner.data.lock().status
    }

    pub fn is_finished(&self) -> bool {
        self.inner.data.lock().end_timestamp.is_some()
    }

    pub fn set_status(&self, status: SpanStatus) {
        self.inner.data.lock().status = Some(status);
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.data.lock().tags.insert(key.into(), value.into());
    }

    pub fn set_data(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.data.lock().data.insert(key.into(), value);
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.inner.data.lock().description = Some(description.into());
    }

    /// Override the start timestamp (e.g. for spans reconstructed after the fact)
    pub fn set_start_timestamp(&self, ts: Timestamp) {
        self.inner.data.lock().start_timestamp = ts;
    }

    /// Copy of the current span data
    pub fn snapshot(&self) -> SpanData {
        self.inner.data.lock().clone()
    }

    /// Same underlying span
    pub fn ptr_eq(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Start a child span sharing this span's trace and recorder
    pub fn start_child(&self, op: impl Into<String>) -> Span {
        let (trace_id, parent) = {
            let data = self.inner.data.lock();
            (data.trace_id.clone(), data.span_id.clone())
        };

        let child = Span::from_data(
            SpanData {
                span_id: generate_span_id(),
                trace_id,
                parent_span_id: Some(parent),
                op: Some(op.into()),
                description: None,
                start_timestamp: self.inner.clock.now(),
                end_timestamp: None,
                status: None,
                tags: BTreeMap::new(),
                data: BTreeMap::new(),
            },
            self.inner.clock.clone(),
            self.inner.recorder.clone(),
        );

        if let Some(recorder) = self.inner.recorder.as_ref().and_then(|r| r.upgrade()) {
            if let Some(recorder) = recorder.lock().as_mut() {
                recorder.add(child.clone());
            }
        }

        child
    }

    /// Finish the span
    ///
    /// Keeps an existing end timestamp, otherwise uses `end` or the clock.
    /// The completion hook, if one was installed, runs afterwards.
    pub fn finish(&self, end: Option<Timestamp>) {
        let span_id = {
            let mut data = self.inner.data.lock();
            if data.end_timestamp.is_none() {
                data.end_timestamp = Some(end.unwrap_or_else(|| self.inner.clock.now()));
            }
            data.span_id.clone()
        };

        if let Some(hook) = self.inner.on_finish.get() {
            hook(&span_id);
        }
    }

    /// Install the completion hook. Returns false if one is already set.
    pub(crate) fn set_completion_hook(&self, hook: CompletionHook) -> bool {
        self.inner.on_finish.set(hook).is_ok()
    }

    /// End an unfinished span at `end` with a cancelled status, bypassing the
    /// completion hook. Returns true if the span was open.
    pub(crate) fn cancel_at(&self, end: Timestamp) -> bool {
        let mut data = self.inner.data.lock();
        if data.end_timestamp.is_some() {
            return false;
        }
        data.end_timestamp = Some(end);
        data.status = Some(SpanStatus::Cancelled);
        true
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn root(clock: SharedClock) -> Span {
        let now = clock.now();
        Span::from_data(
            SpanData {
                span_id: generate_span_id(),
                trace_id: generate_trace_id(),
                parent_span_id: None,
                op: Some("root".to_string()),
                description: None,
                start_timestamp: now,
                end_timestamp: None,
                status: None,
                tags: BTreeMap::new(),
                data: BTreeMap::new(),
            },
            clock,
            None,
        )
    }

    #[test]
    fn test_ids() {
        assert_eq!(generate_trace_id().len(), 32);
        assert_eq!(generate_span_id().len(), 16);
        assert_ne!(generate_span_id(), generate_span_id());
    }

    #[test]
    fn test_status_from_http_code() {
        assert_eq!(SpanStatus::from_http_code(204), SpanStatus::Ok);
        assert_eq!(SpanStatus::from_http_code(401), SpanStatus::Unauthenticated);
        assert_eq!(SpanStatus::from_http_code(418), SpanStatus::InvalidArgument);
        assert_eq!(SpanStatus::from_http_code(429), SpanStatus::ResourceExhausted);
        assert_eq!(SpanStatus::from_http_code(504), SpanStatus::DeadlineExceeded);
        assert_eq!(SpanStatus::from_http_code(502), SpanStatus::InternalError);
        assert_eq!(SpanStatus::from_http_code(301), SpanStatus::UnknownError);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&SpanStatus::DeadlineExceeded).unwrap();
        assert_eq!(json, "\"deadline_exceeded\"");
        assert_eq!(SpanStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_child_inherits_trace() {
        let parent = root(Arc::new(SystemClock));
        let child = parent.start_child("db.query");

        assert_eq!(child.trace_id(), parent.trace_id());
        assert_eq!(child.parent_span_id(), Some(parent.span_id()));
        assert_eq!(child.op().as_deref(), Some("db.query"));
        assert!(!child.is_finished());
    }

    #[test]
    fn test_finish_keeps_first_end_timestamp() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let span = root(clock.clone());

        clock.advance(Duration::seconds(2));
        span.finish(None);
        assert_eq!(span.end_timestamp(), Some(start + Duration::seconds(2)));

        span.finish(Some(start + Duration::seconds(9)));
        assert_eq!(span.end_timestamp(), Some(start + Duration::seconds(2)));
        assert_eq!(span.snapshot().duration_ms(), Some(2000));
    }

    #[test]
    fn test_finish_with_explicit_timestamp() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let span = root(Arc::new(ManualClock::new(start)));
        span.finish(Some(start + Duration::milliseconds(40)));
        assert_eq!(span.end_timestamp(), Some(start + Duration::milliseconds(40)));
    }

    #[test]
    fn test_completion_hook_runs_after_end_is_set() {
        let span = root(Arc::new(SystemClock));
        let calls = Arc::new(AtomicUsize::new(0));

        let observed = span.clone();
        let counter = calls.clone();
        let installed = span.set_completion_hook(Arc::new(move |id: &str| {
            assert!(observed.is_finished());
            assert_eq!(id, observed.span_id());
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(installed);
        assert!(!span.set_completion_hook(Arc::new(|_: &str| {})));

        span.finish(None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_at_only_touches_open_spans() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let span = root(Arc::new(ManualClock::new(start)));

        assert!(span.cancel_at(start + Duration::seconds(1)));
        assert_eq!(span.status(), Some(SpanStatus::Cancelled));
        assert!(!span.cancel_at(start + Duration::seconds(5)));
        assert_eq!(span.end_timestamp(), Some(start + Duration::seconds(1)));
    }

    #[test]
    fn test_snapshot_json_skips_empty_fields() {
        let span = root(Arc::new(SystemClock));
        let json = serde_json::to_value(span.snapshot()).unwrap();
        assert!(json.get("end_timestamp").is_none());
        assert!(json.get("tags").is_none());
        assert_eq!(json["op"], "root");
    }
}
