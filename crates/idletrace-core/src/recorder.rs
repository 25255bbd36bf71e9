//! Span recorder - the ordered collection of a transaction's spans
//!
//! The idle variant additionally reports every child to an activity
//! listener: a push when an open child is recorded, and a pop (via the span's
//! completion hook) when that child finishes.

use crate::span::{CompletionHook, Span};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Recorder slot shared between a transaction and its spans
pub(crate) type SharedRecorder = Arc<Mutex<Option<SpanRecorder>>>;

/// Weak handle held by spans so they can record their own children
pub(crate) type RecorderRef = Weak<Mutex<Option<SpanRecorder>>>;

/// Activity callbacks for the idle variant
#[derive(Clone)]
pub struct ActivityHooks {
    /// Id of the owning transaction; never tracked as an activity
    pub transaction_id: String,

    /// Called with the id of an open child when it is recorded
    pub push: CompletionHook,

    /// Installed as the child's completion hook
    pub pop: CompletionHook,
}

/// Ordered collection of recorded spans
pub struct SpanRecorder {
    max_spans: Option<usize>,
    spans: Vec<Span>,
    activity: Option<ActivityHooks>,
    dropped: usize,
}

impl SpanRecorder {
    /// Plain recorder
    pub fn new(max_spans: Option<usize>) -> Self {
        Self {
            max_spans,
            spans: Vec::new(),
            activity: None,
            dropped: 0,
        }
    }

    /// Recorder that tracks open children as activities
    pub fn with_activity(max_spans: Option<usize>, hooks: ActivityHooks) -> Self {
        Self {
            activity: Some(hooks),
            ..Self::new(max_spans)
        }
    }

    /// Record a span
    ///
    /// Activity tracking happens even when the span is not stored because the
    /// recorder is full, so its completion still reaches the listener.
    pub fn add(&mut self, span: Span) {
        if let Some(hooks) = &self.activity {
            let span_id = span.span_id();
            if span_id != hooks.transaction_id {
                if !span.is_finished() {
                    (hooks.push)(&span_id);
                }
                if !span.set_completion_hook(hooks.pop.clone()) {
                    debug!("Span {} already has a completion hook", span_id);
                }
            }
        }

        if let Some(max) = self.max_spans {
            if self.spans.len() >= max {
                self.dropped += 1;
                debug!(
                    "Span recorder full ({} spans), not recording {}",
                    max,
                    span.span_id()
                );
                return;
            }
        }

        self.spans.push(span);
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Spans that were not stored because of `max_spans`
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn max_spans(&self) -> Option<usize> {
        self.max_spans
    }

    pub(crate) fn retain(&mut self, keep: impl FnMut(&Span) -> bool) {
        self.spans.retain(keep);
    }
}
