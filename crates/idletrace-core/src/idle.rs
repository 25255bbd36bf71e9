//! Idle transactions
//!
//! An idle transaction has no known end. It watches its in-flight children
//! and finishes itself:
//!
//! - `idle_timeout` after the last child completes, or
//! - when the heartbeat sees the same set of in-flight children
//!   [`MAX_UNCHANGED_BEATS`] times in a row (a child that never finishes).
//!
//! Finishing cancels children that are still open and drops children that
//! started at or after the end timestamp.
//!
//! All mutable lifecycle state sits behind one mutex. Span hooks, the
//! before-finish callback and hub access run with it released; when the
//! recorder lock is also needed it is taken first.

use crate::activity::ActivityRegistry;
use crate::clock::{to_chrono, SharedClock, SystemClock, Timestamp};
use crate::error::{TraceError, TraceResult};
use crate::heartbeat::{
    Beat, HeartbeatState, HEARTBEAT_FAILED, HEARTBEAT_INTERVAL, HEARTBEAT_TAG,
    MAX_UNCHANGED_BEATS,
};
use crate::hub::Hub;
use crate::recorder::{ActivityHooks, SpanRecorder};
use crate::span::{Span, SpanStatus};
use crate::transaction::{Transaction, TransactionContext};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default grace period after the last child completes
pub const IDLE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Idle transaction options
#[derive(Debug, Clone)]
pub struct IdleTransactionOptions {
    /// Time to wait after the last child finishes
    pub idle_timeout: Duration,

    /// Publish the transaction as the hub scope's active transaction
    pub on_scope: bool,

    /// Maximum number of spans to record (root included)
    pub max_spans: Option<usize>,
}

impl Default for IdleTransactionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            on_scope: false,
            max_spans: None,
        }
    }
}

/// Callback run right before an idle transaction prunes its spans
pub type BeforeFinishCallback = Arc<dyn Fn(&IdleTransaction) + Send + Sync>;

/// Lifecycle of an idle transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Tracking activities
    Active,
    /// Finalizer claimed; callbacks and pruning in progress
    Finalizing,
    /// Terminal
    Finished,
}

struct IdleState {
    lifecycle: Lifecycle,
    activities: ActivityRegistry,
    heartbeat: HeartbeatState,
    before_finish: Option<BeforeFinishCallback>,
    heartbeat_task: Option<JoinHandle<()>>,
    /// Bumped on every push; an idle timer only fires if no activity was
    /// pushed since it was armed
    idle_epoch: u64,
}

struct IdleInner {
    transaction: Transaction,
    options: IdleTransactionOptions,
    /// Published onto the hub scope at construction
    on_scope: bool,
    runtime: Handle,
    state: Mutex<IdleState>,
    finished_tx: watch::Sender<bool>,
}

/// Handle to an idle transaction
#[derive(Clone)]
pub struct IdleTransaction {
    inner: Arc<IdleInner>,
}

impl fmt::Debug for IdleTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("IdleTransaction")
            .field("id", &self.inner.transaction.id())
            .field("name", &self.inner.transaction.name())
            .field("lifecycle", &state.lifecycle)
            .field("activities", &state.activities.len())
            .finish()
    }
}

impl IdleTransaction {
    /// Start an idle transaction
    ///
    /// Must be called from within a tokio runtime; the heartbeat starts
    /// immediately. The span recorder is not installed; see
    /// [`init_span_recorder`](Self::init_span_recorder) or
    /// [`Hub::start_idle_transaction`].
    pub fn new(
        context: TransactionContext,
        hub: Option<Arc<Hub>>,
        options: IdleTransactionOptions,
    ) -> TraceResult<Self> {
        Self::with_clock(context, hub, options, Arc::new(SystemClock))
    }

    pub fn with_clock(
        context: TransactionContext,
        hub: Option<Arc<Hub>>,
        options: IdleTransactionOptions,
        clock: SharedClock,
    ) -> TraceResult<Self> {
        let runtime = Handle::try_current().map_err(|_| TraceError::NoRuntime)?;
        if options.max_spans == Some(0) {
            return Err(TraceError::Config(
                "max_spans must be at least 1; leave it unset for no limit".to_string(),
            ));
        }

        let on_scope = options.on_scope && hub.is_some();
        let transaction = Transaction::with_clock(context, hub, clock);
        let (finished_tx, _) = watch::channel(false);

        let idle = Self {
            inner: Arc::new(IdleInner {
                transaction,
                options,
                on_scope,
                runtime,
                state: Mutex::new(IdleState {
                    lifecycle: Lifecycle::Active,
                    activities: ActivityRegistry::new(),
                    heartbeat: HeartbeatState::new(),
                    before_finish: None,
                    heartbeat_task: None,
                    idle_epoch: 0,
                }),
                finished_tx,
            }),
        };

        if idle.inner.on_scope {
            if let Some(hub) = idle.inner.transaction.hub() {
                hub.clear_active_transaction();
                let root = idle.inner.transaction.root().clone();
                hub.configure_scope(|scope| scope.set_span(Some(root)));
            }
        }

        debug!(
            "Starting idle transaction {} ({}), idle timeout {}ms",
            idle.inner.transaction.name(),
            idle.id(),
            idle.inner.options.idle_timeout.as_millis()
        );
        idle.start_heartbeat();

        Ok(idle)
    }

    /// Span id of the root span
    pub fn id(&self) -> String {
        self.inner.transaction.id()
    }

    /// The underlying transaction
    pub fn transaction(&self) -> &Transaction {
        &self.inner.transaction
    }

    pub fn options(&self) -> &IdleTransactionOptions {
        &self.inner.options
    }

    pub fn now(&self) -> Timestamp {
        self.inner.transaction.now()
    }

    pub fn start_child(&self, op: impl Into<String>) -> Span {
        self.inner.transaction.start_child(op)
    }

    pub fn set_status(&self, status: SpanStatus) {
        self.inner.transaction.set_status(status);
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.transaction.set_tag(key, value);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle() == Lifecycle::Finished
    }

    /// Sorted ids of in-flight children
    pub fn activities(&self) -> Vec<String> {
        self.inner.state.lock().activities.ids()
    }

    pub fn activity_count(&self) -> usize {
        self.inner.state.lock().activities.len()
    }

    /// Current count of consecutive unchanged heartbeats
    pub fn heartbeat_counter(&self) -> u32 {
        self.inner.state.lock().heartbeat.counter()
    }

    /// Register the before-finish callback, replacing any previous one
    pub fn before_finish(&self, callback: impl Fn(&IdleTransaction) + Send + Sync + 'static) {
        self.inner.state.lock().before_finish = Some(Arc::new(callback));
    }

    /// Install the activity-tracking span recorder
    pub fn init_span_recorder(&self, max_spans: Option<usize>) {
        let push_ref = Arc::downgrade(&self.inner);
        let pop_ref = push_ref.clone();

        let hooks = ActivityHooks {
            transaction_id: self.id(),
            push: Arc::new(move |span_id: &str| {
                if let Some(idle) = Self::upgrade(&push_ref) {
                    idle.push_activity(span_id);
                }
            }),
            pop: Arc::new(move |span_id: &str| {
                if let Some(idle) = Self::upgrade(&pop_ref) {
                    idle.pop_activity(span_id);
                }
            }),
        };

        self.inner
            .transaction
            .install_span_recorder(SpanRecorder::with_activity(max_spans, hooks));
    }

    /// Finish now, or at `end`
    pub fn finish(&self, end: Option<Timestamp>) -> Option<String> {
        let end = end.unwrap_or_else(|| self.now());
        self.finish_idle_transaction(end)
    }

    /// Finalize the transaction at `end`
    ///
    /// No-op if the transaction is no longer active or has no span
    /// recorder. Returns the reported event id.
    pub fn finish_idle_transaction(&self, end: Timestamp) -> Option<String> {
        if !self.inner.transaction.has_span_recorder() {
            debug!("No span recorder on idle transaction {}, nothing to finish", self.id());
            return None;
        }

        {
            let mut state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Active {
                debug!("Idle transaction {} already finishing", self.id());
                return None;
            }
            state.lifecycle = Lifecycle::Finalizing;
        }

        self.finalize(end)
    }

    /// Wait until the transaction has finished
    pub async fn wait_finished(&self) {
        let mut rx = self.inner.finished_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|finished| *finished).await;
    }

    fn upgrade(inner: &Weak<IdleInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    fn push_activity(&self, span_id: &str) {
        let mut state = self.inner.state.lock();
        if state.lifecycle != Lifecycle::Active {
            return;
        }
        state.activities.push(span_id);
        state.idle_epoch += 1;
        debug!(
            "Pushed activity {}, {} in flight",
            span_id,
            state.activities.len()
        );
    }

    fn pop_activity(&self, span_id: &str) {
        let epoch = {
            let mut state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Active {
                return;
            }
            if state.activities.pop(span_id) {
                debug!(
                    "Popped activity {}, {} in flight",
                    span_id,
                    state.activities.len()
                );
            }
            if !state.activities.is_empty() {
                return;
            }
            state.idle_epoch
        };

        self.arm_idle_timeout(epoch);
    }

    fn arm_idle_timeout(&self, epoch: u64) {
        let timeout = self.inner.options.idle_timeout;
        let now = self.now();
        let end = now
            .checked_add_signed(to_chrono(timeout))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
        debug!(
            "No activities left on {}, finishing in {}ms",
            self.id(),
            timeout.as_millis()
        );

        let idle = self.clone();
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            idle.fire_idle_timeout(epoch, end);
        });
    }

    fn fire_idle_timeout(&self, epoch: u64, end: Timestamp) {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Active
                || state.idle_epoch != epoch
                || !state.activities.is_empty()
            {
                return;
            }
            state.lifecycle = Lifecycle::Finalizing;
        }

        debug!("Idle timeout elapsed for {}", self.id());
        self.finalize(end);
    }

    fn start_heartbeat(&self) {
        let idle = self.clone();

        let task = self.inner.runtime.spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if idle.beat() == Beat::Stalled {
                    break;
                }
            }
        });

        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Active {
            state.heartbeat_task = Some(task);
        } else {
            task.abort();
        }
    }

    /// One heartbeat; `Stalled` stops the loop
    pub(crate) fn beat(&self) -> Beat {
        if self.inner.transaction.root().is_finished() {
            debug!("Transaction {} finished outside the idle lifecycle, stopping heartbeat", self.id());
            return Beat::Stalled;
        }

        let has_recorder = self.inner.transaction.has_span_recorder();
        let claimed = {
            let mut state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Active {
                debug!("Heartbeat stopped for {}", self.id());
                return Beat::Stalled;
            }

            let fingerprint = state.activities.fingerprint();
            if state.heartbeat.observe(fingerprint) == Beat::Continue {
                debug!(
                    "Heartbeat {}/{} for {}",
                    state.heartbeat.counter(),
                    MAX_UNCHANGED_BEATS,
                    self.id()
                );
                return Beat::Continue;
            }

            if has_recorder {
                state.lifecycle = Lifecycle::Finalizing;
            }
            has_recorder
        };

        warn!(
            "Idle transaction {} stalled for {} heartbeats, finishing",
            self.id(),
            MAX_UNCHANGED_BEATS
        );
        self.inner.transaction.set_status(SpanStatus::DeadlineExceeded);
        self.inner.transaction.set_tag(HEARTBEAT_TAG, HEARTBEAT_FAILED);
        if claimed {
            self.finalize(self.now());
        } else {
            debug!("No span recorder on idle transaction {}, nothing to finish", self.id());
        }
        Beat::Stalled
    }

    /// Runs once, after the caller moved the lifecycle to `Finalizing`
    fn finalize(&self, end: Timestamp) -> Option<String> {
        let (callback, heartbeat) = {
            let mut state = self.inner.state.lock();
            (state.before_finish.clone(), state.heartbeat_task.take())
        };
        if let Some(task) = heartbeat {
            task.abort();
        }

        debug!(
            "Finishing idle transaction {} at {}",
            self.id(),
            end.to_rfc3339()
        );

        if let Some(callback) = callback {
            callback(self);
        }

        self.prune_spans(end);

        {
            let mut state = self.inner.state.lock();
            state.lifecycle = Lifecycle::Finished;
            state.activities.clear();
        }

        if self.inner.on_scope {
            if let Some(hub) = self.inner.transaction.hub() {
                if hub.clear_transaction_if(self.inner.transaction.root()) {
                    debug!("Removed idle transaction {} from scope", self.id());
                }
            }
        }

        let event_id = self.inner.transaction.finish(Some(end));
        info!(
            "Idle transaction {} finished with status {}",
            self.inner.transaction.name(),
            self.inner
                .transaction
                .status()
                .map(|s| s.as_str())
                .unwrap_or("unset")
        );
        self.inner.finished_tx.send_replace(true);
        event_id
    }

    /// Cancel open children and drop those that started at or after `end`
    fn prune_spans(&self, end: Timestamp) {
        let root = self.inner.transaction.root();
        let mut slot = self.inner.transaction.recorder().lock();
        let Some(recorder) = slot.as_mut() else {
            return;
        };

        recorder.retain(|span| {
            if span.ptr_eq(root) {
                return true;
            }

            if span.cancel_at(end) {
                debug!(
                    "Cancelling span since transaction ended early: {}",
                    serde_json::to_string(&span.snapshot()).unwrap_or_default()
                );
            }

            let keep = span.start_timestamp() < end;
            if !keep {
                debug!(
                    "Discarding span that started after transaction end: {}",
                    serde_json::to_string(&span.snapshot()).unwrap_or_default()
                );
            }
            keep
        });
    }
}
