//! idletrace core - idle transactions for tracing
//!
//! An idle transaction is a root span with no known end. It tracks its
//! in-flight children and finishes itself once they drain (plus a grace
//! period) or once a heartbeat sees no progress for too long.
//!
//! - **Spans**: cloneable span handles and their serializable data
//! - **Transactions**: the base transaction and its span recorder
//! - **Idle**: activity tracking, idle timeout, heartbeat, finalization
//! - **Hub**: scope (active transaction) and reporter wiring
//! - **Config**: TOML config with env overrides

pub mod activity;
pub mod clock;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod hub;
pub mod idle;
pub mod recorder;
pub mod reporter;
pub mod span;
pub mod transaction;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, Timestamp};
pub use config::{ConfigLoader, IdletraceConfig};
pub use error::{TraceError, TraceResult};
pub use hub::{Hub, Scope};
pub use idle::{IdleTransaction, IdleTransactionOptions, Lifecycle};
pub use reporter::{
    FinishedTransaction, JsonlReporter, JsonlReporterConfig, LogReporter, MemoryReporter, MultiReporter,
    Reporter,
};
pub use span::{Span, SpanData, SpanStatus};
pub use transaction::{Transaction, TransactionContext};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
